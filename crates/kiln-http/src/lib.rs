//! HTTP server used by the kiln engine.
//!
//! A single [`HttpServer`] owns one request handler and one request log and can
//! listen on any number of sockets. Each successful [`HttpServer::listen_on`] call
//! spawns an accept thread that dispatches requests to the handler; [`HttpServer::close`]
//! unblocks and joins every accept thread.
//!
//! Once closed, a server never opens another socket: a bind that completes after
//! `close()` is torn down immediately and reported as [`BindError::Closed`].

pub mod log;

pub use log::{LogEntry, MemoryLog, NullLog, RequestLog, TeeLog, TracingLog};
pub use tiny_http::{Method, Request};

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tiny_http::{Header, Response, StatusCode};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Error)]
pub enum BindError {
    #[error("failed to listen on {addr}: {reason}")]
    Listen { addr: String, reason: String },
    #[error("secure socket requested on {addr} but no TLS certificate is configured")]
    TlsUnavailable { addr: String },
    #[error("server is closed")]
    Closed,
}

/// Produces a reply for every request received on any socket of a server.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &mut Request) -> Reply;
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.to_owned(),
            body: body.into(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body.into())
    }

    pub fn not_found() -> Self {
        Self::text(404, "not found")
    }
}

/// PEM encoded certificate chain and private key for secure sockets.
#[derive(Clone)]
pub struct TlsConfig {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl TlsConfig {
    pub fn from_pem_files(certificate: &Path, private_key: &Path) -> std::io::Result<Self> {
        Ok(Self {
            certificate: std::fs::read(certificate)?,
            private_key: std::fs::read(private_key)?,
        })
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

struct Listener {
    server: Arc<tiny_http::Server>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Listeners {
    closed: bool,
    open: Vec<Listener>,
}

/// A request handler served on zero or more sockets.
pub struct HttpServer {
    handler: Arc<dyn RequestHandler>,
    log: Arc<dyn RequestLog>,
    tls: Option<TlsConfig>,
    listeners: Mutex<Listeners>,
}

impl HttpServer {
    pub fn new(handler: Arc<dyn RequestHandler>, log: Arc<dyn RequestLog>) -> Self {
        Self {
            handler,
            log,
            tls: None,
            listeners: Mutex::new(Listeners::default()),
        }
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        // Accept threads never hold this lock, so poisoning can only come from a
        // panic between push and unlock; the list itself is still consistent.
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Bind one socket and start serving on it.
    ///
    /// `bind_address` defaults to all interfaces. Port 0 asks the OS for a free
    /// port; the returned address carries the port actually bound.
    pub fn listen_on(
        &self,
        port: u16,
        secure: bool,
        bind_address: Option<&str>,
    ) -> Result<SocketAddr, BindError> {
        if self.listeners().closed {
            return Err(BindError::Closed);
        }

        let addr = socket_address(bind_address, port);
        let server = if secure {
            let Some(tls) = &self.tls else {
                return Err(BindError::TlsUnavailable { addr });
            };
            tiny_http::Server::https(
                addr.as_str(),
                tiny_http::SslConfig {
                    certificate: tls.certificate.clone(),
                    private_key: tls.private_key.clone(),
                },
            )
        } else {
            tiny_http::Server::http(addr.as_str())
        }
        .map_err(|e| BindError::Listen {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        let server = Arc::new(server);
        let local = server.server_addr().to_ip().ok_or_else(|| BindError::Listen {
            addr: addr.clone(),
            reason: "bound address is not an IP socket".to_owned(),
        })?;

        let srv = Arc::clone(&server);
        let handler = Arc::clone(&self.handler);
        let log = Arc::clone(&self.log);
        let handle = std::thread::Builder::new()
            .name(format!("kiln-http-{}", local.port()))
            .spawn(move || serve(&srv, local, handler.as_ref(), log.as_ref()))
            .map_err(|e| BindError::Listen {
                addr: addr.clone(),
                reason: format!("failed to spawn accept thread: {e}"),
            })?;

        let mut listeners = self.listeners();
        if listeners.closed {
            drop(listeners);
            server.unblock();
            let _ = handle.join();
            debug!("closed {local} opened after server shutdown");
            return Err(BindError::Closed);
        }
        listeners.open.push(Listener {
            server,
            addr: local,
            handle,
        });
        info!("listening on {local}{}", if secure { " (tls)" } else { "" });
        Ok(local)
    }

    /// Stop serving on every socket. Idempotent.
    pub fn close(&self) {
        let open = {
            let mut listeners = self.listeners();
            listeners.closed = true;
            std::mem::take(&mut listeners.open)
        };
        for listener in &open {
            listener.server.unblock();
        }
        for listener in open {
            if listener.handle.join().is_err() {
                warn!("accept thread for {} panicked", listener.addr);
            } else {
                debug!("stopped listening on {}", listener.addr);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.listeners().closed
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners().open.iter().map(|l| l.addr).collect()
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn socket_address(bind_address: Option<&str>, port: u16) -> String {
    match bind_address {
        Some(host) if host.contains(':') && !host.starts_with('[') => format!("[{host}]:{port}"),
        Some(host) => format!("{host}:{port}"),
        None => format!("0.0.0.0:{port}"),
    }
}

fn serve(
    server: &tiny_http::Server,
    local: SocketAddr,
    handler: &dyn RequestHandler,
    log: &dyn RequestLog,
) {
    for mut request in server.incoming_requests() {
        let started = Instant::now();
        let method = request.method().clone();
        let url = request.url().to_owned();
        let remote = request.remote_addr().copied();
        debug!("{method} {url}");

        let reply = catch_unwind(AssertUnwindSafe(|| handler.handle(&mut request)))
            .unwrap_or_else(|_| {
                error!("{method} {url}: request handler panicked");
                Reply::text(500, "internal server error")
            });

        let entry = LogEntry {
            local,
            remote,
            method: method.to_string(),
            url,
            status: reply.status,
            bytes: reply.body.len(),
            elapsed: started.elapsed(),
        };
        log.request_processed(&entry);
        respond(request, reply, method == Method::Head);
    }
}

fn respond(request: Request, reply: Reply, head_only: bool) {
    let body = if head_only { Vec::new() } else { reply.body };
    let mut response = Response::from_data(body).with_status_code(StatusCode(reply.status));
    match Header::from_bytes("Content-Type", reply.content_type.as_bytes()) {
        Ok(header) => response = response.with_header(header),
        Err(()) => warn!("dropping invalid content type {:?}", reply.content_type),
    }
    if let Err(e) = request.respond(response) {
        debug!("failed to send response: {e}");
    }
}
