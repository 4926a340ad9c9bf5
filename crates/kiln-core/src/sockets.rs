use crate::CoreError;
use kiln_http::{BindError, HttpServer};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tracing::{debug, warn};

/// Number of ports scanned above the port base for the default socket.
pub const DEFAULT_PORT_RANGE: u16 = 128;

/// A request to listen on one port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketSpec {
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub bind_address: Option<String>,
}

impl SocketSpec {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            secure: false,
            bind_address: None,
        }
    }

    #[must_use]
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    #[must_use]
    pub fn bind_address(mut self, address: &str) -> Self {
        self.bind_address = Some(address.to_owned());
        self
    }
}

impl std::fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        let host = self.bind_address.as_deref().unwrap_or("*");
        write!(f, "{scheme}://{host}:{}", self.port)
    }
}

/// Outcome of binding one [`SocketSpec`].
#[derive(Debug, Clone)]
pub struct SocketResult {
    pub spec: SocketSpec,
    /// Address actually bound; `None` when every attempt failed.
    pub addr: Option<SocketAddr>,
    /// Last failure observed when the socket could not be bound.
    pub error: Option<BindError>,
    pub attempts: u32,
}

impl SocketResult {
    pub fn bound(&self) -> bool {
        self.addr.is_some()
    }
}

/// Fixed-count, fixed-delay retry policy for binding one socket.
///
/// A port may still be held by a process instance that just exited; a short
/// bounded retry rides that out without blocking indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for BindRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(100),
        }
    }
}

/// Bind `spec` on `server`, retrying per `retry`.
///
/// Returns on the first success. A closed server or a secure socket without TLS
/// material cannot succeed on a later attempt, so those end the retry early.
pub fn bind_with_retry(server: &HttpServer, spec: &SocketSpec, retry: &BindRetry) -> SocketResult {
    let attempts = retry.attempts.max(1);
    let mut last_error = None;
    let mut tried = 0;

    for attempt in 1..=attempts {
        tried = attempt;
        match server.listen_on(spec.port, spec.secure, spec.bind_address.as_deref()) {
            Ok(addr) => {
                return SocketResult {
                    spec: spec.clone(),
                    addr: Some(addr),
                    error: None,
                    attempts: attempt,
                };
            }
            Err(e @ (BindError::Closed | BindError::TlsUnavailable { .. })) => {
                last_error = Some(e);
                break;
            }
            Err(e) => {
                debug!("bind attempt {attempt}/{attempts} for {spec} failed: {e}");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            std::thread::sleep(retry.delay);
        }
    }

    if let Some(e) = &last_error {
        warn!("giving up on {spec} after {tried} attempt(s): {e}");
    }
    SocketResult {
        spec: spec.clone(),
        addr: None,
        error: last_error,
        attempts: tried,
    }
}

/// First port in `from..to` that can currently be bound on `bind_address`.
pub fn first_free_port(bind_address: Option<&str>, from: u16, to: u16) -> Option<u16> {
    let host = bind_address.unwrap_or("0.0.0.0");
    (from..to).find(|&port| TcpListener::bind((host, port)).is_ok())
}

/// Synthesize the default socket: the first free port in
/// `port_base..port_base + DEFAULT_PORT_RANGE`.
pub fn default_socket(port_base: u16) -> Result<SocketSpec, CoreError> {
    let to = port_base.saturating_add(DEFAULT_PORT_RANGE);
    first_free_port(None, port_base, to)
        .map(SocketSpec::new)
        .ok_or(CoreError::NoFreePort {
            from: port_base,
            to,
        })
}

/// Declared sockets in order, or exactly one default socket when none are declared.
pub fn resolve_sockets<F>(declared: Vec<SocketSpec>, default: F) -> Result<Vec<SocketSpec>, CoreError>
where
    F: FnOnce() -> Result<SocketSpec, CoreError>,
{
    if declared.is_empty() {
        Ok(vec![default()?])
    } else {
        Ok(declared)
    }
}
