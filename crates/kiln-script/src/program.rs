use crate::template::{split_url, Template};
use kiln_core::{locate, CompiledProgram, Console, Failure, Frame, SocketSpec, TOP_LEVEL_SOURCE};
use kiln_http::{LogEntry, Reply, Request, RequestHandler, RequestLog, TlsConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone)]
pub enum RouteBody {
    Bytes(Vec<u8>),
    /// Rendered per request; `line` is where the body was written.
    Template { template: Template, line: u32 },
}

#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub content_type: String,
    pub body: RouteBody,
}

/// Serves the routes of a compiled site script.
pub struct SiteHandler {
    routes: HashMap<String, Route>,
    console: Console,
}

impl SiteHandler {
    pub fn new(routes: HashMap<String, Route>, console: Console) -> Self {
        Self { routes, console }
    }

    pub fn reply_for(&self, url: &str) -> Reply {
        let (path, query) = split_url(url);
        let Some(route) = self.routes.get(path) else {
            return Reply::not_found();
        };

        match &route.body {
            RouteBody::Bytes(bytes) => Reply::new(route.status, &route.content_type, bytes.clone()),
            RouteBody::Template { template, line } => match template.render(&query) {
                Ok(body) => Reply::new(route.status, &route.content_type, body),
                Err(e) => {
                    let failure = Failure::new(format!("{path}: {e}"))
                        .with_frame(Frame::script(TOP_LEVEL_SOURCE, *line));
                    self.report(&failure);
                    Reply::text(500, format!("script error: {}", failure.message()))
                }
            },
        }
    }

    fn report(&self, failure: &Failure) {
        match locate(failure) {
            Some(line) => {
                warn!("script error at line {line}: {failure}");
                self.console
                    .println(&format!("Script error (line {line}): {failure}"));
            }
            None => {
                warn!("script error: {failure}");
                self.console.println(&format!("Script error: {failure}"));
            }
        }
    }
}

impl RequestHandler for SiteHandler {
    fn handle(&self, request: &mut Request) -> Reply {
        self.reply_for(request.url())
    }
}

/// Request log that echoes each request to the script console.
pub struct ConsoleLog {
    console: Console,
}

impl ConsoleLog {
    pub fn new(console: Console) -> Self {
        Self { console }
    }
}

impl RequestLog for ConsoleLog {
    fn request_processed(&self, entry: &LogEntry) {
        self.console.println(&entry.to_string());
    }
}

/// Output of [`crate::ScriptCompiler`].
pub struct SiteProgram {
    pub(crate) handler: Option<Arc<SiteHandler>>,
    pub(crate) sockets: Vec<SocketSpec>,
    pub(crate) request_log: Option<Arc<ConsoleLog>>,
    pub(crate) tls: Option<TlsConfig>,
}

impl SiteProgram {
    pub fn routes(&self) -> usize {
        self.handler.as_ref().map_or(0, |h| h.routes.len())
    }
}

impl std::fmt::Debug for SiteProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteProgram")
            .field("routes", &self.routes())
            .field("sockets", &self.sockets)
            .field("request_log", &self.request_log.is_some())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl CompiledProgram for SiteProgram {
    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler
            .clone()
            .map(|handler| handler as Arc<dyn RequestHandler>)
    }

    fn sockets(&self) -> Vec<SocketSpec> {
        self.sockets.clone()
    }

    fn request_log(&self) -> Option<Arc<dyn RequestLog>> {
        self.request_log
            .clone()
            .map(|log| log as Arc<dyn RequestLog>)
    }

    fn tls(&self) -> Option<TlsConfig> {
        self.tls.clone()
    }
}
