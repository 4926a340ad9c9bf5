//! Hooks for the interactive development loop.
//!
//! [`DevHooks`] narrates the launch on the script console, collects the URLs a
//! developer can open for every bound socket, and keeps the latest runtime
//! failure so the loop can point at the offending source line.

use crate::context::ExecutionContext;
use crate::failure::Failure;
use crate::hooks::LaunchHooks;
use crate::locate::locate;
use crate::sockets::{default_socket, SocketResult, SocketSpec};
use crate::{lock, CoreError};
use kiln_http::{HttpServer, MemoryLog, RequestLog, TeeLog};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SITEMAP_TIMEOUT: Duration = Duration::from_secs(2);
/// Requests kept for inspection while a dev engine runs.
pub const REQUEST_HISTORY: usize = 1000;

pub struct DevHooks {
    compile_started: Mutex<Option<Instant>>,
    service_urls: Mutex<Vec<String>>,
    last_error: Mutex<Option<Failure>>,
    requests: Arc<MemoryLog>,
    fetch_sitemap: bool,
}

impl Default for DevHooks {
    fn default() -> Self {
        Self {
            compile_started: Mutex::new(None),
            service_urls: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            requests: Arc::new(MemoryLog::bounded(REQUEST_HISTORY)),
            fetch_sitemap: true,
        }
    }
}

impl DevHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip probing `/sitemap.xml` after each bind.
    #[must_use]
    pub fn without_sitemap(mut self) -> Self {
        self.fetch_sitemap = false;
        self
    }

    /// Service roots of every bound socket plus any pages listed in their sitemaps.
    pub fn service_urls(&self) -> Vec<String> {
        lock(&self.service_urls).clone()
    }

    pub fn last_error(&self) -> Option<Failure> {
        lock(&self.last_error).clone()
    }

    /// Source line of the latest runtime failure, when it can be located.
    pub fn error_line(&self) -> Option<u32> {
        lock(&self.last_error).as_ref().and_then(locate)
    }

    pub fn clear_error(&self) {
        lock(&self.last_error).take();
    }

    /// The latest [`REQUEST_HISTORY`] requests of the running engine; emptied at teardown.
    pub fn requests(&self) -> Arc<MemoryLog> {
        Arc::clone(&self.requests)
    }
}

impl LaunchHooks for DevHooks {
    fn on_compile_start(&self, context: &ExecutionContext, _source: &str) -> Result<(), CoreError> {
        *lock(&self.compile_started) = Some(Instant::now());
        context.println(&format!(
            "Compilation started {}",
            chrono::Local::now().to_rfc2822()
        ));
        Ok(())
    }

    fn on_compile_end(&self, context: &ExecutionContext, _source: &str) -> Result<(), CoreError> {
        let elapsed = lock(&self.compile_started)
            .take()
            .map_or(0, |started| started.elapsed().as_millis());
        context.println(&format!(
            "Compilation completed OK {} ({elapsed} ms)",
            chrono::Local::now().to_rfc2822()
        ));
        Ok(())
    }

    fn on_server_create(
        &self,
        _context: &ExecutionContext,
        program_log: Option<Arc<dyn RequestLog>>,
    ) -> Result<Arc<dyn RequestLog>, CoreError> {
        let requests: Arc<dyn RequestLog> = self.requests.clone();
        Ok(match program_log {
            Some(log) => Arc::new(TeeLog::new(vec![log, requests])),
            None => requests,
        })
    }

    fn on_default_socket_needed(
        &self,
        context: &ExecutionContext,
        port_base: u16,
    ) -> Result<SocketSpec, CoreError> {
        let spec = default_socket(port_base)?;
        context.println(&format!("No socket defined in source - using {spec}"));
        Ok(spec)
    }

    fn on_socket_result(
        &self,
        context: &ExecutionContext,
        _server: &HttpServer,
        result: &SocketResult,
    ) -> Result<(), CoreError> {
        let Some(addr) = result.addr else {
            if let Some(e) = &result.error {
                context.println(&format!("Error listening on {}: {e}", result.spec));
            }
            return Ok(());
        };

        let root = service_root(result.spec.secure, addr.port());
        context.println(&format!("Server listening on {} ({root})", result.spec));
        let mut urls = vec![root.clone()];
        if self.fetch_sitemap {
            match fetch_sitemap(&root) {
                Ok(xml) => urls.extend(sitemap_paths(&xml).iter().map(|p| resolve(&root, p))),
                Err(reason) => context.println(&format!("No sitemap.xml found ({reason})")),
            }
        }
        lock(&self.service_urls).extend(urls);
        Ok(())
    }

    fn on_launch_complete(
        &self,
        context: &ExecutionContext,
        server: Option<&HttpServer>,
        listening: bool,
    ) -> Result<(), CoreError> {
        let now = chrono::Local::now().to_rfc2822();
        match server {
            Some(_) if listening => context.println(&format!("{now} Server started")),
            Some(_) => context.println(&format!("{now} Server not listening on any socket")),
            None => context.println(&format!("{now} Script declares no server")),
        }
        Ok(())
    }

    fn on_runtime_error(&self, failure: &Failure) {
        warn!("script error: {failure}");
        *lock(&self.last_error) = Some(failure.clone());
    }

    fn on_stopped(&self, context: Option<&ExecutionContext>) -> Result<(), CoreError> {
        lock(&self.service_urls).clear();
        self.requests.clear();
        if let Some(context) = context {
            context.println(&format!(
                "Engine runtime stopped at {}",
                chrono::Local::now().to_rfc2822()
            ));
        }
        Ok(())
    }
}

/// Local URL of a socket; default ports are left implicit.
pub fn service_root(secure: bool, port: u16) -> String {
    match (secure, port) {
        (true, 443) => "https://localhost/".to_owned(),
        (true, port) => format!("https://localhost:{port}/"),
        (false, 80) => "http://localhost/".to_owned(),
        (false, port) => format!("http://localhost:{port}/"),
    }
}

fn fetch_sitemap(root: &str) -> Result<String, String> {
    let url = resolve(root, "/sitemap.xml");
    debug!("probing {url}");
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(SITEMAP_TIMEOUT))
        .build()
        .into();
    let mut resp = agent.get(&url).call().map_err(|e| e.to_string())?;
    resp.body_mut().read_to_string().map_err(|e| e.to_string())
}

/// Paths of every `<loc>` entry in a sitemap document, whitespace stripped.
pub fn sitemap_paths(xml: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<loc>") {
        let after = &rest[start + "<loc>".len()..];
        let Some(end) = after.find("</loc>") else {
            break;
        };
        let loc: String = after[..end].chars().filter(|c| !c.is_whitespace()).collect();
        paths.push(url_path(&loc).to_owned());
        rest = &after[end + "</loc>".len()..];
    }
    paths
}

fn url_path(url: &str) -> &str {
    match url.find("://") {
        Some(scheme_end) => {
            let host_and_path = &url[scheme_end + 3..];
            host_and_path.find('/').map_or("/", |i| &host_and_path[i..])
        }
        None => url,
    }
}

fn resolve(root: &str, path: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), path.trim_start_matches('/'))
}
