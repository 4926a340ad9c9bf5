//! Production launch policy and the host loop that supervises an engine.

use crate::commands::POLL_INTERVAL;
use kiln_core::{
    default_socket, locate, CoreError, Engine, ExecutionContext, Failure, LaunchHooks,
    ShutdownSignal, SocketResult, SocketSpec,
};
use kiln_http::{HttpServer, RequestLog, TracingLog};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// Hooks for unattended launches: any socket that fails to bind is fatal and so
/// is ending up with a server that listens nowhere.
#[derive(Default)]
pub struct ProductionHooks {
    failure: Mutex<Option<Failure>>,
}

impl ProductionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// First runtime failure reported by the engine.
    pub fn failure(&self) -> Option<Failure> {
        self.failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl LaunchHooks for ProductionHooks {
    fn on_compile_start(&self, _context: &ExecutionContext, source: &str) -> Result<(), CoreError> {
        info!("compiling script ({} bytes)", source.len());
        Ok(())
    }

    fn on_compile_end(&self, _context: &ExecutionContext, _source: &str) -> Result<(), CoreError> {
        info!("script compiled");
        Ok(())
    }

    fn on_server_create(
        &self,
        _context: &ExecutionContext,
        program_log: Option<Arc<dyn RequestLog>>,
    ) -> Result<Arc<dyn RequestLog>, CoreError> {
        debug!("creating server");
        Ok(program_log.unwrap_or_else(|| Arc::new(TracingLog)))
    }

    fn on_default_socket_needed(
        &self,
        _context: &ExecutionContext,
        port_base: u16,
    ) -> Result<SocketSpec, CoreError> {
        let spec = default_socket(port_base)?;
        info!("no socket declared, using {spec}");
        Ok(spec)
    }

    fn on_socket_result(
        &self,
        _context: &ExecutionContext,
        _server: &HttpServer,
        result: &SocketResult,
    ) -> Result<(), CoreError> {
        match (&result.addr, &result.error) {
            (Some(addr), _) => {
                info!("listening on {} ({addr})", result.spec);
                Ok(())
            }
            (None, Some(e)) => Err(CoreError::Bind {
                socket: result.spec.clone(),
                source: e.clone(),
            }),
            (None, None) => Err(CoreError::Hook(format!(
                "socket {} was neither bound nor failed",
                result.spec
            ))),
        }
    }

    fn on_launch_complete(
        &self,
        _context: &ExecutionContext,
        server: Option<&HttpServer>,
        listening: bool,
    ) -> Result<(), CoreError> {
        match server {
            Some(_) if !listening => Err(CoreError::NotListening),
            Some(server) => {
                info!("engine running on {} socket(s)", server.local_addrs().len());
                Ok(())
            }
            None => {
                info!("script declares no server");
                Ok(())
            }
        }
    }

    fn on_runtime_error(&self, failure: &Failure) {
        match locate(failure) {
            Some(line) => error!("script error at line {line}: {failure}"),
            None => error!("{failure}"),
        }
        debug!("{}", failure.report());
        let mut slot = self
            .failure
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.get_or_insert_with(|| failure.clone());
    }

    fn on_stopped(&self, _context: Option<&ExecutionContext>) -> Result<(), CoreError> {
        info!("engine runtime stopped");
        Ok(())
    }
}

/// Supervise `engine` until it stops.
///
/// Console output is handed to `emit` as it appears. A shutdown signal or a
/// stop requested by the script stops the engine.
pub fn host_loop(engine: &Engine, shutdown: &ShutdownSignal, mut emit: impl FnMut(&str)) {
    loop {
        let output = engine.flush_output();
        if !output.is_empty() {
            emit(&output);
        }
        if supervise(engine, shutdown) {
            break;
        }
    }
    let output = engine.flush_output();
    if !output.is_empty() {
        emit(&output);
    }
}

/// One host poll. Blocks for up to [`POLL_INTERVAL`] while a teardown is still
/// running and returns true once the engine has stopped.
fn supervise(engine: &Engine, shutdown: &ShutdownSignal) -> bool {
    if engine.stopped() {
        return true;
    }
    if shutdown.requested() || engine.stop_requested() {
        debug!("stop requested, shutting engine down");
        engine.stop();
    }
    engine.wait_stopped(POLL_INTERVAL)
}
