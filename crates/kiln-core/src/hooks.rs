//! Extension points an embedder plugs into the engine lifecycle.
//!
//! The engine calls every hook synchronously on its launch thread, in this order:
//!
//! ```text
//! on_compile_start -> on_compile_end -> on_server_create
//!     -> [on_default_socket_needed] -> on_socket_result (per socket)
//!     -> on_launch_complete
//! on_runtime_error   (any failure, including ones raised by hooks)
//! on_stopped         (once, during teardown)
//! ```
//!
//! A hook returning `Err` aborts the launch: the error goes to
//! [`LaunchHooks::on_runtime_error`] and the engine tears down. Hooks must not
//! block; a slow hook stalls the whole launch.

use crate::context::ExecutionContext;
use crate::failure::Failure;
use crate::sockets::{default_socket, SocketResult, SocketSpec};
use crate::CoreError;
use kiln_http::{HttpServer, NullLog, RequestLog};
use std::sync::Arc;

pub trait LaunchHooks: Send + Sync {
    fn on_compile_start(&self, _context: &ExecutionContext, _source: &str) -> Result<(), CoreError> {
        Ok(())
    }

    fn on_compile_end(&self, _context: &ExecutionContext, _source: &str) -> Result<(), CoreError> {
        Ok(())
    }

    /// Choose the request log for the server about to be built from the
    /// compiled program's handler. `program_log` is the log the script declared.
    fn on_server_create(
        &self,
        _context: &ExecutionContext,
        program_log: Option<Arc<dyn RequestLog>>,
    ) -> Result<Arc<dyn RequestLog>, CoreError> {
        Ok(program_log.unwrap_or_else(|| Arc::new(NullLog)))
    }

    /// Called when the script declares no socket.
    fn on_default_socket_needed(
        &self,
        _context: &ExecutionContext,
        port_base: u16,
    ) -> Result<SocketSpec, CoreError> {
        default_socket(port_base)
    }

    /// Called once per socket, bound or not. Returning `Err` escalates the
    /// outcome to a fatal launch failure.
    fn on_socket_result(
        &self,
        _context: &ExecutionContext,
        _server: &HttpServer,
        _result: &SocketResult,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    /// `server` is `None` when the script declares no request handler.
    /// `listening` is true when at least one socket bound.
    fn on_launch_complete(
        &self,
        context: &ExecutionContext,
        _server: Option<&HttpServer>,
        listening: bool,
    ) -> Result<(), CoreError> {
        if listening {
            context.println(&format!(
                "Engine running (listening) {}",
                chrono::Local::now().to_rfc2822()
            ));
        }
        Ok(())
    }

    fn on_runtime_error(&self, _failure: &Failure) {}

    /// `context` is `None` when the engine stopped before creating one.
    fn on_stopped(&self, context: Option<&ExecutionContext>) -> Result<(), CoreError> {
        if let Some(context) = context {
            context.println(&format!(
                "Engine runtime stopped at {}",
                chrono::Local::now().to_rfc2822()
            ));
        }
        Ok(())
    }
}

/// Hooks with every default behavior and nothing else.
pub struct DefaultHooks;

impl LaunchHooks for DefaultHooks {}
