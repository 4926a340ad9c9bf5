//! Core launch engine for kiln.
//!
//! This crate owns the lifecycle of one compiled script: the [`Engine`] builds an
//! [`ExecutionContext`], compiles the script through a pluggable [`Compiler`], wraps
//! the resulting handler in an [`HttpServer`](kiln_http::HttpServer), binds every
//! requested socket with bounded retry, and tears everything down exactly once when
//! stopped. Embedders observe and steer each step through the [`LaunchHooks`]
//! protocol; runtime failures surface as [`Failure`] chains that [`locate`] maps back
//! to a line of the authored script.

pub mod compile;
pub mod context;
pub mod dev;
pub mod engine;
pub mod failure;
pub mod hooks;
pub mod lifecycle;
pub mod locate;
pub mod mock;
pub mod settings;
pub mod signal;
pub mod sockets;

pub use compile::{CompileError, CompiledProgram, Compiler};
pub use context::{Console, ExecutionContext};
pub use dev::DevHooks;
pub use engine::{Engine, EngineConfig};
pub use failure::{Failure, Frame};
pub use hooks::{DefaultHooks, LaunchHooks};
pub use lifecycle::{validate_transition, Phase};
pub use locate::{locate, EVAL_SOURCE_PREFIX, SCRIPT_FRAME_ORIGIN, TOP_LEVEL_SOURCE};
pub use settings::LaunchSettings;
pub use signal::ShutdownSignal;
pub use sockets::{
    bind_with_retry, default_socket, resolve_sockets, BindRetry, SocketResult, SocketSpec,
};

use kiln_http::BindError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("engine already started")]
    AlreadyStarted,
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("no free port available for service (checked {from}..{to})")]
    NoFreePort { from: u16, to: u16 },
    #[error("error listening on {socket}: {source}")]
    Bind {
        socket: SocketSpec,
        #[source]
        source: BindError,
    },
    #[error("fatal: no port opened to listen on")]
    NotListening,
    #[error("script error: {0}")]
    Script(#[from] Failure),
    #[error("{0}")]
    Hook(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Engine state stays consistent across a panicking hook, so a poisoned lock is
/// still safe to reuse.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
