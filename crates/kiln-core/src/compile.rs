use crate::context::ExecutionContext;
use crate::sockets::SocketSpec;
use kiln_http::{RequestHandler, RequestLog, TlsConfig};
use std::sync::Arc;

/// A script that could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    /// 1-based line in the authored source, when the compiler knows it.
    pub line: Option<u32>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} (line {line})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// The executable artifact produced from script source.
pub trait CompiledProgram: Send + Sync {
    /// Request handler to serve, or `None` for a script that only runs at compile time.
    fn handler(&self) -> Option<Arc<dyn RequestHandler>>;

    /// Sockets declared by the script. Empty means "use the default socket".
    fn sockets(&self) -> Vec<SocketSpec> {
        Vec::new()
    }

    /// Request log declared by the script.
    fn request_log(&self) -> Option<Arc<dyn RequestLog>> {
        None
    }

    /// Certificate material for secure sockets declared by the script.
    fn tls(&self) -> Option<TlsConfig> {
        None
    }
}

/// Translates script source into a [`CompiledProgram`].
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        context: &ExecutionContext,
        source: &str,
    ) -> Result<Box<dyn CompiledProgram>, CompileError>;
}
