//! In-process compiler for tests: no script language, just a canned outcome.

use crate::compile::{CompileError, CompiledProgram, Compiler};
use crate::context::ExecutionContext;
use crate::sockets::SocketSpec;
use kiln_http::{Reply, Request, RequestHandler, RequestLog};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Program handed out by [`MockCompiler`].
#[derive(Clone, Default)]
pub struct MockProgram {
    /// Body served for every request; `None` means the program has no handler.
    pub body: Option<String>,
    pub sockets: Vec<SocketSpec>,
    pub request_log: Option<Arc<dyn RequestLog>>,
    /// Ask the host to stop right after compiling.
    pub request_stop: bool,
}

impl MockProgram {
    pub fn serving(body: &str) -> Self {
        Self {
            body: Some(body.to_owned()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sockets(mut self, sockets: Vec<SocketSpec>) -> Self {
        self.sockets = sockets;
        self
    }

    #[must_use]
    pub fn with_request_log(mut self, log: Arc<dyn RequestLog>) -> Self {
        self.request_log = Some(log);
        self
    }
}

struct MockHandler {
    body: String,
}

impl RequestHandler for MockHandler {
    fn handle(&self, _request: &mut Request) -> Reply {
        Reply::text(200, self.body.clone())
    }
}

impl CompiledProgram for MockProgram {
    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.body.as_ref().map(|body| {
            Arc::new(MockHandler { body: body.clone() }) as Arc<dyn RequestHandler>
        })
    }

    fn sockets(&self) -> Vec<SocketSpec> {
        self.sockets.clone()
    }

    fn request_log(&self) -> Option<Arc<dyn RequestLog>> {
        self.request_log.clone()
    }
}

pub struct MockCompiler {
    outcome: Result<MockProgram, CompileError>,
    compiles: AtomicUsize,
}

impl MockCompiler {
    pub fn new(program: MockProgram) -> Self {
        Self {
            outcome: Ok(program),
            compiles: AtomicUsize::new(0),
        }
    }

    pub fn without_server() -> Self {
        Self::new(MockProgram::default())
    }

    pub fn failing(error: CompileError) -> Self {
        Self {
            outcome: Err(error),
            compiles: AtomicUsize::new(0),
        }
    }

    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl Compiler for MockCompiler {
    fn compile(
        &self,
        context: &ExecutionContext,
        source: &str,
    ) -> Result<Box<dyn CompiledProgram>, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        context.println(&format!("mock compile of {} bytes", source.len()));
        let program = self.outcome.clone()?;
        if program.request_stop {
            context.request_stop();
        }
        Ok(Box::new(program))
    }
}
