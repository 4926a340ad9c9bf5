use crate::compile::CompileError;
use crate::locate::SCRIPT_FRAME_ORIGIN;
use std::any::Any;
use std::error::Error;

/// One call frame captured when a failure was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Execution domain that produced the frame, e.g. [`SCRIPT_FRAME_ORIGIN`].
    pub origin: String,
    /// Source name reported by the frame.
    pub source: String,
    pub line: u32,
}

impl Frame {
    pub fn new(origin: impl Into<String>, source: impl Into<String>, line: u32) -> Self {
        Self {
            origin: origin.into(),
            source: source.into(),
            line,
        }
    }

    /// A frame raised by compiled script code.
    pub fn script(source: impl Into<String>, line: u32) -> Self {
        Self::new(SCRIPT_FRAME_ORIGIN, source, line)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at {} ({}:{})", self.origin, self.source, self.line)
    }
}

/// A structured runtime failure: a message, an optional explicit source line, the
/// captured call frames, and the failure that caused it.
///
/// The outermost failure is the one reported; [`Failure::chain`] walks from it to
/// the innermost cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    message: String,
    line: Option<u32>,
    frames: Vec<Frame>,
    cause: Option<Box<Failure>>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            frames: Vec::new(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    #[must_use]
    pub fn caused_by(mut self, cause: Failure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Capture an error and its whole `source()` chain.
    ///
    /// Embedded `Failure`s are kept as-is and compile errors keep their line.
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        if let Some(failure) = err.downcast_ref::<Failure>() {
            return failure.clone();
        }
        let mut failure = Self::new(err.to_string());
        if let Some(compile) = err.downcast_ref::<CompileError>() {
            failure.line = compile.line;
        }
        failure.cause = err.source().map(|inner| Box::new(Self::from_error(inner)));
        failure
    }

    /// Describe a panic payload caught while running engine code.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self::new(format!("panic: {detail}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Explicit line reported by a compile or evaluation error.
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_deref()
    }

    /// This failure followed by each nested cause, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &Failure> {
        std::iter::successors(Some(self), |f| f.cause.as_deref())
    }

    /// Innermost cause of the chain.
    pub fn root_cause(&self) -> &Failure {
        self.chain().last().unwrap_or(self)
    }

    /// Multi-line rendering of the whole chain with frames, for consoles.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (depth, failure) in self.chain().enumerate() {
            if depth > 0 {
                out.push_str("caused by: ");
            }
            out.push_str(&failure.message);
            out.push('\n');
            for frame in &failure.frames {
                out.push_str("    ");
                out.push_str(&frame.to_string());
                out.push('\n');
            }
        }
        out
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn Error + 'static))
    }
}
