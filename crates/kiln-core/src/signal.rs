use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process shutdown request shared between a signal handler and a host loop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route Ctrl-C / SIGTERM to this signal. A second signal exits immediately.
    ///
    /// Only one handler can be installed per process; later calls are ignored.
    pub fn install_ctrlc(&self) {
        let requested = Arc::clone(&self.requested);
        let _ = ctrlc::set_handler(move || {
            if requested.swap(true, Ordering::SeqCst) {
                std::process::exit(1);
            }
            eprintln!("\nshutdown requested, stopping engine...");
        });
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
