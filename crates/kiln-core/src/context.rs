use crate::{lock, CoreError};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::debug;

/// Buffered console text produced while a script runs.
///
/// Clones share one buffer. [`Console::take`] drains it.
#[derive(Debug, Clone, Default)]
pub struct Console {
    buffer: Arc<Mutex<String>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print(&self, text: &str) {
        lock(&self.buffer).push_str(text);
    }

    pub fn println(&self, text: &str) {
        let mut buffer = lock(&self.buffer);
        buffer.push_str(text);
        buffer.push('\n');
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut *lock(&self.buffer))
    }
}

/// Per-launch execution environment of a script.
///
/// Owns the resource search roots, a scratch working directory under the cache
/// directory, the console buffer and the script's own stop request. The scratch
/// directory is released by [`ExecutionContext::notify_stopped`].
pub struct ExecutionContext {
    root: PathBuf,
    cache_dir: PathBuf,
    options: BTreeMap<String, String>,
    resource_roots: Mutex<Vec<PathBuf>>,
    workdir: Mutex<Option<TempDir>>,
    console: Console,
    stop_requested: AtomicBool,
}

impl ExecutionContext {
    pub fn new(
        root: &Path,
        cache_dir: &Path,
        options: BTreeMap<String, String>,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(cache_dir)?;
        let workdir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(cache_dir)?;
        debug!("execution context workdir {}", workdir.path().display());

        Ok(Self {
            root: root.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            options,
            resource_roots: Mutex::new(vec![root.to_path_buf()]),
            workdir: Mutex::new(Some(workdir)),
            console: Console::new(),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Scratch directory for this launch; `None` once the engine stopped.
    pub fn workdir(&self) -> Option<PathBuf> {
        lock(&self.workdir).as_ref().map(|dir| dir.path().to_path_buf())
    }

    /// Append a directory searched by [`ExecutionContext::resolve_resource`].
    /// Roots are searched in insertion order; duplicates are ignored.
    pub fn add_resource_root(&self, dir: &Path) {
        let mut roots = lock(&self.resource_roots);
        if !roots.iter().any(|r| r == dir) {
            roots.push(dir.to_path_buf());
        }
    }

    pub fn resource_roots(&self) -> Vec<PathBuf> {
        lock(&self.resource_roots).clone()
    }

    /// Find `relative` under the first resource root that contains it.
    ///
    /// Absolute paths and paths escaping the root with `..` never resolve.
    pub fn resolve_resource(&self, relative: &str) -> Option<PathBuf> {
        let rel = Path::new(relative);
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        lock(&self.resource_roots)
            .iter()
            .map(|root| root.join(rel))
            .find(|candidate| candidate.is_file())
    }

    pub fn console(&self) -> Console {
        self.console.clone()
    }

    pub fn print(&self, text: &str) {
        self.console.print(text);
    }

    pub fn println(&self, text: &str) {
        self.console.println(text);
    }

    /// Drain buffered console output.
    pub fn flush_output(&self) -> String {
        self.console.take()
    }

    /// Ask the host to stop the engine running this script.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Release launch resources. Safe to call more than once.
    pub fn notify_stopped(&self) -> Result<(), CoreError> {
        let workdir = lock(&self.workdir).take();
        if let Some(dir) = workdir {
            debug!("removing workdir {}", dir.path().display());
            dir.close()?;
        }
        Ok(())
    }
}
