use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// One served request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub bytes: usize,
    pub elapsed: Duration,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let remote = self
            .remote
            .map_or_else(|| "-".to_owned(), |addr| addr.to_string());
        write!(
            f,
            "{remote} -> {} {} {} {} {}B {}ms",
            self.local,
            self.method,
            self.url,
            self.status,
            self.bytes,
            self.elapsed.as_millis()
        )
    }
}

/// Receives an entry for every request, just before its response is sent.
pub trait RequestLog: Send + Sync {
    fn request_processed(&self, entry: &LogEntry);
}

/// Discards every entry.
pub struct NullLog;

impl RequestLog for NullLog {
    fn request_processed(&self, _entry: &LogEntry) {}
}

/// Emits one `info!` event per request.
pub struct TracingLog;

impl RequestLog for TracingLog {
    fn request_processed(&self, entry: &LogEntry) {
        info!(target: "kiln_http::access", "{entry}");
    }
}

/// Forwards every entry to each inner log in order.
pub struct TeeLog {
    logs: Vec<Arc<dyn RequestLog>>,
}

impl TeeLog {
    pub fn new(logs: Vec<Arc<dyn RequestLog>>) -> Self {
        Self { logs }
    }
}

impl RequestLog for TeeLog {
    fn request_processed(&self, entry: &LogEntry) {
        for log in &self.logs {
            log.request_processed(entry);
        }
    }
}

/// Keeps entries in memory, optionally only the most recent `limit` of them.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<VecDeque<LogEntry>>,
    limit: Option<usize>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` entries, dropping the oldest first.
    pub fn bounded(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            limit: Some(limit),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl RequestLog for MemoryLog {
    fn request_processed(&self, entry: &LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            if self.limit.is_some_and(|limit| entries.len() >= limit) {
                entries.pop_front();
            }
            if self.limit != Some(0) {
                entries.push_back(entry.clone());
            }
        }
    }
}
