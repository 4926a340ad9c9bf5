use crate::sockets::BindRetry;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Tunables for one launch, loadable from a JSON settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// First port scanned when the script declares no socket.
    pub port_base: u16,
    pub bind_attempts: u32,
    pub bind_retry_delay_ms: u64,
    /// Options handed to the script's execution context.
    pub options: BTreeMap<String, String>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            port_base: 8000,
            bind_attempts: 5,
            bind_retry_delay_ms: 100,
            options: BTreeMap::new(),
        }
    }
}

impl LaunchSettings {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    #[must_use]
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn bind_retry(&self) -> BindRetry {
        BindRetry {
            attempts: self.bind_attempts,
            delay: Duration::from_millis(self.bind_retry_delay_ms),
        }
    }
}
