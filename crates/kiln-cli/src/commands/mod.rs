pub mod check;
pub mod completions;
pub mod dev;
pub mod run;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::{EngineConfig, LaunchSettings};
use kiln_http::TlsConfig;
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_COMPILE_ERROR: u8 = 2;

/// How often host loops look at the engine, the source file and the signal flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Arguments shared by every command that launches or compiles a script.
#[derive(Debug, Clone, Args)]
pub struct LaunchArgs {
    /// Site script to launch.
    #[arg(long)]
    pub src: PathBuf,
    /// Root directory for resources (defaults to the current directory).
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Cache directory (defaults to ./kiln-cache).
    #[arg(long)]
    pub cache: Option<PathBuf>,
    /// First port scanned when the script declares no socket.
    #[arg(long)]
    pub port_base: Option<u16>,
    /// JSON launch settings file.
    #[arg(long)]
    pub settings: Option<PathBuf>,
    /// PEM certificate chain for secure sockets.
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,
    /// PEM private key for secure sockets.
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
    /// Script options as key=value pairs.
    #[arg(value_parser = parse_option)]
    pub options: Vec<(String, String)>,
}

pub fn parse_option(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

impl LaunchArgs {
    /// Launch settings with command line overrides applied. `mode` is added
    /// unless given explicitly.
    pub fn settings(&self, mode: &str) -> Result<LaunchSettings, String> {
        let mut settings = match &self.settings {
            Some(path) => LaunchSettings::load(path)
                .map_err(|e| format!("failed to load settings {}: {e}", path.display()))?,
            None => LaunchSettings::default(),
        };
        if let Some(port_base) = self.port_base {
            settings.port_base = port_base;
        }
        for (key, value) in &self.options {
            settings.options.insert(key.clone(), value.clone());
        }
        settings
            .options
            .entry("mode".to_owned())
            .or_insert_with(|| mode.to_owned());
        Ok(settings)
    }

    /// `--root` when given, else the working directory. Must be an existing directory.
    pub fn root_dir(&self) -> Result<PathBuf, String> {
        let root = match &self.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().map_err(|e| format!("no working directory: {e}"))?,
        };
        if !root.is_dir() {
            return Err(format!("root directory not found: {}", root.display()));
        }
        Ok(root)
    }

    pub fn cache_dir(&self) -> Result<PathBuf, String> {
        match &self.cache {
            Some(cache) => Ok(cache.clone()),
            None => Ok(self.root_dir()?.join("kiln-cache")),
        }
    }

    pub fn read_source(&self) -> Result<String, String> {
        std::fs::read_to_string(&self.src)
            .map_err(|e| format!("failed to read {}: {e}", self.src.display()))
    }

    /// Read the script and assemble the engine configuration.
    pub fn engine_config(&self, mode: &str) -> Result<EngineConfig, String> {
        let mut config = EngineConfig::new(self.read_source()?, &self.src)
            .with_root(self.root_dir()?)
            .with_cache_dir(self.cache_dir()?)
            .with_settings(self.settings(mode)?);
        if let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) {
            let tls = TlsConfig::from_pem_files(cert, key)
                .map_err(|e| format!("failed to load TLS material: {e}"))?;
            config = config.with_tls(tls);
        }
        Ok(config)
    }
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

/// Error text pointing at a script line when one is known.
pub fn located(message: &str, line: Option<u32>) -> String {
    use console::Style;
    match line {
        Some(line) => format!(
            "{} {message}",
            Style::new().red().bold().apply_to(format!("line {line}:"))
        ),
        None => message.to_owned(),
    }
}
