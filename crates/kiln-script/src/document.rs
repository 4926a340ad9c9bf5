//! Deserialized form of a site script, with source spans kept for error lines.

use kiln_core::SocketSpec;
use serde::Deserialize;
use toml::Spanned;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteDocument {
    /// Ask the host to stop right after compiling.
    pub exit: bool,
    pub console: Vec<String>,
    pub socket: Vec<SocketDecl>,
    pub tls: Option<TlsDecl>,
    pub log: LogDecl,
    pub route: Vec<RouteDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocketDecl {
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    pub bind: Option<String>,
}

impl SocketDecl {
    pub fn to_spec(&self) -> SocketSpec {
        SocketSpec {
            port: self.port,
            secure: self.secure,
            bind_address: self.bind.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsDecl {
    pub certificate: Spanned<String>,
    pub private_key: Spanned<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogDecl {
    /// Echo every served request to the script console.
    pub requests: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDecl {
    pub path: Spanned<String>,
    #[serde(default = "default_status")]
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Option<Spanned<String>>,
    pub file: Option<Spanned<String>>,
}

fn default_status() -> u16 {
    200
}

/// 1-based line containing byte `offset` of `source`.
pub fn line_at(source: &str, offset: usize) -> u32 {
    let end = offset.min(source.len());
    let newlines = source.as_bytes()[..end].iter().filter(|&&b| b == b'\n').count();
    u32::try_from(newlines + 1).unwrap_or(u32::MAX)
}
