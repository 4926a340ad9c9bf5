//! Site scripts for kiln.
//!
//! A site script is a TOML document declaring sockets, optional TLS material and
//! a set of routes. [`ScriptCompiler`] turns it into a [`SiteProgram`] the engine
//! can serve. Compile errors carry the line of the offending key so
//! [`kiln_core::locate`] can point back into the script.

pub mod document;
pub mod program;
pub mod template;

pub use document::{line_at, SiteDocument};
pub use program::{ConsoleLog, Route, RouteBody, SiteHandler, SiteProgram};
pub use template::{ScriptError, Template};

use document::{RouteDecl, TlsDecl};
use kiln_core::{CompileError, CompiledProgram, Compiler, ExecutionContext};
use kiln_http::TlsConfig;
use program::DEFAULT_CONTENT_TYPE;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use toml::Spanned;
use tracing::{debug, info};

/// Compiles TOML site scripts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptCompiler;

impl ScriptCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Like [`Compiler::compile`], keeping the concrete program type.
    ///
    /// Console lines are printed as soon as the document parses, even if a later
    /// route fails to compile. The exit request only applies on success.
    pub fn compile_site(
        &self,
        context: &ExecutionContext,
        source: &str,
    ) -> Result<SiteProgram, CompileError> {
        let doc: SiteDocument = toml::from_str(source).map_err(|e| {
            let message = e.message().trim().to_owned();
            match e.span() {
                Some(span) => CompileError::at_line(message, line_at(source, span.start)),
                None => CompileError::new(message),
            }
        })?;

        for line in &doc.console {
            context.println(line);
        }

        let tls = doc
            .tls
            .as_ref()
            .map(|decl| load_tls(context, source, decl))
            .transpose()?;

        let mut routes = HashMap::new();
        for decl in &doc.route {
            let line = line_at(source, decl.path.span().start);
            let path = decl.path.get_ref();
            if !path.starts_with('/') {
                return Err(CompileError::at_line(
                    format!("route path '{path}' must start with '/'"),
                    line,
                ));
            }
            if routes.contains_key(path) {
                return Err(CompileError::at_line(
                    format!("duplicate route '{path}'"),
                    line,
                ));
            }
            let route = compile_route(context, source, decl, line)?;
            debug!("route {path} -> {}", route.status);
            routes.insert(path.clone(), route);
        }

        let request_log = doc
            .log
            .requests
            .then(|| Arc::new(ConsoleLog::new(context.console())));
        let handler = if routes.is_empty() {
            None
        } else {
            Some(Arc::new(SiteHandler::new(routes, context.console())))
        };

        if doc.exit {
            info!("site script requested exit");
            context.request_stop();
        }

        Ok(SiteProgram {
            handler,
            sockets: doc.socket.iter().map(document::SocketDecl::to_spec).collect(),
            request_log,
            tls,
        })
    }
}

impl Compiler for ScriptCompiler {
    fn compile(
        &self,
        context: &ExecutionContext,
        source: &str,
    ) -> Result<Box<dyn CompiledProgram>, CompileError> {
        Ok(Box::new(self.compile_site(context, source)?))
    }
}

fn compile_route(
    context: &ExecutionContext,
    source: &str,
    decl: &RouteDecl,
    path_line: u32,
) -> Result<Route, CompileError> {
    let body = match (&decl.body, &decl.file) {
        (Some(_), Some(_)) => {
            return Err(CompileError::at_line(
                "route declares both 'body' and 'file'",
                path_line,
            ));
        }
        (Some(text), None) => {
            let line = line_at(source, text.span().start);
            let template = Template::compile(text.get_ref(), context.options()).map_err(|e| {
                let at = match e {
                    ScriptError::UnknownOption(_) => path_line,
                    _ => line,
                };
                CompileError::at_line(e.to_string(), at)
            })?;
            if template.is_static() {
                let rendered = template
                    .render(&HashMap::new())
                    .map_err(|e| CompileError::at_line(e.to_string(), line))?;
                RouteBody::Bytes(rendered.into_bytes())
            } else {
                RouteBody::Template { template, line }
            }
        }
        (None, Some(file)) => RouteBody::Bytes(read_resource(context, source, file)?),
        (None, None) => RouteBody::Bytes(Vec::new()),
    };

    let content_type = decl.content_type.clone().unwrap_or_else(|| {
        decl.file
            .as_ref()
            .map_or(DEFAULT_CONTENT_TYPE, |file| content_type_for(file.get_ref()))
            .to_owned()
    });

    Ok(Route {
        status: decl.status,
        content_type,
        body,
    })
}

fn resolve(
    context: &ExecutionContext,
    source: &str,
    name: &Spanned<String>,
) -> Result<std::path::PathBuf, CompileError> {
    context.resolve_resource(name.get_ref()).ok_or_else(|| {
        CompileError::at_line(
            format!("resource '{}' not found", name.get_ref()),
            line_at(source, name.span().start),
        )
    })
}

fn read_resource(
    context: &ExecutionContext,
    source: &str,
    name: &Spanned<String>,
) -> Result<Vec<u8>, CompileError> {
    let path = resolve(context, source, name)?;
    std::fs::read(&path).map_err(|e| {
        CompileError::at_line(
            format!("failed to read {}: {e}", path.display()),
            line_at(source, name.span().start),
        )
    })
}

fn load_tls(
    context: &ExecutionContext,
    source: &str,
    decl: &TlsDecl,
) -> Result<TlsConfig, CompileError> {
    let certificate = resolve(context, source, &decl.certificate)?;
    let private_key = resolve(context, source, &decl.private_key)?;
    TlsConfig::from_pem_files(&certificate, &private_key).map_err(|e| {
        CompileError::at_line(
            format!("failed to load TLS material: {e}"),
            line_at(source, decl.certificate.span().start),
        )
    })
}

fn content_type_for(file: &str) -> &'static str {
    let ext = Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("txt") | None => DEFAULT_CONTENT_TYPE,
        Some(_) => "application/octet-stream",
    }
}
