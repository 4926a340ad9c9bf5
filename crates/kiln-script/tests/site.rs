//! Site scripts launched through the engine and exercised over loopback.

use kiln_core::{DefaultHooks, DevHooks, Engine, EngineConfig, LaunchSettings};
use kiln_script::ScriptCompiler;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn launch(dir: &Path, source: &str, hooks: Arc<dyn kiln_core::LaunchHooks>) -> Engine {
    let settings = LaunchSettings {
        bind_retry_delay_ms: 1,
        ..LaunchSettings::default()
    }
    .with_option("name", "kiln");
    let config = EngineConfig::new(source, dir.join("site.toml"))
        .with_root(dir)
        .with_cache_dir(dir.join("cache"))
        .with_settings(settings);
    let engine = Engine::new(config, Arc::new(ScriptCompiler::new()), hooks);
    engine.start().unwrap();
    engine.join();
    engine
}

fn get(url: &str) -> (u16, String) {
    match ureq::get(url).call() {
        Ok(mut resp) => {
            let status = resp.status().as_u16();
            (status, resp.body_mut().read_to_string().unwrap())
        }
        Err(ureq::Error::StatusCode(code)) => (code, String::new()),
        Err(e) => panic!("request to {url} failed: {e}"),
    }
}

const SITE: &str = r#"
console = ["site loaded"]

[[socket]]
port = 0
bind = "127.0.0.1"

[log]
requests = true

[[route]]
path = "/"
content_type = "text/html"
body = "<h1>{{name}}</h1>"

[[route]]
path = "/greet"
body = "hello {{query.who}}"

[[route]]
path = "/page"
file = "page.html"
"#;

#[test]
fn serves_declared_routes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), "<p>static</p>").unwrap();
    let engine = launch(dir.path(), SITE, Arc::new(DefaultHooks));
    assert!(!engine.stopped());
    let addr = engine.local_addrs()[0];

    assert_eq!(get(&format!("http://{addr}/")), (200, "<h1>kiln</h1>".to_owned()));
    assert_eq!(
        get(&format!("http://{addr}/greet?who=world")),
        (200, "hello world".to_owned())
    );
    assert_eq!(get(&format!("http://{addr}/page")).1, "<p>static</p>");
    assert_eq!(get(&format!("http://{addr}/absent")).0, 404);

    let output = engine.flush_output();
    assert!(output.starts_with("site loaded\n"));
    assert!(output.contains("GET /greet?who=world 200"));
    assert!(output.contains("GET /absent 404"));

    engine.stop();
    assert!(engine.stopped());
}

#[test]
fn missing_query_parameter_is_located_500() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("page.html"), "").unwrap();
    let engine = launch(dir.path(), SITE, Arc::new(DefaultHooks));
    let addr = engine.local_addrs()[0];

    assert_eq!(get(&format!("http://{addr}/greet")).0, 500);
    let output = engine.flush_output();
    assert!(output.contains("Script error (line 18):"));
    assert!(output.contains("GET /greet 500"));
    engine.stop();
}

#[test]
fn compile_error_located_by_dev_hooks() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(DevHooks::new().without_sitemap());
    let source = "[[socket]]\nport = 0\n\n[[route]]\npath = \"/\"\nfile = \"gone.html\"\n";
    let engine = launch(dir.path(), source, hooks.clone());

    assert!(engine.wait_stopped(Duration::from_secs(10)));
    assert_eq!(hooks.error_line(), Some(6));
    assert!(hooks.service_urls().is_empty());
}

#[test]
fn exit_request_reaches_host() {
    let dir = tempfile::tempdir().unwrap();
    let source = "exit = true\n\n[[socket]]\nport = 0\nbind = \"127.0.0.1\"\n\n[[route]]\npath = \"/\"\n";
    let engine = launch(dir.path(), source, Arc::new(DefaultHooks));
    assert!(engine.stop_requested());
    engine.stop();
}

#[test]
fn dev_hooks_collect_service_root() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(DevHooks::new().without_sitemap());
    let source = "[[socket]]\nport = 0\nbind = \"127.0.0.1\"\n\n[[route]]\npath = \"/\"\nbody = \"dev\"\n";
    let engine = launch(dir.path(), source, hooks.clone());
    let port = engine.local_addrs()[0].port();

    assert_eq!(hooks.service_urls(), vec![format!("http://localhost:{port}/")]);
    let (status, body) = get(&format!("http://127.0.0.1:{port}/"));
    assert_eq!((status, body.as_str()), (200, "dev"));
    assert_eq!(hooks.requests().entries().len(), 1);

    engine.stop();
    assert!(hooks.service_urls().is_empty());
    assert!(hooks.requests().entries().is_empty());
}

#[test]
fn dev_hooks_follow_sitemap_entries() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(DevHooks::new());
    let source = r#"
[[socket]]
port = 0
bind = "127.0.0.1"

[[route]]
path = "/sitemap.xml"
content_type = "application/xml"
body = "<urlset><url><loc>http://example.com/a.html</loc></url></urlset>"

[[route]]
path = "/a.html"
body = "a"
"#;
    let engine = launch(dir.path(), source, hooks.clone());
    let port = engine.local_addrs()[0].port();

    assert_eq!(
        hooks.service_urls(),
        vec![
            format!("http://localhost:{port}/"),
            format!("http://localhost:{port}/a.html"),
        ]
    );
    assert!(hooks.last_error().is_none());
    engine.stop();
}
