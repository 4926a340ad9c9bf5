//! Engine lifecycle against real loopback sockets, driven by the mock compiler.

use kiln_core::mock::{MockCompiler, MockProgram};
use kiln_core::{
    locate, CompileError, CoreError, Engine, EngineConfig, ExecutionContext, Failure,
    LaunchHooks, LaunchSettings, Phase, SocketResult, SocketSpec,
};
use kiln_http::{HttpServer, MemoryLog};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Records every hook call; optionally escalates bind failures like a production launcher.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    sockets: Mutex<Vec<SocketResult>>,
    errors: Mutex<Vec<Failure>>,
    launch: Mutex<Option<(bool, bool)>>,
    stopped: AtomicUsize,
    escalate_bind_failure: AtomicBool,
    fail_on_stopped: AtomicBool,
    no_free_port: AtomicBool,
}

impl Recorder {
    fn escalating() -> Self {
        let recorder = Self::default();
        recorder.escalate_bind_failure.store(true, Ordering::SeqCst);
        recorder
    }

    fn event(&self, name: &str) {
        self.events.lock().unwrap().push(name.to_owned());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn sockets(&self) -> Vec<SocketResult> {
        self.sockets.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<Failure> {
        self.errors.lock().unwrap().clone()
    }
}

impl LaunchHooks for Recorder {
    fn on_compile_start(&self, _context: &ExecutionContext, _source: &str) -> Result<(), CoreError> {
        self.event("compile_start");
        Ok(())
    }

    fn on_compile_end(&self, _context: &ExecutionContext, _source: &str) -> Result<(), CoreError> {
        self.event("compile_end");
        Ok(())
    }

    fn on_default_socket_needed(
        &self,
        _context: &ExecutionContext,
        port_base: u16,
    ) -> Result<SocketSpec, CoreError> {
        self.event("default_socket");
        if self.no_free_port.load(Ordering::SeqCst) {
            return Err(CoreError::NoFreePort {
                from: port_base,
                to: port_base + 128,
            });
        }
        Ok(SocketSpec::new(0).bind_address("127.0.0.1"))
    }

    fn on_socket_result(
        &self,
        _context: &ExecutionContext,
        _server: &HttpServer,
        result: &SocketResult,
    ) -> Result<(), CoreError> {
        self.event("socket_result");
        self.sockets.lock().unwrap().push(result.clone());
        match &result.error {
            Some(e) if self.escalate_bind_failure.load(Ordering::SeqCst) => Err(CoreError::Bind {
                socket: result.spec.clone(),
                source: e.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn on_launch_complete(
        &self,
        _context: &ExecutionContext,
        server: Option<&HttpServer>,
        listening: bool,
    ) -> Result<(), CoreError> {
        self.event("launch_complete");
        *self.launch.lock().unwrap() = Some((server.is_some(), listening));
        Ok(())
    }

    fn on_runtime_error(&self, failure: &Failure) {
        self.event("runtime_error");
        self.errors.lock().unwrap().push(failure.clone());
    }

    fn on_stopped(&self, _context: Option<&ExecutionContext>) -> Result<(), CoreError> {
        self.event("stopped");
        self.stopped.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_stopped.load(Ordering::SeqCst) {
            return Err(CoreError::Hook("stopped hook failed".to_owned()));
        }
        Ok(())
    }
}

fn quick_settings() -> LaunchSettings {
    LaunchSettings {
        bind_retry_delay_ms: 1,
        ..LaunchSettings::default()
    }
}

fn engine(dir: &Path, compiler: MockCompiler, hooks: Arc<Recorder>) -> Engine {
    engine_with(dir, quick_settings(), Arc::new(compiler), hooks)
}

fn engine_with(
    dir: &Path,
    settings: LaunchSettings,
    compiler: Arc<MockCompiler>,
    hooks: Arc<Recorder>,
) -> Engine {
    let config = EngineConfig::new("site source", dir.join("site.toml"))
        .with_root(dir)
        .with_cache_dir(dir.join("cache"))
        .with_settings(settings);
    Engine::new(config, compiler, hooks)
}

fn loopback(port: u16) -> SocketSpec {
    SocketSpec::new(port).bind_address("127.0.0.1")
}

fn taken_port() -> (TcpListener, u16) {
    let held = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = held.local_addr().unwrap().port();
    (held, port)
}

fn free_port() -> u16 {
    let (held, port) = taken_port();
    drop(held);
    port
}

#[test]
fn start_twice_fails_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let compiler = Arc::new(MockCompiler::without_server());
    let engine = engine_with(dir.path(), quick_settings(), compiler.clone(), hooks.clone());

    engine.start().unwrap();
    assert!(matches!(engine.start(), Err(CoreError::AlreadyStarted)));
    assert!(engine.wait_stopped(WAIT));
    engine.join();

    assert!(matches!(engine.start(), Err(CoreError::AlreadyStarted)));
    assert_eq!(compiler.compile_count(), 1);
    assert_eq!(hooks.events().iter().filter(|e| *e == "compile_start").count(), 1);
    assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let program = MockProgram::serving("hi").with_sockets(vec![loopback(0)]);
    let engine = engine(dir.path(), MockCompiler::new(program), hooks.clone());

    engine.start().unwrap();
    engine.join();
    assert!(!engine.stopped());
    assert_eq!(engine.local_addrs().len(), 1);

    engine.stop();
    engine.stop();
    engine.stop();
    assert!(engine.stopped());
    assert!(engine.stop_requested());
    assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
    assert!(engine.local_addrs().is_empty());
}

#[test]
fn concurrent_stops_tear_down_once() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let program = MockProgram::serving("hi").with_sockets(vec![loopback(0)]);
    let engine = Arc::new(engine(dir.path(), MockCompiler::new(program), hooks.clone()));
    engine.start().unwrap();
    engine.join();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.stop())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.wait_stopped(WAIT));
    assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
}

#[test]
fn compile_failure_reports_once_and_binds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let compiler = MockCompiler::failing(CompileError::at_line("unexpected '}'", 42));
    let engine = engine(dir.path(), compiler, hooks.clone());

    engine.start().unwrap();
    assert!(engine.wait_stopped(WAIT));

    let errors = hooks.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(locate(&errors[0]), Some(42));
    assert!(hooks.sockets().is_empty());
    assert!(hooks.launch.lock().unwrap().is_none());
    assert_eq!(
        hooks.events(),
        vec!["compile_start", "runtime_error", "stopped"]
    );
}

#[test]
fn default_socket_synthesized_when_none_declared() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let engine = engine(
        dir.path(),
        MockCompiler::new(MockProgram::serving("hello")),
        hooks.clone(),
    );

    engine.start().unwrap();
    engine.join();

    let sockets = hooks.sockets();
    assert_eq!(sockets.len(), 1);
    assert!(sockets[0].bound());
    assert!(sockets[0].attempts <= 5);
    assert_eq!(
        hooks.events().iter().filter(|e| *e == "default_socket").count(),
        1
    );
    assert_eq!(*hooks.launch.lock().unwrap(), Some((true, true)));

    let addr = engine.local_addrs()[0];
    let body = ureq::get(&format!("http://{addr}/"))
        .call()
        .unwrap()
        .body_mut()
        .read_to_string()
        .unwrap();
    assert_eq!(body, "hello");
    engine.stop();
}

#[test]
fn failed_socket_reported_and_others_still_attempted() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let (_held, port) = taken_port();
    let program = MockProgram::serving("x").with_sockets(vec![loopback(port), loopback(0)]);
    let engine = engine(dir.path(), MockCompiler::new(program), hooks.clone());

    engine.start().unwrap();
    engine.join();

    let sockets = hooks.sockets();
    assert_eq!(sockets.len(), 2);
    assert_eq!(sockets[0].spec, loopback(port));
    assert!(sockets[0].error.is_some());
    assert_eq!(sockets[0].attempts, 5);
    assert!(sockets[1].bound());
    assert_eq!(*hooks.launch.lock().unwrap(), Some((true, true)));
    assert!(!engine.stopped());
    engine.stop();
}

#[test]
fn nothing_bound_means_not_listening_and_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let (_held, port) = taken_port();
    let program = MockProgram::serving("x").with_sockets(vec![loopback(port)]);
    let engine = engine(dir.path(), MockCompiler::new(program), hooks.clone());

    engine.start().unwrap();
    assert!(engine.wait_stopped(WAIT));

    assert_eq!(*hooks.launch.lock().unwrap(), Some((true, false)));
    assert!(hooks.errors().is_empty());
    assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
}

#[test]
fn duplicate_sockets_bound_independently() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let port = free_port();
    let program = MockProgram::serving("x").with_sockets(vec![loopback(port), loopback(port)]);
    let engine = engine(dir.path(), MockCompiler::new(program), hooks.clone());

    engine.start().unwrap();
    engine.join();

    let sockets = hooks.sockets();
    assert_eq!(sockets.len(), 2);
    assert!(sockets[0].bound());
    assert!(!sockets[1].bound());
    assert!(sockets[1].error.is_some());
    assert_eq!(*hooks.launch.lock().unwrap(), Some((true, true)));
    engine.stop();
}

#[test]
fn escalated_bind_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::escalating());
    let (_held, port) = taken_port();
    let program = MockProgram::serving("x").with_sockets(vec![loopback(port), loopback(0)]);
    let engine = engine(dir.path(), MockCompiler::new(program), hooks.clone());

    engine.start().unwrap();
    assert!(engine.wait_stopped(WAIT));

    assert_eq!(hooks.sockets().len(), 1);
    assert_eq!(hooks.errors().len(), 1);
    assert!(hooks.launch.lock().unwrap().is_none());
}

#[test]
fn no_handler_is_a_clean_no_server_launch() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let engine = engine(dir.path(), MockCompiler::without_server(), hooks.clone());

    engine.start().unwrap();
    assert!(engine.wait_stopped(WAIT));

    assert_eq!(*hooks.launch.lock().unwrap(), Some((false, false)));
    assert!(hooks.errors().is_empty());
    assert!(hooks.sockets().is_empty());
    assert_eq!(engine.phase(), Phase::Stopped);
}

#[test]
fn stopped_hook_failure_routed_to_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    hooks.fail_on_stopped.store(true, Ordering::SeqCst);
    let engine = engine(dir.path(), MockCompiler::without_server(), hooks.clone());

    engine.start().unwrap();
    assert!(engine.wait_stopped(WAIT));

    let errors = hooks.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message(), "stopped hook failed");
}

#[test]
fn script_stop_request_visible_to_host() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let program = MockProgram {
        request_stop: true,
        ..MockProgram::serving("x").with_sockets(vec![loopback(0)])
    };
    let engine = engine(dir.path(), MockCompiler::new(program), hooks.clone());

    engine.start().unwrap();
    engine.join();
    assert!(engine.stop_requested());
    assert!(!engine.stopped());

    engine.stop();
    assert!(engine.stopped());
}

#[test]
fn console_output_drained_and_workdir_released() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let engine = engine(dir.path(), MockCompiler::without_server(), hooks);

    engine.start().unwrap();
    assert!(engine.wait_stopped(WAIT));

    assert_eq!(engine.flush_output(), "mock compile of 11 bytes\n");
    assert_eq!(engine.flush_output(), "");
    let context = engine.context().unwrap();
    assert!(context.workdir().is_none());
    assert_eq!(context.resource_roots(), vec![dir.path().to_path_buf()]);
}

#[test]
fn stop_during_bind_retry_closes_late_socket() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let (held, port) = taken_port();
    let settings = LaunchSettings {
        bind_retry_delay_ms: 300,
        ..LaunchSettings::default()
    };
    let program = MockProgram::serving("x").with_sockets(vec![loopback(port)]);
    let engine = engine_with(
        dir.path(),
        settings,
        Arc::new(MockCompiler::new(program)),
        hooks.clone(),
    );

    engine.start().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    drop(held);
    engine.stop();
    engine.join();

    assert!(engine.stopped());
    assert!(engine.local_addrs().is_empty());
    assert!(hooks.sockets().is_empty());
    assert!(hooks.launch.lock().unwrap().is_none());
    assert!(hooks.errors().is_empty());
    assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);
    TcpListener::bind(("127.0.0.1", port)).unwrap();
}

#[test]
fn no_free_default_port_is_reported_then_torn_down() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    hooks.no_free_port.store(true, Ordering::SeqCst);
    let engine = engine(
        dir.path(),
        MockCompiler::new(MockProgram::serving("x")),
        hooks.clone(),
    );

    engine.start().unwrap();
    assert!(engine.wait_stopped(WAIT));
    engine.join();

    let errors = hooks.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message().contains("no free port"), "{}", errors[0]);
    assert!(hooks.sockets().is_empty());
    assert!(hooks.launch.lock().unwrap().is_none());
    assert_eq!(
        hooks.events(),
        vec![
            "compile_start",
            "compile_end",
            "default_socket",
            "runtime_error",
            "stopped"
        ]
    );
}

#[test]
fn program_request_log_sees_served_requests() {
    let dir = tempfile::tempdir().unwrap();
    let hooks = Arc::new(Recorder::default());
    let log = Arc::new(MemoryLog::new());
    let program = MockProgram::serving("logged")
        .with_sockets(vec![loopback(0)])
        .with_request_log(log.clone());
    let engine = engine(dir.path(), MockCompiler::new(program), hooks);

    engine.start().unwrap();
    engine.join();
    let addr = engine.local_addrs()[0];
    ureq::get(&format!("http://{addr}/logged")).call().unwrap();
    engine.stop();

    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].url, "/logged");
    assert_eq!(entries[0].local, addr);
}
