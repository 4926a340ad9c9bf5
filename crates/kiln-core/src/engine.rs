use crate::compile::Compiler;
use crate::context::ExecutionContext;
use crate::failure::Failure;
use crate::hooks::LaunchHooks;
use crate::lifecycle::{validate_transition, Phase};
use crate::settings::LaunchSettings;
use crate::sockets::{bind_with_retry, resolve_sockets};
use crate::{lock, CoreError};
use kiln_http::{HttpServer, TlsConfig};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything needed to launch one script.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub source: String,
    /// Location the source was read from; its directory becomes a resource root.
    pub source_path: PathBuf,
    pub root: PathBuf,
    pub cache_dir: PathBuf,
    pub settings: LaunchSettings,
    /// Certificate material used when the script declares none.
    pub tls: Option<TlsConfig>,
}

impl EngineConfig {
    pub fn new(source: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            source_path: source_path.into(),
            root: PathBuf::from("."),
            cache_dir: std::env::temp_dir().join("kiln-cache"),
            settings: LaunchSettings::default(),
            tls: None,
        }
    }

    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: LaunchSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

#[derive(Default)]
struct EngineState {
    phase: Phase,
    /// Set by the first successful [`Engine::start`].
    launched: bool,
    stop_requested: bool,
    context: Option<Arc<ExecutionContext>>,
    server: Option<Arc<HttpServer>>,
}

impl EngineState {
    fn advance(&mut self, to: Phase) -> Result<(), CoreError> {
        validate_transition(self.phase, to)?;
        self.phase = to;
        Ok(())
    }

    fn halting(&self) -> bool {
        self.stop_requested || self.phase != Phase::Running
    }
}

struct Shared {
    config: EngineConfig,
    compiler: Arc<dyn Compiler>,
    hooks: Arc<dyn LaunchHooks>,
    state: Mutex<EngineState>,
    changed: Condvar,
}

/// Runs one compiled script until stopped.
///
/// [`Engine::start`] returns immediately; compilation, server construction and
/// socket binding happen on a dedicated launch thread. Failures never escape to
/// the caller: they are reported through [`LaunchHooks::on_runtime_error`] and
/// always followed by teardown. [`Engine::stop`] may be called from any thread,
/// any number of times; teardown runs once.
pub struct Engine {
    shared: Arc<Shared>,
    launch: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        compiler: Arc<dyn Compiler>,
        hooks: Arc<dyn LaunchHooks>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                compiler,
                hooks,
                state: Mutex::new(EngineState::default()),
                changed: Condvar::new(),
            }),
            launch: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Begin the launch on a new thread.
    ///
    /// Fails with [`CoreError::AlreadyStarted`] after an earlier start, and with
    /// [`CoreError::InvalidTransition`] when the engine was stopped before it
    /// ever started.
    pub fn start(&self) -> Result<(), CoreError> {
        {
            let mut state = self.shared.state();
            if state.launched {
                return Err(CoreError::AlreadyStarted);
            }
            state.advance(Phase::Running)?;
            state.launched = true;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("kiln-engine".to_owned())
            .spawn(move || shared.run());
        match spawned {
            Ok(handle) => *lock(&self.launch) = Some(handle),
            Err(e) => {
                self.shared.report(&CoreError::Io(e));
                self.shared.stop();
            }
        }
        Ok(())
    }

    /// Tear down the engine. Idempotent; only the first call does any work.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn started(&self) -> bool {
        self.shared.state().launched
    }

    /// True once teardown has completed.
    pub fn stopped(&self) -> bool {
        self.shared.state().phase == Phase::Stopped
    }

    /// True when a stop was requested of the engine or by the running script.
    pub fn stop_requested(&self) -> bool {
        let state = self.shared.state();
        state.stop_requested
            || state
                .context
                .as_ref()
                .is_some_and(|context| context.stop_requested())
    }

    pub fn phase(&self) -> Phase {
        self.shared.state().phase
    }

    pub fn context(&self) -> Option<Arc<ExecutionContext>> {
        self.shared.state().context.clone()
    }

    /// Drain console output produced so far. Never blocks on the launch.
    pub fn flush_output(&self) -> String {
        self.context()
            .map(|context| context.flush_output())
            .unwrap_or_default()
    }

    /// Addresses currently being served.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.shared
            .state()
            .server
            .as_ref()
            .map(|server| server.local_addrs())
            .unwrap_or_default()
    }

    /// Block until teardown completes or `timeout` elapses. Returns [`Engine::stopped`].
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let state = self.shared.state();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| s.phase != Phase::Stopped)
            .unwrap_or_else(PoisonError::into_inner);
        state.phase == Phase::Stopped
    }

    /// Wait for the launch thread to finish its startup sequence.
    pub fn join(&self) {
        let handle = lock(&self.launch).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("engine launch thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.phase() == Phase::Running {
            self.shared.stop();
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.state)
    }

    fn halting(&self) -> bool {
        self.state().halting()
    }

    /// Run `attach` under the state lock unless a stop is already underway.
    fn attach(&self, attach: impl FnOnce(&mut EngineState)) -> bool {
        let mut state = self.state();
        if state.halting() {
            return false;
        }
        attach(&mut state);
        true
    }

    fn report(&self, err: &CoreError) {
        debug!("engine failure: {err}");
        self.hooks.on_runtime_error(&Failure::from_error(err));
    }

    fn run(&self) {
        let keep_running = match catch_unwind(AssertUnwindSafe(|| self.launch())) {
            Ok(Ok(listening)) => listening,
            Ok(Err(e)) => {
                self.report(&e);
                false
            }
            Err(payload) => {
                let failure = Failure::from_panic(payload.as_ref());
                debug!("engine launch panicked: {failure}");
                self.hooks.on_runtime_error(&failure);
                false
            }
        };
        if !keep_running {
            self.stop();
        }
    }

    /// The startup sequence. `Ok(true)` leaves the engine serving; anything else
    /// is followed by teardown.
    fn launch(&self) -> Result<bool, CoreError> {
        let config = &self.config;
        let context = Arc::new(ExecutionContext::new(
            &config.root,
            &config.cache_dir,
            config.settings.options.clone(),
        )?);
        if let Some(dir) = config.source_path.parent() {
            context.add_resource_root(dir);
        }
        if !self.attach(|state| state.context = Some(Arc::clone(&context))) {
            return Ok(false);
        }

        info!("compiling {}", config.source_path.display());
        self.hooks.on_compile_start(&context, &config.source)?;
        let program = self.compiler.compile(&context, &config.source)?;
        self.hooks.on_compile_end(&context, &config.source)?;
        if self.halting() {
            return Ok(false);
        }

        let Some(handler) = program.handler() else {
            info!("script declares no request handler; nothing to serve");
            self.hooks.on_launch_complete(&context, None, false)?;
            return Ok(false);
        };

        let log = self.hooks.on_server_create(&context, program.request_log())?;
        let tls = program.tls().or_else(|| config.tls.clone());
        let server = Arc::new(HttpServer::new(handler, log).with_tls(tls));
        if !self.attach(|state| state.server = Some(Arc::clone(&server))) {
            return Ok(false);
        }

        let specs = resolve_sockets(program.sockets(), || {
            self.hooks
                .on_default_socket_needed(&context, config.settings.port_base)
        })?;
        let retry = config.settings.bind_retry();
        let mut listening = false;
        for spec in &specs {
            if self.halting() {
                return Ok(false);
            }
            let result = bind_with_retry(&server, spec, &retry);
            if self.halting() {
                return Ok(false);
            }
            listening |= result.bound();
            self.hooks.on_socket_result(&context, &server, &result)?;
        }

        if self.halting() {
            return Ok(false);
        }
        self.hooks
            .on_launch_complete(&context, Some(&server), listening)?;
        if listening {
            info!("engine listening on {} socket(s)", server.local_addrs().len());
        } else {
            warn!("no socket bound; stopping engine");
        }
        Ok(listening)
    }

    /// Teardown. Each step runs even when an earlier one failed.
    fn stop(&self) {
        let (server, context) = {
            let mut state = self.state();
            if state.advance(Phase::Stopping).is_err() {
                return;
            }
            state.stop_requested = true;
            self.changed.notify_all();
            (state.server.clone(), state.context.clone())
        };
        debug!("stopping engine");

        if let Some(server) = server {
            if catch_unwind(AssertUnwindSafe(|| server.close())).is_err() {
                debug!("ignoring panic while closing server");
            }
        }
        if let Some(context) = &context {
            if let Err(e) = context.notify_stopped() {
                self.report(&e);
            }
        }
        if let Err(e) = self.hooks.on_stopped(context.as_deref()) {
            self.report(&e);
        }

        {
            let mut state = self.state();
            if let Err(e) = state.advance(Phase::Stopped) {
                warn!("{e}");
            }
        }
        self.changed.notify_all();
        info!("engine stopped");
    }
}
