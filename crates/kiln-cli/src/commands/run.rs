use super::{LaunchArgs, EXIT_SUCCESS};
use crate::launcher::{host_loop, ProductionHooks};
use kiln_core::{Engine, ShutdownSignal};
use kiln_script::ScriptCompiler;
use std::sync::Arc;
use tracing::info;

pub fn run(args: &LaunchArgs, shutdown: &ShutdownSignal) -> Result<u8, String> {
    let config = args.engine_config("production")?;
    let hooks = Arc::new(ProductionHooks::new());
    let engine = Engine::new(config, Arc::new(ScriptCompiler::new()), hooks.clone());
    engine.start().map_err(|e| e.to_string())?;

    host_loop(&engine, shutdown, |output| {
        for line in output.lines() {
            info!(target: "kiln::console", "{line}");
        }
    });

    match hooks.failure() {
        Some(failure) => Err(failure.to_string()),
        None => Ok(EXIT_SUCCESS),
    }
}
