use super::{located, LaunchArgs, EXIT_SUCCESS, POLL_INTERVAL};
use console::Style;
use kiln_core::{DevHooks, Engine, ShutdownSignal};
use kiln_script::ScriptCompiler;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Serve the script and relaunch it whenever the source file changes.
pub fn run(args: &LaunchArgs, shutdown: &ShutdownSignal) -> Result<u8, String> {
    let mut modified = modified_at(&args.src)?;
    loop {
        let hooks = Arc::new(DevHooks::new());
        let engine = launch(args, &hooks)?;

        let changed = loop {
            print_output(&engine);
            if shutdown.requested() {
                break false;
            }
            match modified_at(&args.src) {
                Ok(now) if now != modified => {
                    modified = now;
                    break true;
                }
                Ok(_) => {}
                Err(e) => debug!("{e}"),
            }
            if engine.stop_requested() && !engine.stopped() {
                engine.stop();
            }
            if engine.stopped() {
                std::thread::sleep(POLL_INTERVAL);
            } else {
                engine.wait_stopped(POLL_INTERVAL);
            }
        };

        engine.stop();
        print_output(&engine);
        if !changed {
            return Ok(EXIT_SUCCESS);
        }
        println!("{}", Style::new().yellow().apply_to("source changed, reloading"));
    }
}

/// Start a fresh engine and report how the launch went.
fn launch(args: &LaunchArgs, hooks: &Arc<DevHooks>) -> Result<Engine, String> {
    let config = args.engine_config("development")?;
    let engine = Engine::new(config, Arc::new(ScriptCompiler::new()), hooks.clone());
    engine.start().map_err(|e| e.to_string())?;
    engine.join();
    print_output(&engine);

    if let Some(failure) = hooks.last_error() {
        println!("{}", located(failure.message(), hooks.error_line()));
    } else {
        for url in hooks.service_urls() {
            println!("{} {url}", Style::new().green().apply_to("serving"));
        }
    }
    Ok(engine)
}

fn print_output(engine: &Engine) {
    let output = engine.flush_output();
    if !output.is_empty() {
        print!("{output}");
        let _ = std::io::stdout().flush();
    }
}

fn modified_at(path: &Path) -> Result<SystemTime, String> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| format!("failed to stat {}: {e}", path.display()))
}
