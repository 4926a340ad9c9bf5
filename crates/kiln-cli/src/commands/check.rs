use super::{located, spin_fail, spin_ok, spinner, LaunchArgs, EXIT_SUCCESS};
use kiln_core::{CompiledProgram, ExecutionContext};
use kiln_script::ScriptCompiler;
use tracing::warn;

/// Compile the script without serving it.
pub fn run(args: &LaunchArgs) -> Result<u8, String> {
    let source = args.read_source()?;
    let settings = args.settings("production")?;
    let context = ExecutionContext::new(&args.root_dir()?, &args.cache_dir()?, settings.options)
        .map_err(|e| e.to_string())?;
    if let Some(dir) = args.src.parent() {
        context.add_resource_root(dir);
    }

    let pb = spinner("compiling...");
    let compiled = ScriptCompiler::new().compile_site(&context, &source);
    let output = context.flush_output();
    if let Err(e) = context.notify_stopped() {
        warn!("failed to clean up workdir: {e}");
    }

    let program = match compiled {
        Ok(program) => program,
        Err(e) => {
            spin_fail(&pb, &format!("{} failed to compile", args.src.display()));
            print!("{output}");
            return Err(format!("compile error: {}", located(&e.message, e.line)));
        }
    };
    spin_ok(&pb, &format!("{} compiled", args.src.display()));
    print!("{output}");

    let sockets = program.sockets();
    println!("routes: {}", program.routes());
    if sockets.is_empty() {
        println!("sockets: default (port base {})", settings.port_base);
    } else {
        for socket in &sockets {
            println!("socket: {socket}");
        }
    }
    if program.tls().is_some() {
        println!("tls: configured");
    }
    Ok(EXIT_SUCCESS)
}
