mod commands;
mod launcher;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{LaunchArgs, EXIT_COMPILE_ERROR, EXIT_FAILURE};
use kiln_core::ShutdownSignal;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "kiln", version, about = "Launch and supervise kiln site scripts")]
struct Cli {
    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve a script until interrupted or until it asks to stop.
    Run(LaunchArgs),
    /// Serve a script and relaunch it whenever the source changes.
    Dev(LaunchArgs),
    /// Compile a script and report what it declares.
    Check(LaunchArgs),
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe") || msg.contains("failed printing to stdout") {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let shutdown = ShutdownSignal::new();
    if matches!(cli.command, Commands::Run(_) | Commands::Dev(_)) {
        shutdown.install_ctrlc();
    }

    let result = match &cli.command {
        Commands::Run(args) => commands::run::run(args, &shutdown),
        Commands::Dev(args) => commands::dev::run(args, &shutdown),
        Commands::Check(args) => commands::check::run(args),
        Commands::Completions { shell } => commands::completions::run::<Cli>(*shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("compile error:") {
                EXIT_COMPILE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
