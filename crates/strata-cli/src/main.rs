mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_REQUEST_ERROR, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::install_signal_handler;

const DEFAULT_STORE: &str = "~/.local/share/strata";

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    version,
    about = "Machine build orchestrator with two-tier locking and progress streaming"
)]
struct Cli {
    /// Path to the strata store directory [default: $STRATA_STORE or ~/.local/share/strata].
    #[arg(long, global = true)]
    store: Option<String>,

    /// Orchestrator configuration file [default: <store>/strata.toml].
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

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
    /// Build a machine from a request file and follow its progress.
    Build {
        /// Path to the build request TOML file.
        request: PathBuf,
    },
    /// Show the stored state and build data of a machine.
    Status {
        /// Machine ID.
        machine_id: String,
    },
    /// List all known machines.
    List,
    /// Print the recorded progress events of a run.
    Events {
        /// Run ID, e.g. build-<machine-id>.
        run_id: String,
    },
    /// Revert machines left in Building by interrupted runs.
    Recover {
        /// Only consider runs older than this many seconds (overrides config).
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// Verify the checksums of all machine records.
    VerifyStore,
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
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
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
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STRATA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let store = cli
        .store
        .or_else(|| std::env::var("STRATA_STORE").ok())
        .unwrap_or_else(|| DEFAULT_STORE.to_owned());
    let store_path = expand_tilde(&store);
    let config_path = cli.config.clone();
    let ctx = commands::Context::new(store_path, config_path, cli.json);

    let result = match cli.command {
        Commands::Build { request } => commands::build::run(&ctx, &request),
        Commands::Status { machine_id } => commands::status::run(&ctx, &machine_id),
        Commands::List => commands::list::run(&ctx),
        Commands::Events { run_id } => commands::events::run(&ctx, &run_id),
        Commands::Recover { grace_secs } => commands::recover::run(&ctx, grace_secs),
        Commands::VerifyStore => commands::verify_store::run(&ctx),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("request error:") {
                EXIT_REQUEST_ERROR
            } else if msg.starts_with("store error:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
