use clap::{Parser, Subcommand};
use colored::*;
use procstate_core::{ProcStateError, ProcStateResult};
use std::path::PathBuf;

use procstate_manager::cli_output;
use procstate_manager::commands::{self, Target};

#[derive(Parser)]
#[command(name = "procstate")]
#[command(about = "Inspect and edit the shared-memory process-state registry")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Application name of the registry (defaults to the config, then "procstate")
    #[arg(short = 'a', long = "app", global = true)]
    app: Option<String>,

    /// Segment id
    #[arg(short = 's', long = "segment", global = true, default_value = procstate_core::config::DEFAULT_SEGMENT_ID)]
    segment: String,

    /// YAML configuration (shm_size, max_psd_blocks, psd_timeout_secs)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Increase output verbosity (show debug messages)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered processes with their heartbeat
    List {
        /// Output as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// Show used/free process and parameter blocks
    Summary {
        /// Totals only
        #[arg(long = "short")]
        short: bool,

        /// Output as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// List the parameter names of one process
    Params {
        /// Process name
        process: String,
    },

    /// Print a parameter value
    Get {
        process: String,
        key: String,
    },

    /// Store a parameter value
    Set {
        process: String,
        key: String,
        value: String,
    },

    /// Store a parameter value and print the previous one (atomic)
    Swap {
        process: String,
        key: String,
        value: String,
    },

    /// Register a process entry and keep its heartbeat alive
    Register {
        /// Process name
        name: String,

        /// Seconds to stay registered (default: until Ctrl+C)
        #[arg(long = "hold")]
        hold: Option<u64>,

        /// Initial parameters as KEY=VALUE (repeatable)
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Detach on exit without unregistering, like a crashed process would.
        /// With no other attacher the next opener heals the segment.
        #[arg(long = "keep")]
        keep: bool,
    },

    /// Poll a parameter and print change notifications
    Watch {
        process: String,
        key: String,

        /// Polling interval in milliseconds
        #[arg(long = "interval-ms", default_value_t = 1000)]
        interval_ms: u64,

        /// Report the process as invalid when its heartbeat is older than this
        #[arg(long = "heartbeat-timeout-ms")]
        heartbeat_timeout_ms: Option<u64>,

        /// Exit after this many notifications
        #[arg(short = 'n', long = "count")]
        count: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .format_target(false)
        .init();

    log::debug!("procstate CLI v{}", env!("CARGO_PKG_VERSION"));

    let target = Target {
        app: cli.app,
        segment: cli.segment,
        config: cli.config,
    };

    if let Err(e) = run_command(&target, cli.command) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if matches!(e, ProcStateError::Config(_)) {
            cli_output::hint("every attacher must use the same shm_size; pass the same --config");
        }
        std::process::exit(1);
    }
}

fn run_command(target: &Target, command: Commands) -> ProcStateResult<()> {
    match command {
        Commands::List { json } => commands::list::run_list(target, json),
        Commands::Summary { short, json } => commands::summary::run_summary(target, short, json),
        Commands::Params { process } => commands::params::run_params(target, &process),
        Commands::Get { process, key } => commands::value::run_get(target, &process, &key),
        Commands::Set {
            process,
            key,
            value,
        } => commands::value::run_set(target, &process, &key, &value),
        Commands::Swap {
            process,
            key,
            value,
        } => commands::value::run_swap(target, &process, &key, &value),
        Commands::Register {
            name,
            hold,
            params,
            keep,
        } => commands::register::run_register(target, &name, hold, &params, keep),
        Commands::Watch {
            process,
            key,
            interval_ms,
            heartbeat_timeout_ms,
            count,
        } => commands::watch::run_watch(
            target,
            &process,
            &key,
            interval_ms,
            heartbeat_timeout_ms,
            count,
        ),
    }
}
