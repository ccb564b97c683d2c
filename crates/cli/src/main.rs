mod commands;
mod config;
mod runtime;
mod serve;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::commands::{cmd_check, cmd_exec, cmd_keygen, cmd_reconcile, cmd_replay};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Waymark event-sourced entity lifecycle engine.
#[derive(Parser)]
#[command(
    name = "waymark",
    version,
    about = "Waymark event-sourced entity lifecycle engine"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a machine definition and print its transition table
    Check {
        /// Machine definition TOML (the built-in file machine when omitted)
        file: Option<PathBuf>,
    },

    /// Run commands from a JSON file (an object or an array of objects)
    Exec {
        /// Path to waymark.toml
        #[arg(long, default_value = "waymark.toml")]
        config: PathBuf,
        /// Command JSON file, or `-` for stdin
        commands: PathBuf,
    },

    /// Rebuild snapshots by replaying the event log
    Replay {
        /// Path to waymark.toml
        #[arg(long, default_value = "waymark.toml")]
        config: PathBuf,
        /// Entity to rebuild
        #[arg(required_unless_present = "all")]
        entity_id: Option<String>,
        /// Rebuild every entity with a snapshot
        #[arg(long, conflicts_with = "entity_id")]
        all: bool,
        /// Overwrite snapshots that disagree with the replay
        #[arg(long)]
        repair: bool,
    },

    /// Resubmit dead-lettered mirror submissions to the ledger
    Reconcile {
        /// Path to waymark.toml
        #[arg(long, default_value = "waymark.toml")]
        config: PathBuf,
        /// Dead-letter file (defaults to mirror.dead_letter)
        #[arg(long)]
        dead_letter: Option<PathBuf>,
    },

    /// Generate a signing keypair for the ledger mirror
    Keygen {
        /// Signing algorithm (only ed25519 is supported)
        #[arg(long, default_value = "ed25519")]
        algorithm: String,
        /// Output path prefix; writes <prefix>.secret and <prefix>.pub
        #[arg(long, default_value = "waymark")]
        prefix: PathBuf,
    },

    /// Start the HTTP command API
    Serve {
        /// Path to waymark.toml
        #[arg(long, default_value = "waymark.toml")]
        config: PathBuf,
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    match cli.command {
        Commands::Check { file } => {
            cmd_check(file.as_deref(), cli.output, cli.quiet);
        }
        Commands::Exec { config, commands } => {
            cmd_exec(&config, &commands, cli.output, cli.quiet);
        }
        Commands::Replay {
            config,
            entity_id,
            all,
            repair,
        } => {
            cmd_replay(&config, entity_id.as_deref(), all, repair, cli.output, cli.quiet);
        }
        Commands::Reconcile {
            config,
            dead_letter,
        } => {
            cmd_reconcile(&config, dead_letter.as_deref(), cli.output, cli.quiet);
        }
        Commands::Keygen { algorithm, prefix } => {
            cmd_keygen(&algorithm, &prefix, cli.output, cli.quiet);
        }
        Commands::Serve { config, port } => {
            let config = match config::read_config(&config) {
                Ok(c) => c,
                Err(e) => {
                    report_error(&e, cli.output, cli.quiet);
                    process::exit(1);
                }
            };
            let rt = tokio_runtime(cli.output, cli.quiet);
            if let Err(e) = rt.block_on(serve::start_server(port, config)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
    }
}

/// Log to stderr, filtered by `WAYMARK_LOG`, then `RUST_LOG`, then `info`
/// (`warn` with `--quiet`).
fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = std::env::var("WAYMARK_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub(crate) fn tokio_runtime(output: OutputFormat, quiet: bool) -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to create tokio runtime: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
