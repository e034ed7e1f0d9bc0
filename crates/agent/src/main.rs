mod api;
mod cmd;
mod config;
mod formula;
mod results;
mod scp;
mod supervisor;
mod worker;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;

#[derive(Debug, Parser)]
#[command(name = "cloudscape-agent")]
#[command(about = "Runs encrypted formula packages, reports their results and serves scp transfers", version)]
struct Cli {
    /// Agent config file (defaults to <config dir>/cloudscape/agent.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Formula packages
    Formula {
        #[command(subcommand)]
        action: FormulaCommand,
    },
    /// Formula result logs
    Results {
        #[command(subcommand)]
        action: ResultsCommand,
    },
    /// Serve a single scp transfer on stdin/stdout (run by sshd as the scp command)
    Scp {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
        args: Vec<String>,
    },
    /// Run the configured workers until stopped
    Service,
}

#[derive(Debug, Subcommand)]
enum FormulaCommand {
    /// Verify, decrypt, unpack, register and execute a package
    Run {
        uuid: String,
        /// Base64 decryption key; skips verification and registration
        #[arg(long)]
        key: Option<String>,
    },
    /// Build an encrypted package from a directory containing main.py
    Pack {
        dir: PathBuf,
        /// Package id (a random UUID when omitted)
        #[arg(long)]
        uuid: Option<String>,
        /// Output directory for <uuid>.tar.gz.enc
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum ResultsCommand {
    /// Upload at most one finished result log
    Report,
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact();
    // stdout belongs to scp and to command output, so logs never go there
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Packing and scp can run without an agent config; everything else needs one.
    let cfg = AgentConfig::load(cli.config.as_deref());
    init_logging(cfg.as_ref().ok().and_then(|c| c.log_file.as_deref()))?;

    match cli.command {
        Commands::Formula { action: FormulaCommand::Pack { dir, uuid, out } } => {
            cmd::formula_pack(dir, uuid, out).await
        }
        Commands::Formula { action: FormulaCommand::Run { uuid, key } } => {
            let code = cmd::formula_run(&cfg?, uuid, key).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Results { action: ResultsCommand::Report } => cmd::results_report(&cfg?).await,
        Commands::Scp { args } => {
            let code = cmd::scp(args).await;
            std::process::exit(code);
        }
        Commands::Service => cmd::service(&cfg?).await,
    }
}
