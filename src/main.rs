use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use patchgate::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "patchgate")]
#[command(version, about = "Sandbox-verified pull requests for single-file edits")]
pub struct Cli {
    /// Path to patchgate.toml. Defaults to ./patchgate.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service and the sandbox worker
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,
    },
    /// Run the safety validator on a diff without starting the service
    Check {
        /// Repository-relative path of the file the diff edits
        #[arg(long)]
        file: String,

        /// File containing the unified diff
        #[arg(long)]
        diff: PathBuf,
    },
    /// Print the integrity hash of a diff
    Hash { diff_file: PathBuf },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    config.apply_env();
    init_tracing(config.logging.json);

    match cli.command {
        Commands::Serve { port, host } => cmd::cmd_serve(config, port, host).await,
        Commands::Check { file, diff } => {
            if !cmd::cmd_check(&file, &diff)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Hash { diff_file } => cmd::cmd_hash(&diff_file),
    }
}
