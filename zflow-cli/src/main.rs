//! CLI for zflow sessions.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod exercise;
mod serve;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;
use zflow::{Config, Format};

#[derive(Parser)]
#[command(name = "zflow", version, about = "Credit-based streaming sessions over TCP")]
struct Cli {
    /// Server address.
    #[arg(long, global = true, default_value = "127.0.0.1:5550")]
    addr: String,

    /// Wire format for outbound messages.
    #[arg(long, global = true)]
    format: Option<WireFormat>,

    /// Identity placed in outbound messages.
    #[arg(long, global = true)]
    client_id: Option<String>,

    /// Configuration file (default: `<config dir>/zflow/config.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log protocol traffic to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a URI and print the body.
    Get(exercise::GetArgs),

    /// Upload a file in credit-paced chunks.
    Post(exercise::PostArgs),

    /// Fetch a URI as a streamed response, printing chunks as they arrive.
    Stream {
        /// Target URI.
        uri: String,
    },

    /// Open a duplex stream and echo lines through it.
    ///
    /// Sends `text` if given, otherwise each line of stdin.
    Ws {
        /// Target URI.
        uri: String,
        /// Single message to send before closing.
        text: Option<String>,
    },

    /// Run an echo peer.
    Serve {
        /// Address to listen on (defaults to `--addr`).
        #[arg(long)]
        listen: Option<String>,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Wire format selectable on the command line.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum WireFormat {
    /// Tagged netstrings.
    Tnetstring,
    /// JSON.
    Json,
}

impl From<WireFormat> for Format {
    fn from(f: WireFormat) -> Self {
        match f {
            WireFormat::Tnetstring => Self::Tnetstring,
            WireFormat::Json => Self::Json,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("zflow: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "zflow", &mut std::io::stdout());
            return Ok(());
        }
        let config = self.load_config()?;
        match self.command {
            Command::Get(args) => exercise::get(&self.addr, config, args).await,
            Command::Post(args) => exercise::post(&self.addr, config, args).await,
            Command::Stream { uri } => exercise::stream(&self.addr, config, &uri).await,
            Command::Ws { uri, text } => exercise::ws(&self.addr, config, &uri, text).await,
            Command::Serve { listen } => {
                serve::run(listen.as_deref().unwrap_or(&self.addr), config).await
            }
            Command::Completion { .. } => Ok(()),
        }
    }

    /// Reads the configuration file, if any, and applies flag overrides.
    fn load_config(&self) -> Result<Config> {
        let path = match &self.config {
            Some(path) => Some(path.clone()),
            None => dirs::config_dir()
                .map(|dir| dir.join("zflow").join("config.json"))
                .filter(|path| path.exists()),
        };
        let mut config = match path {
            Some(path) => Config::load(&path)
                .with_context(|| format!("cannot load config from {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(id) = &self.client_id {
            config.client_id.clone_from(id);
        }
        if let Some(format) = self.format {
            config.format = format.into();
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}
