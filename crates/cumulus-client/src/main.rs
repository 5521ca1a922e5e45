//! # Cumulus Client
//!
//! Talks to the controller over an authenticated, encrypted session, and
//! generates the key files the grid runs on.
//!
//! ## Usage
//! ```bash
//! # Key pair for a user, plus the shared integrity key
//! client keygen --name alice --out keys/ --integrity
//!
//! # Interactive session (login, credits, buy 100, list, compute 3 + 4 - 2, logout, exit)
//! client connect --username alice
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod keygen;
mod session;

use config::ClientConfig;

/// Cumulus Client - compute sessions and key generation
#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "LOG_LEVEL", global = true)]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open an interactive session with the controller
    Connect {
        /// Configuration file path
        #[arg(short, long, default_value = "config/client.toml")]
        config: String,

        /// Username (overrides config)
        #[arg(short, long, env = "CUMULUS_USERNAME")]
        username: Option<String>,
    },

    /// Generate an identity key pair
    Keygen {
        /// Identity name, e.g. a username or "controller"
        #[arg(short, long)]
        name: String,

        /// Output directory for key files
        #[arg(short, long, default_value = "keys")]
        out: PathBuf,

        /// Also write a shared integrity key (hmac.key)
        #[arg(long)]
        integrity: bool,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    match args.command {
        Command::Connect { config, username } => {
            let config = ClientConfig::load(&config, username.as_deref())?;
            session::run(&config).await
        }
        Command::Keygen {
            name,
            out,
            integrity,
            force,
        } => {
            let generated = keygen::generate(&out, &name, integrity, force)?;
            println!("🔑 Key pair for {}", name);
            println!("   Private: {}", generated.private_key.display());
            println!("   Public:  {}", generated.public_key.display());
            println!("   {}", generated.public_base64);
            if let Some(path) = generated.integrity_key {
                println!("🛡️ Integrity key: {}", path.display());
            }
            Ok(())
        }
    }
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
