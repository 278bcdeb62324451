//! SealNote CLI - receiver for end-to-end encrypted notes
//!
//! Usage:
//!   sealnote listen   - Pull object notifications and save decrypted notes
//!   sealnote decrypt  - Open a single payload file with the private key
//!   sealnote seal     - Produce a payload the way the mobile client does

mod listen;
mod local;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sealnote")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Receive, decrypt and save end-to-end encrypted notes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the notification listener until interrupted
    Listen(listen::ListenArgs),

    /// Decrypt a payload file (wrapper or bare envelope)
    Decrypt(local::DecryptArgs),

    /// Encrypt a file into an uploadable payload
    Seal(local::SealArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen(args) => listen::run(args).await,
        Commands::Decrypt(args) => local::decrypt(args),
        Commands::Seal(args) => local::seal(args),
    }
}
