//! Wavecall - call-signaling core for the Wavecall chat & video client
//!
//! Runs the negotiation state machine against in-process peers for
//! inspection and debugging; the production client embeds the same
//! `calling` modules.

mod calling;
mod config;
mod relay;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::calling::call_sim::{run_call_sim, SimOptions};

#[derive(Parser)]
#[command(name = "wavecall")]
#[command(about = "Call-signaling core for the Wavecall client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a two-party call through the in-memory relay
    Simulate {
        /// Stage simultaneous offers (glare) from both parties
        #[arg(long)]
        glare: bool,

        /// Fail the caller's video capture to exercise audio-only fallback
        #[arg(long)]
        no_video: bool,

        /// Deliver every signaling frame twice (at-least-once redelivery)
        #[arg(long)]
        duplicate_delivery: bool,

        /// Seconds to wait for each phase transition
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// Show the resolved configuration
    Config {
        /// Write the default configuration file if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Simulate {
            glare,
            no_video,
            duplicate_delivery,
            timeout,
        } => {
            let report = run_call_sim(&SimOptions {
                glare,
                no_video,
                duplicate_delivery,
                timeout: Duration::from_secs(timeout),
            })
            .await?;

            println!("Call simulation finished");
            println!("  connected:           {}", report.connected);
            println!(
                "  caller tracks:       audio, video={}",
                report.caller_video
            );
            println!(
                "  callee tracks:       audio, video={}",
                report.callee_video
            );
            println!(
                "  remote media seen:   caller={}, callee={}",
                report.caller_remote_media, report.callee_remote_media
            );
            println!(
                "  offer rollbacks:     caller={}, callee={}",
                report.caller_rollbacks, report.callee_rollbacks
            );
            println!("  clean teardown:      {}", report.clean_teardown);
            if let Some(warning) = &report.media_warning {
                println!("  media warning:       {}", warning);
            }
        }
        Commands::Config { init } => {
            let path = config::Config::config_path()?;
            if init && !path.exists() {
                config::Config::default().save()?;
                println!("Wrote default config to {}", path.display());
            }
            let config = config::Config::load()?;
            println!("Config path: {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
