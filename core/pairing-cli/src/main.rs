//! verimezk-pair: command-line ends of a VeriMeZK pairing.
//!
//! Both sides share a storage root on one machine, so the desktop and a
//! simulated phone can run as separate processes against the same mailbox.
//!
//! ## Subcommands
//!
//! - `desktop`: Start pairing, print the join URL, stream captures as JSON lines
//! - `phone`: Send one message for a join URL (connect, document, face, ...)
//! - `mailbox`: Inspect or clear an origin's mailbox

mod desktop;
mod logging;
mod mailbox;
mod phone;

use clap::{Parser, Subcommand};
use pairing_core::{load_config, PairingConfig, StorageConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "verimezk-pair")]
#[command(about = "VeriMeZK phone-to-desktop pairing")]
#[command(version)]
struct Cli {
    /// Storage root (defaults to $VERIMEZK_HOME or ~/.verimezk)
    #[arg(long, global = true, value_name = "DIR")]
    storage_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the desktop side until the phone finishes or the timeout elapses
    Desktop {
        /// Origin this desktop is served from. Mailboxes are per origin: a
        /// phone only reaches this desktop if the join URL has the same
        /// scheme, host and port, so use the LAN address (or --host with
        /// --origin on that host) when pairing across processes
        #[arg(long, default_value = "http://localhost:3356")]
        origin: String,

        /// Host to put in the join URL instead of the discovered address
        #[arg(long)]
        host: Option<String>,

        /// Skip route discovery and use this LAN address
        #[arg(long)]
        lan_address: Option<String>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },

    /// Act as the phone for a join URL
    Phone {
        /// Join URL printed by `desktop`
        #[arg(long)]
        url: String,

        #[command(subcommand)]
        action: phone::PhoneAction,
    },

    /// Show or clear the mailbox of an origin
    Mailbox {
        #[arg(long, default_value = "http://localhost:3356")]
        origin: String,

        /// Only this session's messages
        #[arg(long)]
        session: Option<String>,

        /// Remove messages instead of listing them
        #[arg(long)]
        clear: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let storage = cli
        .storage_root
        .map(StorageConfig::with_root)
        .unwrap_or_default();
    let _logging_guard = logging::init(&storage);

    let config = match load_config(&storage.config_file()) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring invalid config, using defaults");
            PairingConfig::default()
        }
    };

    match cli.command {
        Commands::Desktop {
            origin,
            host,
            lan_address,
            timeout_secs,
        } => {
            let args = desktop::DesktopArgs {
                origin,
                host,
                lan_address,
                timeout_secs,
            };
            if let Err(e) = desktop::run(&storage, config, args) {
                tracing::error!(error = %e, "verimezk-pair desktop failed");
                std::process::exit(1);
            }
        }
        Commands::Phone { url, action } => {
            if let Err(e) = phone::run(&storage, &config, &url, action) {
                tracing::error!(error = %e, "verimezk-pair phone failed");
                std::process::exit(1);
            }
        }
        Commands::Mailbox {
            origin,
            session,
            clear,
        } => {
            if let Err(e) = mailbox::run(&storage, &config, &origin, session.as_deref(), clear) {
                tracing::error!(error = %e, "verimezk-pair mailbox failed");
                std::process::exit(1);
            }
        }
    }
}
