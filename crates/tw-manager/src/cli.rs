//! Command line

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tw_service::DEFAULT_SETTINGS_PATH;

#[derive(Debug, Parser)]
#[command(name = "tunwarden")]
#[command(version)]
#[command(about = "Privilege-separated VPN tunnel manager")]
pub struct Args {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    pub settings: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register and start the manager service
    InstallManager,
    /// Stop and remove the manager service
    UninstallManager,
    /// Run as the manager service (invoked by the service manager)
    ManagerService,
    /// Register and start a worker for a stored tunnel config
    InstallTunnel {
        /// Path to `<name>.toml`
        path: PathBuf,
    },
    /// Stop and remove a tunnel's worker service
    UninstallTunnel { name: String },
    /// Run as a tunnel worker (invoked by the service manager)
    TunnelService {
        /// Path to `<name>.toml`
        path: PathBuf,
    },

    /// List stored tunnels with their state
    List,
    /// Show a tunnel's state
    State { name: String },
    /// Start a tunnel
    Start { name: String },
    /// Stop a tunnel
    Stop { name: String },
    /// Stop a tunnel and delete its config
    Delete { name: String },
    /// Store a new tunnel from a config file
    Create {
        /// Path to `<name>.toml`; the file name names the tunnel
        path: PathBuf,
    },
    /// Print a tunnel's stored or running configuration
    Show {
        name: String,
        /// Show the configuration the running tunnel was started with
        #[arg(long)]
        runtime: bool,
    },
    /// Ask the manager to exit
    Quit {
        /// Stop running tunnels first
        #[arg(long)]
        stop_tunnels: bool,
    },
    /// Print notifications as they arrive
    Watch,

    /// Print a new random private key (base64)
    Genkey,
    /// Read a private key on stdin and print its public key
    Pubkey,
}

impl Command {
    /// Commands that run as a privileged service role
    pub fn is_service_role(&self) -> bool {
        matches!(self, Command::ManagerService | Command::TunnelService { .. })
    }

    /// Commands that talk to a running manager
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            Command::List
                | Command::State { .. }
                | Command::Start { .. }
                | Command::Stop { .. }
                | Command::Delete { .. }
                | Command::Create { .. }
                | Command::Show { .. }
                | Command::Quit { .. }
                | Command::Watch
        )
    }
}
