//! tunwarden: privilege-separated VPN tunnel manager
//!
//! One binary, three faces: the manager service, one worker service per
//! running tunnel, and the unprivileged client commands that talk to the
//! manager over its control sockets.

mod backend;
mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, Command};
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tw_ipc::{spawn_listener, Broadcaster, IpcServer, ManagerClient};
use tw_net::{PrivateKey, TunnelName};
use tw_service::{
    tunnel_service_name, ConfigStore, ManagerLoop, ManagerService, ServiceHost, ServiceLifecycle,
    Settings, TunnelService, MANAGER_SERVICE_NAME,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load_or_default(&args.settings)
        .with_context(|| format!("Failed to load settings from {}", args.settings.display()))?;

    // RUST_LOG wins over the settings file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    if args.command.is_service_role() {
        info!("tunwarden {} starting", env!("CARGO_PKG_VERSION"));
    }
    if args.command.is_client() {
        // Service roles build their own runtimes; clients need only one thread
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")?;
        return runtime.block_on(run_client(args.command, &settings));
    }
    run(args.command, &settings)
}

fn run(command: Command, settings: &Settings) -> Result<()> {
    match command {
        Command::InstallManager => lifecycle(settings)?.install_manager()?,
        Command::UninstallManager => lifecycle(settings)?.uninstall_manager()?,
        Command::ManagerService => run_manager(settings)?,
        Command::InstallTunnel { path } => {
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("No tunnel config at {}", path.display()))?;
            lifecycle(settings)?.install_tunnel(&path)?;
        }
        Command::UninstallTunnel { name } => {
            lifecycle(settings)?.uninstall_tunnel(&TunnelName::new(name)?)?;
        }
        Command::TunnelService { path } => run_tunnel(settings, &path)?,
        Command::Genkey => println!("{}", PrivateKey::generate().to_base64()),
        Command::Pubkey => {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).context("Failed to read private key")?;
            let private = PrivateKey::from_base64(line.trim())?;
            println!("{}", private.public_key().to_base64());
        }
        other => anyhow::bail!("{:?} needs a running manager", other),
    }
    Ok(())
}

async fn run_client(command: Command, settings: &Settings) -> Result<()> {
    match command {
        Command::List => {
            let client = connect(settings).await?;
            for name in client.tunnels().await? {
                println!("{}\t{}", name, client.state(&name).await?);
            }
        }
        Command::State { name } => {
            let name = TunnelName::new(name)?;
            println!("{}", connect(settings).await?.state(&name).await?);
        }
        Command::Start { name } => {
            let name = TunnelName::new(name)?;
            println!("{}", connect(settings).await?.start(&name).await?);
        }
        Command::Stop { name } => {
            let name = TunnelName::new(name)?;
            println!("{}", connect(settings).await?.stop(&name).await?);
        }
        Command::Delete { name } => {
            let name = TunnelName::new(name)?;
            println!("{}", connect(settings).await?.delete(&name).await?);
        }
        Command::Create { path } => {
            let config = ConfigStore::load_path(&path)?;
            println!("Created {}", connect(settings).await?.create(config).await?);
        }
        Command::Show { name, runtime } => {
            let client = connect(settings).await?;
            let name = TunnelName::new(name)?;
            let config = if runtime {
                client.runtime_config(&name).await?
            } else {
                client.stored_config(&name).await?
            };
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Quit { stop_tunnels } => {
            if connect(settings).await?.quit(stop_tunnels).await? {
                println!("Manager was already quitting");
            } else {
                println!("Manager is quitting");
            }
        }
        Command::Watch => watch(settings).await?,
        other => anyhow::bail!("{:?} does not talk to the manager", other),
    }
    Ok(())
}

fn lifecycle(settings: &Settings) -> Result<ServiceLifecycle> {
    let executable = std::env::current_exe().context("Unable to locate own executable")?;
    Ok(ServiceLifecycle::new(
        Arc::new(backend::scm(settings)),
        executable,
        settings.poll_interval(),
    ))
}

fn run_manager(settings: &Settings) -> Result<()> {
    let host = ServiceHost::new();
    let broadcaster = Arc::new(Broadcaster::new());
    let manager = Arc::new(ManagerService::new(
        ConfigStore::new(settings.config_dir.clone()),
        Arc::new(lifecycle(settings)?),
        Arc::clone(&broadcaster),
        host.controller(),
    ));
    let server = IpcServer::bind(settings.socket_paths()).context("Failed to bind control sockets")?;
    host.run(MANAGER_SERVICE_NAME, ManagerLoop::new(server, manager))?;
    Ok(())
}

fn run_tunnel(settings: &Settings, path: &Path) -> Result<()> {
    let config = ConfigStore::load_path(path)?;
    let service_name = tunnel_service_name(&config.name);
    let (devices, reconciler) = backend::network(settings)?;
    ServiceHost::new().run(&service_name, TunnelService::new(config, devices, reconciler))?;
    Ok(())
}

async fn connect(settings: &Settings) -> Result<ManagerClient<UnixStream>> {
    let paths = settings.socket_paths();
    ManagerClient::connect(&paths)
        .await
        .with_context(|| format!("Unable to reach the manager at {}", paths.call.display()))
}

/// Print notifications until the manager goes away
async fn watch(settings: &Settings) -> Result<()> {
    let paths = settings.socket_paths();
    let calls = UnixStream::connect(&paths.call)
        .await
        .with_context(|| format!("Unable to reach the manager at {}", paths.call.display()))?;
    let events = UnixStream::connect(&paths.events)
        .await
        .context("Unable to subscribe to events")?;
    let client = ManagerClient::new(calls);
    let subscribers = client.subscribers();

    // Callbacks run on the listener; state queries happen here
    let (tx, mut rx) = mpsc::unbounded_channel();
    let changed = tx.clone();
    subscribers.on_tunnel_changed(move |name| {
        let _ = changed.send(Some(name.clone()));
    });
    subscribers.on_tunnels_changed(move || {
        let _ = tx.send(None);
    });

    let mut listener = spawn_listener(events, subscribers);
    loop {
        tokio::select! {
            Some(event) = rx.recv() => match event {
                Some(name) => match client.state(&name).await {
                    Ok(state) => println!("{}: {}", name, state),
                    Err(e) => println!("{}: {}", name, e),
                },
                None => println!("tunnel list changed"),
            },
            _ = &mut listener => break,
        }
    }
    Ok(())
}
