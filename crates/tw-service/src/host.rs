//! Service host
//!
//! Runs a role's control loop on the calling thread and turns OS stop
//! requests (SIGTERM, Ctrl-C) into [`Control::Stop`] messages. Anything
//! else holding a controller can request a stop the same way.

use crate::error::ServiceError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Requests delivered to a running role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Wind down and return from the control loop
    Stop,
}

/// A role's main loop
pub trait ControlLoop {
    /// Run until a stop arrives or the role finishes on its own
    fn run(self, controls: Receiver<Control>) -> Result<(), ServiceError>;
}

/// Hosts one control loop
pub struct ServiceHost {
    tx: Sender<Control>,
    rx: Receiver<Control>,
}

impl ServiceHost {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Sender that delivers controls to the hosted loop
    pub fn controller(&self) -> Sender<Control> {
        self.tx.clone()
    }

    /// Block until the loop exits
    pub fn run<L: ControlLoop>(self, service_name: &str, role: L) -> Result<(), ServiceError> {
        let (done_tx, done_rx) = oneshot::channel();
        let signals = spawn_signal_listener(self.tx.clone(), done_rx)?;

        info!("{} running", service_name);
        let result = role.run(self.rx);
        match &result {
            Ok(()) => info!("{} stopped", service_name),
            Err(e) => error!("{} failed: {}", service_name, e),
        }

        let _ = done_tx.send(());
        if signals.join().is_err() {
            warn!("Signal listener panicked");
        }
        result
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_signal_listener(
    tx: Sender<Control>,
    done: oneshot::Receiver<()>,
) -> Result<thread::JoinHandle<()>, ServiceError> {
    let handle = thread::Builder::new()
        .name("tw-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Failed to start signal runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                tokio::select! {
                    _ = stop_signal() => {
                        info!("Stop requested by signal");
                        let _ = tx.send(Control::Stop);
                    }
                    _ = done => debug!("Signal listener released"),
                }
            });
        })?;
    Ok(handle)
}

/// Resolves on the first SIGTERM or Ctrl-C
async fn stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Unable to watch SIGTERM: {}", e),
        }
    }
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to watch Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
