//! Supervised peripheral provisioning subsystem
//!
//! `start_provisioning` launches the configured program (the BLE central
//! that hands WiFi credentials to a new sprinkler peripheral and registers
//! it with the backend). The child is owned by a supervisor task: one
//! instance at a time, exit status logged, killed on `stop_provisioning`
//! or shutdown. The relay loop never waits on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::ProvisionerConfig;

/// Fire-and-forget control of the provisioning subsystem
pub trait Provisioner: Send + Sync + 'static {
    fn start(&self);
    fn stop(&self);
}

impl<T: Provisioner> Provisioner for Arc<T> {
    fn start(&self) {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }
}

struct Running {
    generation: u64,
    stop: oneshot::Sender<()>,
}

pub struct ProcessSupervisor {
    config: Option<ProvisionerConfig>,
    running: Arc<Mutex<Option<Running>>>,
    generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(config: Option<ProvisionerConfig>) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }
}

impl Provisioner for ProcessSupervisor {
    fn start(&self) {
        let Some(config) = &self.config else {
            warn!("start_provisioning received but no provisioner is configured");
            return;
        };

        let mut running = lock(&self.running);
        if running.is_some() {
            warn!("Provisioning subsystem already running, ignoring start");
            return;
        }

        let child = match Command::new(&config.program)
            .args(&config.args)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to launch {}: {}", config.program, e);
                return;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop, stop_rx) = oneshot::channel();
        *running = Some(Running { generation, stop });
        info!(
            "Provisioning subsystem started ({}, pid {:?})",
            config.program,
            child.id()
        );

        tokio::spawn(supervise(
            child,
            stop_rx,
            Arc::clone(&self.running),
            generation,
        ));
    }

    fn stop(&self) {
        match lock(&self.running).take() {
            Some(running) => {
                info!("Stopping provisioning subsystem");
                let _ = running.stop.send(());
            }
            None => info!("Provisioning subsystem not running"),
        }
    }
}

async fn supervise(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    running: Arc<Mutex<Option<Running>>>,
    generation: u64,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => info!("Provisioning subsystem finished"),
            Ok(status) => warn!("Provisioning subsystem exited with {}", status),
            Err(e) => error!("Failed to wait on provisioning subsystem: {}", e),
        },
        _ = stop_rx => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill provisioning subsystem: {}", e);
            }
            info!("Provisioning subsystem stopped");
        }
    }

    let mut running = lock(&running);
    if running.as_ref().map(|r| r.generation) == Some(generation) {
        *running = None;
    }
}

fn lock(running: &Mutex<Option<Running>>) -> MutexGuard<'_, Option<Running>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}
