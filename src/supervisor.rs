//! Desired-state supervision of the frps server and frpc client processes.
//!
//! Every instance has a supervision record holding what the operator asked
//! for (`desired_running`) next to what was observed (the tracked process
//! and the last launch error). A per-instance reconciliation loop compares
//! the two on a fixed interval and spawns or stops processes until they
//! agree, so crashes heal without a request.
//!
//! # Locking
//!
//! One mutex guards the whole registry. Every façade operation and every
//! loop tick takes it for the full read-decide-act sequence, including the
//! spawn and the liveness probe, so two paths can never both spawn for the
//! same instance. Operations on unrelated instances serialize against each
//! other; they are infrequent and human triggered. The lock is never held
//! across an `.await`.
//!
//! # Known limitations
//!
//! Liveness is pid based (see [`crate::launcher`]). Stopping sends SIGTERM
//! and forgets the process immediately, so `running` can read false while
//! the process is still shutting down.

use crate::launcher::{self, LaunchError, ProcessHandle};
use crate::settings::{same_file, ServiceKind, SettingsError, SettingsSource, SERVER_ID};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("instance '{0}' is the server and cannot be removed")]
    ReservedInstance(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Background reconciliation task of one instance
struct Monitor {
    generation: u64,
    task: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

impl Monitor {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Supervision record of one instance
#[derive(Default)]
struct ServiceState {
    process: Option<ProcessHandle>,
    desired_running: bool,
    last_error: String,
    monitor: Option<Monitor>,
}

impl ServiceState {
    fn is_running(&self) -> bool {
        launcher::is_alive(self.process.as_ref())
    }

    fn stop_process(&mut self) {
        launcher::stop(&mut self.process);
    }

    fn record_launch(&mut self, result: Result<ProcessHandle, String>) {
        match result {
            Ok(handle) => {
                self.process = Some(handle);
                self.last_error.clear();
            }
            Err(message) => self.last_error = message,
        }
    }
}

/// All supervision records, keyed by instance id. Records are created on
/// first reference.
#[derive(Default)]
struct Registry {
    states: HashMap<String, ServiceState>,
}

impl Registry {
    fn get(&self, id: &str) -> Option<&ServiceState> {
        self.states.get(id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ServiceState> {
        self.states.get_mut(id)
    }

    fn entry(&mut self, id: &str) -> &mut ServiceState {
        self.states.entry(id.to_string()).or_default()
    }

    fn remove(&mut self, id: &str) -> Option<ServiceState> {
        self.states.remove(id)
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}

/// Point-in-time view of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub id: String,
    pub kind: ServiceKind,
    /// Whether the tracked process exists right now
    pub running: bool,
    /// What the operator last asked for
    pub desired: bool,
    /// Currently bound config path
    pub config: String,
    pub last_error: String,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

/// The supervision façade used by the dashboard API.
///
/// Created behind an `Arc`; operations that may start a reconciliation
/// loop take `&Arc<Self>` and must run inside a tokio runtime.
pub struct Supervisor {
    settings: Arc<dyn SettingsSource>,
    registry: Mutex<Registry>,
    poll_interval: Duration,
    next_generation: AtomicU64,
}

impl Supervisor {
    pub fn new(settings: Arc<dyn SettingsSource>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry: Mutex::new(Registry::default()),
            poll_interval,
            next_generation: AtomicU64::new(1),
        })
    }

    /// Want `id` running: ensure its loop and spawn now if nothing alive is
    /// tracked. Launch failures land in `last_error`, not in the result.
    pub fn start(self: &Arc<Self>, id: &str) -> Result<(), SupervisorError> {
        let mut registry = self.registry.lock();
        self.ensure_registered(id)?;
        let state = registry.entry(id);
        state.desired_running = true;
        self.ensure_monitor(id, state);
        if !state.is_running() {
            state.process = None;
            self.launch(id, state);
        }
        info!(id, pid = ?state.process.map(|p| p.pid()), "Instance started");
        Ok(())
    }

    /// Want `id` stopped and stop it now. The loop keeps running idle.
    /// An id without a record has nothing to stop and stays untracked.
    pub fn stop(&self, id: &str) {
        let mut registry = self.registry.lock();
        let Some(state) = registry.get_mut(id) else {
            return;
        };
        state.desired_running = false;
        state.stop_process();
        info!(id, "Instance stopped");
    }

    /// Stop whatever is tracked and spawn a fresh process
    pub fn restart(self: &Arc<Self>, id: &str) -> Result<(), SupervisorError> {
        let mut registry = self.registry.lock();
        self.ensure_registered(id)?;
        let state = registry.entry(id);
        state.desired_running = true;
        state.stop_process();
        self.ensure_monitor(id, state);
        self.launch(id, state);
        info!(id, pid = ?state.process.map(|p| p.pid()), "Instance restarted");
        Ok(())
    }

    /// Read-only view of `id`
    pub fn status(&self, id: &str) -> Result<ServiceStatus, SupervisorError> {
        let config = self
            .settings
            .config_path(id)?
            .ok_or_else(|| SupervisorError::UnknownInstance(id.to_string()))?;
        let registry = self.registry.lock();
        Ok(Self::snapshot(id, config, registry.get(id)))
    }

    /// Status of the server followed by every registered client, taken
    /// under a single lock acquisition.
    pub fn status_all(&self) -> Result<Vec<ServiceStatus>, SupervisorError> {
        let registry = self.registry.lock();
        let mut ids = vec![SERVER_ID.to_string()];
        ids.extend(self.settings.instance_ids()?);

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let config = self.settings.config_path(&id)?.unwrap_or_default();
            out.push(Self::snapshot(&id, config, registry.get(&id)));
        }
        Ok(out)
    }

    /// Restart `id` in place if it is meant to be running, so a saved
    /// config takes effect without waiting for a poll. Returns whether a
    /// restart happened.
    pub fn notify_config_changed(&self, id: &str) -> bool {
        let mut registry = self.registry.lock();
        match registry.get_mut(id) {
            Some(state) => self.relaunch_if_desired(id, state),
            None => false,
        }
    }

    /// Apply [`notify_config_changed`](Self::notify_config_changed) to every
    /// instance whose config resolves to `path`. Returns the restarted ids.
    pub fn notify_config_file_saved(&self, path: &Path) -> Result<Vec<String>, SupervisorError> {
        let mut registry = self.registry.lock();
        let mut ids = vec![SERVER_ID.to_string()];
        ids.extend(self.settings.instance_ids()?);

        let mut restarted = Vec::new();
        for id in ids {
            let Some(config) = self.settings.config_path(&id)? else {
                continue;
            };
            if config.is_empty() || !same_file(Path::new(&config), path) {
                continue;
            }
            if let Some(state) = registry.get_mut(&id) {
                if self.relaunch_if_desired(&id, state) {
                    restarted.push(id);
                }
            }
        }
        Ok(restarted)
    }

    /// Stop `id`, cancel its loop and forget it, then drop its descriptor
    /// from the settings.
    pub fn remove_instance(&self, id: &str) -> Result<(), SupervisorError> {
        if id == SERVER_ID {
            return Err(SupervisorError::ReservedInstance(id.to_string()));
        }
        let mut registry = self.registry.lock();
        let tracked = match registry.remove(id) {
            Some(mut state) => {
                state.desired_running = false;
                state.stop_process();
                if let Some(monitor) = state.monitor.take() {
                    monitor.cancel();
                }
                true
            }
            None => false,
        };
        let existed = self.settings.remove_instance(id)?;
        if !existed && !tracked {
            return Err(SupervisorError::UnknownInstance(id.to_string()));
        }
        info!(id, "Instance removed");
        Ok(())
    }

    /// Cancel every reconciliation loop. Tracked processes are left running
    /// unless `stop_processes` is set.
    pub fn shutdown(&self, stop_processes: bool) {
        let mut registry = self.registry.lock();
        for (id, state) in registry.states.iter_mut() {
            if let Some(monitor) = state.monitor.take() {
                monitor.cancel();
            }
            if stop_processes {
                state.stop_process();
            } else if let Some(process) = state.process {
                info!(id = %id, pid = process.pid(), "Leaving process running");
            }
        }
        info!(instances = registry.len(), "Supervisor shut down");
    }

    /// Generation of the live loop for `id`, if any. A new generation means
    /// a new task was started.
    pub fn monitor_generation(&self, id: &str) -> Option<u64> {
        let registry = self.registry.lock();
        registry
            .get(id)
            .and_then(|s| s.monitor.as_ref())
            .filter(|m| m.is_alive())
            .map(|m| m.generation)
    }

    /// One reconciliation step for `id`. Returns false once the record is
    /// gone and the loop should end.
    fn reconcile(&self, id: &str) -> bool {
        let mut registry = self.registry.lock();
        if id != SERVER_ID && matches!(self.settings.config_path(id), Ok(None)) {
            if let Some(mut state) = registry.remove(id) {
                state.stop_process();
            }
            debug!(id, "Instance is no longer registered, dropping its record");
            return false;
        }
        let Some(state) = registry.get_mut(id) else {
            return false;
        };

        if !state.desired_running {
            if state.process.is_some() {
                debug!(id, "Stopping process of an instance that should be down");
                state.stop_process();
            }
            return true;
        }

        if !state.is_running() {
            if let Some(stale) = state.process.take() {
                warn!(id, pid = stale.pid(), "Process is gone, respawning");
            }
            self.launch(id, state);
        }
        true
    }

    fn relaunch_if_desired(&self, id: &str, state: &mut ServiceState) -> bool {
        if !state.desired_running {
            return false;
        }
        state.stop_process();
        self.launch(id, state);
        info!(id, pid = ?state.process.map(|p| p.pid()), "Instance restarted for config change");
        true
    }

    /// Spawn with paths read fresh from the settings, recording the outcome
    fn launch(&self, id: &str, state: &mut ServiceState) {
        let result = self.resolve_command(id).and_then(|(binary, config)| {
            launcher::spawn(&binary, &config).map_err(|e: LaunchError| e.to_string())
        });
        if let Err(ref message) = result {
            debug!(id, error = %message, "Launch failed");
        }
        state.record_launch(result);
    }

    fn resolve_command(&self, id: &str) -> Result<(String, String), String> {
        let config = match self.settings.config_path(id) {
            Ok(Some(config)) => config,
            Ok(None) => return Err(SupervisorError::UnknownInstance(id.to_string()).to_string()),
            Err(e) => return Err(e.to_string()),
        };
        let binary = self
            .settings
            .binary_path(ServiceKind::of(id))
            .map_err(|e| e.to_string())?;
        Ok((binary, config))
    }

    /// Called with the registry lock held, so a removal cannot land between
    /// the check and the record update.
    fn ensure_registered(&self, id: &str) -> Result<(), SupervisorError> {
        if id == SERVER_ID || self.settings.config_path(id)?.is_some() {
            Ok(())
        } else {
            Err(SupervisorError::UnknownInstance(id.to_string()))
        }
    }

    fn ensure_monitor(self: &Arc<Self>, id: &str, state: &mut ServiceState) {
        if state.monitor.as_ref().is_some_and(Monitor::is_alive) {
            return;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(monitor_loop(
            Arc::downgrade(self),
            id.to_string(),
            self.poll_interval,
            cancel_rx,
        ));
        debug!(id, generation, "Reconciliation loop spawned");
        state.monitor = Some(Monitor {
            generation,
            task,
            cancel,
        });
    }

    fn snapshot(id: &str, config: String, state: Option<&ServiceState>) -> ServiceStatus {
        let process = state.and_then(|s| s.process);
        ServiceStatus {
            id: id.to_string(),
            kind: ServiceKind::of(id),
            running: state.is_some_and(ServiceState::is_running),
            desired: state.is_some_and(|s| s.desired_running),
            config,
            last_error: state.map(|s| s.last_error.clone()).unwrap_or_default(),
            pid: process.map(|p| p.pid()),
            started_at: process.map(|p| p.started_at()),
        }
    }
}

/// Level-triggered reconciliation: every tick re-evaluates desired against
/// actual state regardless of how they diverged. Ends on cancellation, when
/// the record is removed, or when the supervisor is dropped.
async fn monitor_loop(
    supervisor: Weak<Supervisor>,
    id: String,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
        }

        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        if !supervisor.reconcile(&id) {
            break;
        }
    }
    debug!(id = %id, "Reconciliation loop ended");
}
