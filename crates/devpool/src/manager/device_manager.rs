//! Per-device lifecycle: initial attach, reattachment and teardown

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::provision::{Attachment, DeviceTarget, Provisioner};
use crate::device::{DestroyReason, WorkerHandle};
use crate::error::{OperationError, ProvisionError};
use crate::pool::DevicePool;
use crate::reliability::RetryPolicy;

/// Callback fired when reattachment gives up
pub type ReattachFailedHook = Arc<dyn Fn(&DeviceTarget, &ProvisionError) + Send + Sync>;

/// Externally visible manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerPhase {
    /// A current handle is installed and no reattachment is running
    Attached,
    /// A replacement worker is being attached
    Reattaching,
    /// Torn down; terminal
    Destroyed,
}

struct ManagerState {
    current: Arc<WorkerHandle>,
    reattach: Option<JoinHandle<()>>,
    destroyed: bool,
}

enum ReattachOutcome {
    Installed(Arc<WorkerHandle>),
    Discarded(Arc<WorkerHandle>),
    Failed(ProvisionError),
    Abandoned(ProvisionError),
}

/// Owns one device's worker across reattachments
///
/// The manager publishes its current [`WorkerHandle`] into the pool and
/// watches it. When the pool quarantines that handle after its session died,
/// the manager attaches a replacement in the background and adds it to the
/// pool. At most one reattachment runs at a time.
pub struct DeviceManager {
    target: DeviceTarget,
    display_name: String,
    pool: Arc<DevicePool>,
    provisioner: Arc<dyn Provisioner>,
    policy: RetryPolicy,
    state: Mutex<ManagerState>,
    phase: watch::Sender<ManagerPhase>,
    on_reattach_failed: RwLock<Option<ReattachFailedHook>>,
}

impl DeviceManager {
    /// Set up and attach `target`, then publish the worker into `pool`
    #[instrument(skip(pool, provisioner, target, policy), fields(device = %target))]
    pub async fn create(
        pool: Arc<DevicePool>,
        provisioner: Arc<dyn Provisioner>,
        target: DeviceTarget,
        policy: RetryPolicy,
    ) -> Result<Arc<Self>, ProvisionError> {
        provisioner.setup(&target).await?;

        let display_name = provisioner
            .display_name(&target)
            .await
            .unwrap_or_else(|| target.name.clone());

        let attachment = provisioner.attach(&target).await?;
        let handle = Arc::new(build_handle(&display_name, attachment));

        info!(
            device_id = %handle.device_id(),
            name = %display_name,
            platform = %handle.metadata().platform,
            version = %handle.metadata().version,
            build = handle.metadata().build,
            "Device attached"
        );

        let (phase, _) = watch::channel(ManagerPhase::Attached);
        let manager = Arc::new(Self {
            target,
            display_name,
            pool,
            provisioner,
            policy,
            state: Mutex::new(ManagerState {
                current: handle.clone(),
                reattach: None,
                destroyed: false,
            }),
            phase,
            on_reattach_failed: RwLock::new(None),
        });

        manager.watch_handle(&handle);
        manager.pool.add(handle);

        Ok(manager)
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The most recently installed worker
    pub fn current(&self) -> Arc<WorkerHandle> {
        self.state.lock().current.clone()
    }

    pub fn phase(&self) -> ManagerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ManagerPhase> {
        self.phase.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Register the callback fired when reattachment gives up
    pub fn set_on_reattach_failed<F>(&self, hook: F)
    where
        F: Fn(&DeviceTarget, &ProvisionError) + Send + Sync + 'static,
    {
        *self.on_reattach_failed.write() = Some(Arc::new(hook));
    }

    /// Wait until no reattachment is in flight
    pub async fn ready(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase != ManagerPhase::Reattaching).await;
    }

    /// Start reattaching in the background
    ///
    /// No-op while a reattachment is already running or after
    /// [`destroy`](Self::destroy).
    pub fn trigger_reattach(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.destroyed {
            debug!(device = %self.target, "Manager destroyed, not reattaching");
            return;
        }
        if state.reattach.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(device = %self.target, "Already attempting to reattach");
            return;
        }

        info!(device = %self.target, "Attempting to reconnect");
        self.phase.send_replace(ManagerPhase::Reattaching);

        let old = state.current.clone();
        let manager = self.clone();
        state.reattach = Some(tokio::spawn(async move {
            manager.run_reattach(old).await;
        }));
    }

    async fn run_reattach(self: Arc<Self>, old: Arc<WorkerHandle>) {
        self.pool.remove(&old);

        let result = self.attach_with_retry().await;

        let outcome = {
            let mut state = self.state.lock();
            state.reattach = None;
            match result {
                Ok(handle) if state.destroyed => ReattachOutcome::Discarded(handle),
                Ok(handle) => {
                    state.current = handle.clone();
                    ReattachOutcome::Installed(handle)
                }
                Err(err) if state.destroyed => ReattachOutcome::Abandoned(err),
                Err(err) => ReattachOutcome::Failed(err),
            }
        };

        match outcome {
            ReattachOutcome::Installed(handle) => {
                log_drift(&old, &handle);
                info!(
                    device = %self.target,
                    device_id = %handle.device_id(),
                    build = handle.metadata().build,
                    "Device reattached"
                );
                self.watch_handle(&handle);
                self.pool.add(handle);
                self.publish_attached();
            }
            ReattachOutcome::Discarded(handle) => {
                debug!(device = %self.target, "Manager destroyed during reattach, detaching new session");
                handle.mark_destroyed(DestroyReason::Removed);
                if let Err(err) = handle.session().detach().await {
                    debug!(device = %self.target, error = %err, "Failed to detach discarded session");
                }
            }
            ReattachOutcome::Abandoned(err) => {
                debug!(device = %self.target, error = %err, "Reattach failed after destroy");
            }
            ReattachOutcome::Failed(err) => {
                error!(device = %self.target, error = %err, "Reattach failed");
                self.publish_attached();
                let hook = self.on_reattach_failed.read().clone();
                if let Some(hook) = hook {
                    hook(&self.target, &err);
                }
            }
        }
    }

    /// Leave `Reattaching`; never overrides `Destroyed`
    fn publish_attached(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == ManagerPhase::Destroyed {
                return false;
            }
            *phase = ManagerPhase::Attached;
            true
        });
    }

    async fn attach_with_retry(&self) -> Result<Arc<WorkerHandle>, ProvisionError> {
        let mut attempt = 1;
        loop {
            match self.provisioner.attach(&self.target).await {
                Ok(attachment) => return Ok(Arc::new(build_handle(&self.display_name, attachment))),
                Err(err) if self.policy.has_attempts_remaining(attempt) && !self.is_destroyed() => {
                    attempt += 1;
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        device = %self.target,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attach failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reattach once `handle` is quarantined after its session died
    fn watch_handle(self: &Arc<Self>, handle: &Arc<WorkerHandle>) {
        let mut destroyed = handle.subscribe_destroyed();
        let instance_id = handle.instance_id();
        let manager: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let reason = match destroyed.wait_for(Option::is_some).await {
                Ok(reason) => *reason,
                Err(_) => return,
            };
            if reason != Some(DestroyReason::SessionLost) {
                return;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if manager.current().instance_id() != instance_id {
                debug!(device = %manager.target, "Ignoring loss of a replaced worker");
                return;
            }
            manager.trigger_reattach();
        });
    }

    /// Probe the current worker, reattaching if its session is gone
    ///
    /// The worker is checked out of the pool for the probe; when a caller
    /// holds it, the probe is skipped. Errors other than a destroyed session
    /// are returned to the caller.
    pub async fn ping(self: &Arc<Self>) -> Result<(), OperationError> {
        self.ready().await;
        let current = self.current();

        if current.is_destroyed() {
            self.trigger_reattach();
            return Ok(());
        }
        let Some(checkout) = self.pool.check_out(&current) else {
            debug!(device = %self.target, "Worker busy, skipping ping");
            return Ok(());
        };

        match current.session().ping().await {
            Ok(()) => {
                checkout.release();
                Ok(())
            }
            Err(OperationError::SessionDestroyed(message)) => {
                warn!(device = %self.target, error = %message, "Ping found session destroyed");
                checkout.quarantine(&message);
                self.trigger_reattach();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Tear down the current worker and release the device; terminal
    #[instrument(skip(self), fields(device = %self.target))]
    pub async fn destroy(&self) {
        let current = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            self.phase.send_replace(ManagerPhase::Destroyed);
            state.current.clone()
        };

        self.pool.remove(&current);
        current.mark_destroyed(DestroyReason::Removed);

        debug!("Releasing device");
        if let Err(err) = current.session().detach().await {
            debug!(error = %err, "Failed to detach session");
        }
        if let Err(err) = self.provisioner.shutdown(&self.target).await {
            warn!(error = %err, "Failed to run shutdown");
        }
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("target", &self.target)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

fn build_handle(display_name: &str, attachment: Attachment) -> WorkerHandle {
    WorkerHandle::new(attachment.device_id, attachment.metadata, attachment.session).with_data(json!({
        "name": display_name,
        "connected_at": Utc::now().to_rfc3339(),
    }))
}

fn log_drift(old: &WorkerHandle, new: &WorkerHandle) {
    let (old, new) = (old.metadata(), new.metadata());
    if old.platform_version != new.platform_version {
        info!(
            old = ?old.platform_version,
            new = ?new.platform_version,
            "System version updated while disconnected"
        );
    }
    if old.build != new.build || old.version != new.version {
        info!(
            old_version = %old.version,
            old_build = old.build,
            new_version = %new.version,
            new_build = new.build,
            "App version updated while disconnected"
        );
    }
}
