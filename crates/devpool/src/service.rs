//! Device service: pool, managers and the health loop

use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::ProvisionError;
use crate::manager::{DeviceManager, DeviceTarget, ManagerPhase, Provisioner};
use crate::metrics::PoolMetrics;
use crate::pool::{DevicePool, Dispatcher};

/// Runs a [`DevicePool`] fed by one [`DeviceManager`] per device
///
/// # Example
///
/// ```ignore
/// use devpool::{DeviceService, NoopMetrics, PoolConfig};
///
/// let service = DeviceService::start(PoolConfig::from_env(), provisioner, Arc::new(NoopMetrics)).await?;
/// let dispatcher = service.dispatcher();
///
/// tokio::select! {
///     _ = serve(dispatcher) => {}
///     _ = service.shutdown_requested() => {}
/// }
/// service.shutdown().await;
/// ```
pub struct DeviceService {
    config: PoolConfig,
    pool: Arc<DevicePool>,
    provisioner: Arc<dyn Provisioner>,
    managers: Mutex<Vec<Arc<DeviceManager>>>,
    shutdown_requested: CancellationToken,
    health_stop: CancellationToken,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceService {
    /// Attach every configured device and start the health loop
    ///
    /// Fails if any configured device cannot be attached; devices attached
    /// before the failure are released again.
    #[instrument(skip_all, fields(devices = config.devices.len()))]
    pub async fn start(
        config: PoolConfig,
        provisioner: Arc<dyn Provisioner>,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Result<Arc<Self>, ProvisionError> {
        let pool = Arc::new(DevicePool::with_metrics(metrics));
        let service = Arc::new(Self {
            config,
            pool,
            provisioner,
            managers: Mutex::new(Vec::new()),
            shutdown_requested: CancellationToken::new(),
            health_stop: CancellationToken::new(),
            health_handle: Mutex::new(None),
        });

        for target in service.config.devices.clone() {
            if let Err(err) = service.add_device(target.clone()).await {
                error!(device = %target, error = %err, "Failed to attach device");
                service.shutdown().await;
                return Err(err);
            }
        }

        service.start_health_loop();

        info!(
            workers = service.pool.worker_count(),
            ping_interval_ms = service.config.ping_interval.as_millis() as u64,
            "Device service started"
        );

        Ok(service)
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn managers(&self) -> Vec<Arc<DeviceManager>> {
        self.managers.lock().clone()
    }

    /// Dispatcher using the configured queue timeout and retry budget
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::from_config(self.pool.clone(), &self.config)
    }

    /// Attach another device at runtime
    pub async fn add_device(
        self: &Arc<Self>,
        target: DeviceTarget,
    ) -> Result<Arc<DeviceManager>, ProvisionError> {
        let manager = DeviceManager::create(
            self.pool.clone(),
            self.provisioner.clone(),
            target,
            self.config.reattach.clone(),
        )
        .await?;

        let service: Weak<Self> = Arc::downgrade(self);
        manager.set_on_reattach_failed(move |target, err| {
            let Some(service) = service.upgrade() else {
                return;
            };
            if service.config.shutdown_on_reattach_failure {
                error!(device = %target, error = %err, "Device lost, requesting shutdown");
                service.request_shutdown();
            } else {
                warn!(device = %target, error = %err, "Device lost, will retry on next health check");
            }
        });

        self.managers.lock().push(manager.clone());
        Ok(manager)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.is_cancelled()
    }

    /// Resolves once the service asked to be shut down
    pub async fn shutdown_requested(&self) {
        self.shutdown_requested.cancelled().await;
    }

    fn start_health_loop(self: &Arc<Self>) {
        let service = Arc::downgrade(self);
        let stop = self.health_stop.clone();
        let period = self.config.ping_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(service) = service.upgrade() else {
                            break;
                        };
                        service.check_health().await;
                    }
                }
            }

            debug!("Health loop exited");
        });

        *self.health_handle.lock() = Some(handle);
    }

    /// One health check round
    ///
    /// Pings idle workers and retries reattachment for devices whose last
    /// reattachment failed.
    pub async fn check_health(self: &Arc<Self>) {
        let summary = self.pool.ping_with_timeout(self.config.ping_timeout).await;
        if summary.quarantined > 0 {
            warn!(
                healthy = summary.healthy,
                quarantined = summary.quarantined,
                "Health check quarantined workers"
            );
        } else {
            debug!(healthy = summary.healthy, "Health check passed");
        }

        for manager in self.managers() {
            if manager.phase() == ManagerPhase::Attached && manager.current().is_destroyed() {
                manager.trigger_reattach();
            }
        }
    }

    /// Stop the health loop and release every device
    pub async fn shutdown(&self) {
        self.health_stop.cancel();
        let handle = self.health_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "Health loop panicked");
            }
        }

        let managers: Vec<_> = std::mem::take(&mut *self.managers.lock());
        join_all(managers.iter().map(|manager| manager.destroy())).await;

        info!("Device service stopped");
    }
}
