//! Pool health checks and read-only introspection

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::device_pool::{Checkout, DevicePool};
use crate::device::{Platform, WorkerHandle, WorkerMetadata};

/// Default bound on a single worker ping
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a pool-wide ping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingSummary {
    pub healthy: usize,
    pub quarantined: usize,
}

/// Read-only view of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub instance_id: Uuid,
    pub data: Value,
    pub metadata: WorkerMetadata,
    /// Checked out by a caller (or by a ping)
    pub busy: bool,
}

/// Read-only view of the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub worker_count: usize,
    pub available_count: usize,
    pub queue: usize,
    pub devices: Vec<DeviceSnapshot>,
}

/// Workers sharing one app version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub platform: Platform,
    pub version: String,
    pub build: u32,
    pub worker_count: usize,
}

impl DevicePool {
    /// Ping every idle worker with the default timeout
    pub async fn ping(&self) -> PingSummary {
        self.ping_with_timeout(DEFAULT_PING_TIMEOUT).await
    }

    /// Ping every idle worker, quarantining those that fail or time out
    ///
    /// Idle workers are checked out for the duration of the ping so a
    /// dispatched operation never shares a session with a probe. Busy workers
    /// are skipped.
    pub async fn ping_with_timeout(&self, timeout: Duration) -> PingSummary {
        let idle: Vec<Arc<WorkerHandle>> = self.state.lock().available.drain(..).collect();
        if idle.is_empty() {
            return PingSummary::default();
        }

        debug!(workers = idle.len(), "Pinging idle workers");

        let checkouts: Vec<Checkout<'_>> = idle
            .into_iter()
            .map(|device| Checkout::new(self, device))
            .collect();
        let results = join_all(checkouts.into_iter().map(|checkout| async move {
            let probe = checkout.device().session().ping();
            let outcome = match tokio::time::timeout(timeout, probe).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(format!("ping timed out after {}ms", timeout.as_millis())),
            };
            (checkout, outcome)
        }))
        .await;

        let mut summary = PingSummary::default();
        for (checkout, outcome) in results {
            match outcome {
                Ok(()) => {
                    summary.healthy += 1;
                    checkout.release();
                }
                Err(error) => {
                    summary.quarantined += 1;
                    warn!(device_id = %checkout.device().device_id(), %error, "Ping failed");
                    checkout.quarantine(&error);
                }
            }
        }
        summary
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        let devices = state
            .devices
            .iter()
            .map(|device| DeviceSnapshot {
                id: device.device_id().to_string(),
                instance_id: device.instance_id(),
                data: device.data().clone(),
                metadata: device.metadata().clone(),
                busy: !state.available.iter().any(|d| d == device),
            })
            .collect();

        PoolSnapshot {
            worker_count: state.devices.len(),
            available_count: state.available.len(),
            queue: state.waiting.len(),
            devices,
        }
    }

    /// Distinct app versions in the pool, oldest build first
    pub fn versions(&self) -> Vec<VersionSummary> {
        let mut grouped: BTreeMap<(u32, Platform, String), usize> = BTreeMap::new();
        for device in self.state.lock().devices.iter() {
            let metadata = device.metadata();
            *grouped
                .entry((metadata.build, metadata.platform, metadata.version.clone()))
                .or_insert(0) += 1;
        }

        grouped
            .into_iter()
            .map(|((build, platform, version), worker_count)| VersionSummary {
                platform,
                version,
                build,
                worker_count,
            })
            .collect()
    }

    /// Version string of the newest build in the pool
    pub fn latest_version(&self) -> Option<String> {
        self.versions().pop().map(|v| v.version)
    }
}
