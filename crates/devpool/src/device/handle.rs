//! Attached worker handles

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::OperationError;

/// Platform of the instrumented app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Android,
    #[serde(rename = "iOS")]
    Ios,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Android => write!(f, "Android"),
            Self::Ios => write!(f, "iOS"),
        }
    }
}

/// Descriptive metadata reported by a worker at attach time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub platform: Platform,

    /// App version string, e.g. "2.10.1"
    pub version: String,

    /// App build number
    pub build: u32,

    /// OS version details, also used as metric labels
    #[serde(default)]
    pub platform_version: BTreeMap<String, String>,

    /// Free-form platform debug fields
    #[serde(default)]
    pub debug_info: serde_json::Map<String, Value>,
}

impl WorkerMetadata {
    pub fn new(platform: Platform, version: impl Into<String>, build: u32) -> Self {
        Self {
            platform,
            version: version.into(),
            build,
            platform_version: BTreeMap::new(),
            debug_info: serde_json::Map::new(),
        }
    }

    pub fn with_platform_version(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.platform_version.insert(key.into(), value.into());
        self
    }

    pub fn with_debug_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.debug_info.insert(key.into(), value.into());
        self
    }

    /// Metric label set for this worker
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.platform_version.clone();
        labels.insert("platform".to_string(), self.platform.to_string());
        labels.insert("version".to_string(), self.version.clone());
        labels.insert("build".to_string(), self.build.to_string());
        labels
    }
}

/// Why a handle was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    /// Explicitly removed from the pool or torn down by its manager
    Removed,
    /// Quarantined after its session died
    SessionLost,
}

/// Invocable API of one attached session
#[async_trait]
pub trait WorkerSession: Send + Sync + 'static {
    /// Invoke an exported function on the instrumented process
    async fn call(&self, method: &str, args: Value) -> Result<Value, OperationError>;

    /// Liveness probe
    async fn ping(&self) -> Result<(), OperationError> {
        self.call("ping", Value::Null).await.map(|_| ())
    }

    /// Best-effort detach from the process
    async fn detach(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One attached worker: device, session and metadata
///
/// Handles are compared by instance id. A replacement worker created after
/// reattachment is always a new handle, even for the same device.
pub struct WorkerHandle {
    instance_id: Uuid,
    device_id: String,
    metadata: WorkerMetadata,
    data: Value,
    session: Arc<dyn WorkerSession>,
    destroyed: watch::Sender<Option<DestroyReason>>,
}

impl WorkerHandle {
    pub fn new(
        device_id: impl Into<String>,
        metadata: WorkerMetadata,
        session: Arc<dyn WorkerSession>,
    ) -> Self {
        let (destroyed, _) = watch::channel(None);
        Self {
            instance_id: Uuid::now_v7(),
            device_id: device_id.into(),
            metadata,
            data: Value::Object(Default::default()),
            session,
            destroyed,
        }
    }

    /// Attach display data (name, connection time, ...)
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn metadata(&self) -> &WorkerMetadata {
        &self.metadata
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn session(&self) -> &Arc<dyn WorkerSession> {
        &self.session
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.borrow().is_some()
    }

    pub fn destroy_reason(&self) -> Option<DestroyReason> {
        *self.destroyed.borrow()
    }

    /// Observe destruction without keeping the handle alive
    pub fn subscribe_destroyed(&self) -> watch::Receiver<Option<DestroyReason>> {
        self.destroyed.subscribe()
    }

    /// Mark destroyed; only the first call takes effect
    ///
    /// Returns whether this call changed the state.
    pub(crate) fn mark_destroyed(&self, reason: DestroyReason) -> bool {
        self.destroyed.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        })
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
    }
}

impl Eq for WorkerHandle {}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("instance_id", &self.instance_id)
            .field("device_id", &self.device_id)
            .field("platform", &self.metadata.platform)
            .field("version", &self.metadata.version)
            .field("build", &self.metadata.build)
            .field("destroyed", &self.destroy_reason())
            .finish()
    }
}
