//! Provisioning collaborator

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::{WorkerMetadata, WorkerSession};
use crate::error::ProvisionError;

/// Address of a physical or virtual device, e.g. `192.168.1.20:5555`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTarget {
    pub name: String,
}

impl DeviceTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Leading IP address of the target, if it has one
    ///
    /// Accepts `1.2.3.4:5555` and `[::1]:5555` forms. Serial numbers and
    /// emulator names have none.
    pub fn ip_address(&self) -> Option<IpAddr> {
        let name = self.name.as_str();
        if let Some(rest) = name.strip_prefix('[') {
            let (host, _) = rest.split_once(']')?;
            return host.parse().ok();
        }

        let end = name
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(name.len());
        name[..end].parse().ok()
    }
}

impl std::fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for DeviceTarget {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DeviceTarget {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// A freshly attached worker session and what it reported about itself
pub struct Attachment {
    pub device_id: String,
    pub metadata: WorkerMetadata,
    pub session: Arc<dyn WorkerSession>,
}

/// Prepares devices and attaches worker sessions to them
///
/// Only [`DeviceManager`](super::DeviceManager) talks to the provisioner.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Prepare the device; idempotent, run before the first attach
    async fn setup(&self, target: &DeviceTarget) -> Result<(), ProvisionError>;

    /// Attach a new session; failure leaves the pool untouched
    async fn attach(&self, target: &DeviceTarget) -> Result<Attachment, ProvisionError>;

    /// Release the device; failures are logged by the caller
    async fn shutdown(&self, target: &DeviceTarget) -> Result<(), ProvisionError>;

    /// Friendly name for display, e.g. from reverse DNS of the target address
    async fn display_name(&self, _target: &DeviceTarget) -> Option<String> {
        None
    }
}
