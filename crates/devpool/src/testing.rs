//! In-crate test doubles

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::device::{Platform, WorkerHandle, WorkerMetadata, WorkerSession};
use crate::error::{OperationError, ProvisionError};
use crate::manager::{Attachment, DeviceTarget, Provisioner};

/// Scriptable worker session
#[derive(Default)]
pub(crate) struct FakeSession {
    destroyed: AtomicBool,
    failing_pings: AtomicBool,
    hanging_pings: AtomicBool,
}

impl FakeSession {
    pub(crate) fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every later call fails with a destroyed session
    pub(crate) fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_pings(&self) {
        self.failing_pings.store(true, Ordering::SeqCst);
    }

    pub(crate) fn hang_pings(&self) {
        self.hanging_pings.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerSession for FakeSession {
    async fn call(&self, method: &str, args: Value) -> Result<Value, OperationError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(OperationError::session_destroyed("Script is destroyed"));
        }
        Ok(json!({ "method": method, "args": args }))
    }

    async fn ping(&self) -> Result<(), OperationError> {
        if self.hanging_pings.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing_pings.load(Ordering::SeqCst) {
            return Err(OperationError::failed("unable to connect to remote process"));
        }
        self.call("ping", Value::Null).await.map(|_| ())
    }
}

pub(crate) fn device_with(platform: Platform, version: &str, build: u32) -> Arc<WorkerHandle> {
    Arc::new(WorkerHandle::new(
        "device",
        WorkerMetadata::new(platform, version, build),
        FakeSession::healthy(),
    ))
}

pub(crate) fn android_device(version: &str) -> Arc<WorkerHandle> {
    device_with(Platform::Android, version, 4207)
}

/// Provisioner that attaches [`FakeSession`]s
#[derive(Default)]
pub(crate) struct FakeProvisioner {
    setups: AtomicU32,
    attaches: AtomicU32,
    shutdowns: AtomicU32,
    failing_attaches: Mutex<u32>,
    failing_targets: Mutex<Vec<DeviceTarget>>,
    gate: Mutex<Option<Arc<Notify>>>,
    next_metadata: Mutex<Option<WorkerMetadata>>,
    last_session: Mutex<Option<Arc<FakeSession>>>,
}

impl FakeProvisioner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` attaches fail
    pub(crate) fn fail_attaches(&self, count: u32) {
        *self.failing_attaches.lock() = count;
    }

    /// Every attach of `target` fails
    pub(crate) fn fail_target(&self, target: impl Into<DeviceTarget>) {
        self.failing_targets.lock().push(target.into());
    }

    /// Later attaches wait for one permit each from the returned gate
    pub(crate) fn hold_attaches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub(crate) fn set_next_metadata(&self, metadata: WorkerMetadata) {
        *self.next_metadata.lock() = Some(metadata);
    }

    pub(crate) fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.last_session.lock().clone()
    }

    pub(crate) fn setups(&self) -> u32 {
        self.setups.load(Ordering::SeqCst)
    }

    pub(crate) fn attaches(&self) -> u32 {
        self.attaches.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn setup(&self, _target: &DeviceTarget) -> Result<(), ProvisionError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach(&self, target: &DeviceTarget) -> Result<Attachment, ProvisionError> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.attaches.fetch_add(1, Ordering::SeqCst);

        if self.failing_targets.lock().contains(target) {
            return Err(ProvisionError::Attach(format!("{target} unreachable")));
        }
        {
            let mut failing = self.failing_attaches.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(ProvisionError::Attach("device offline".to_string()));
            }
        }

        let session = FakeSession::healthy();
        *self.last_session.lock() = Some(session.clone());
        let metadata = self
            .next_metadata
            .lock()
            .take()
            .unwrap_or_else(|| WorkerMetadata::new(Platform::Android, "2.10.1", 4207));

        Ok(Attachment {
            device_id: target.name.clone(),
            metadata,
            session,
        })
    }

    async fn shutdown(&self, _target: &DeviceTarget) -> Result<(), ProvisionError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
