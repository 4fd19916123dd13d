//! Error types for acquisition, dispatch and provisioning
//!
//! The pool distinguishes a dead worker session ([`OperationError::SessionDestroyed`])
//! from every other operation failure by variant, never by message text.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::WorkerHandle;

/// Failure returned by an operation invoked against a worker
#[derive(Debug, Error)]
pub enum OperationError {
    /// The worker's underlying session is gone; the worker must be discarded
    #[error("worker session destroyed: {0}")]
    SessionDestroyed(String),

    /// Any other failure; the worker is assumed healthy
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl OperationError {
    /// Build a session-destroyed error
    pub fn session_destroyed(message: impl Into<String>) -> Self {
        Self::SessionDestroyed(message.into())
    }

    /// Build an ordinary failure from a message
    pub fn failed(message: impl std::fmt::Display + Send + Sync + 'static) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }

    /// Whether this error means the session is unusable
    pub fn is_session_destroyed(&self) -> bool {
        matches!(self, Self::SessionDestroyed(_))
    }
}

/// Why a request could not be given a worker without waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityShortfall {
    /// The pool has no workers at all
    NoWorkers,
    /// Workers exist but none satisfies the filter
    NoMatchingWorkers,
    /// Matching workers exist but all are busy, and waiting was not allowed
    AllBusy,
}

impl CapacityShortfall {
    fn message(&self) -> &'static str {
        match self {
            Self::NoWorkers => "No workers available",
            Self::NoMatchingWorkers => "No matching workers available",
            Self::AllBusy => "All matching workers are busy",
        }
    }
}

impl std::fmt::Display for CapacityShortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors acquiring a worker from the pool
#[derive(Debug, Error)]
pub enum AcquireError {
    /// No capacity and no waiting allowed (or waiting could never succeed)
    #[error("{0}")]
    NoCapacity(CapacityShortfall),

    /// No matching worker became free within the bound
    #[error("timed out after {waited:?} waiting for a worker to become available")]
    Timeout {
        waited: Duration,
        /// The wait began while the pool had no workers at all
        pool_was_empty: bool,
    },

    /// The caller withdrew before a worker was assigned
    #[error("request cancelled while waiting for a worker: {reason}")]
    Cancelled { reason: String, pool_was_empty: bool },

    /// The pool dropped the waiter without assigning a worker
    #[error("device pool closed while waiting for a worker")]
    Closed,
}

impl AcquireError {
    /// The failed acquisition was waiting for any worker to come online
    pub fn pool_was_empty(&self) -> bool {
        match self {
            Self::NoCapacity(shortfall) => *shortfall == CapacityShortfall::NoWorkers,
            Self::Timeout { pool_was_empty, .. } | Self::Cancelled { pool_was_empty, .. } => {
                *pool_was_empty
            }
            Self::Closed => false,
        }
    }
}

/// Errors returned by [`DevicePool::call_with_device`](crate::DevicePool::call_with_device)
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Could not acquire a worker
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    /// Every attempt ended with the worker's session dying
    #[error("worker {} session lost after {attempts} attempt(s): {message}", device.device_id())]
    SessionLost {
        /// Last worker used
        device: Arc<WorkerHandle>,
        attempts: u32,
        message: String,
    },

    /// The operation failed for any other reason
    #[error(transparent)]
    Operation(anyhow::Error),
}

impl DispatchError {
    /// HTTP status a front end should report for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Acquire(AcquireError::NoCapacity(CapacityShortfall::NoMatchingWorkers)) => 406,
            Self::Acquire(AcquireError::NoCapacity(_)) => 503,
            Self::Acquire(AcquireError::Timeout { .. }) => 503,
            Self::Acquire(AcquireError::Closed) => 503,
            Self::Acquire(AcquireError::Cancelled { .. }) => 499,
            Self::SessionLost { .. } | Self::Operation(_) => 500,
        }
    }

    /// Stable machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self.status_code() {
            406 => "unsupported_version",
            503 => "service_unavailable",
            499 => "request_cancelled",
            _ => "unknown_error",
        }
    }

    /// The worker involved, if the failure happened after acquisition
    pub fn device(&self) -> Option<&Arc<WorkerHandle>> {
        match self {
            Self::SessionLost { device, .. } => Some(device),
            _ => None,
        }
    }
}

/// Errors from the provisioning collaborator
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Device preparation failed
    #[error("device setup failed: {0}")]
    Setup(String),

    /// Attaching to the instrumented process failed
    #[error("failed to attach to device: {0}")]
    Attach(String),

    /// Attached, but the session could not describe itself
    #[error("worker handshake failed: {0}")]
    Handshake(#[source] OperationError),

    /// Teardown on the device failed
    #[error("device shutdown failed: {0}")]
    Shutdown(String),
}
