//! # Device Pool
//!
//! Dispatches short-lived requests to a pool of attached device workers.
//!
//! ## Features
//!
//! - **FIFO wait queue**: Callers wait for a free worker in arrival order, with per-call capability filters
//! - **One operation per worker**: A worker is checked out for the duration of each call
//! - **Quarantine and retry**: Workers whose session died are discarded and the call is retried on another
//! - **Background reattachment**: Each device's manager attaches a replacement worker without blocking callers
//! - **Health checks**: Idle workers are pinged periodically and quarantined when unresponsive
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (acquire, run, quarantine + retry, timing and metrics)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DevicePool                            │
//! │  (devices, available workers, FIFO wait queue)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ add / remove
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  DeviceManager (per device)                  │
//! │  (attach, watch for session loss, reattach, teardown)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use devpool::prelude::*;
//!
//! let service = DeviceService::start(PoolConfig::from_env(), provisioner, Arc::new(NoopMetrics)).await?;
//!
//! let dispatched = service
//!     .dispatcher()
//!     .dispatch("1", Some(DeviceFilter::version("2.10.1")), None, |device, _ctx| async move {
//!         device.session().call("genAudioH", json!([token, timestamp])).await
//!     })
//!     .await;
//!
//! println!("Server-Timing: {}", dispatched.timing.server_timing());
//! let f = dispatched.result?;
//! ```

pub mod cancel;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod reliability;
pub mod service;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cancel::CancelSignal;
    pub use crate::config::PoolConfig;
    pub use crate::device::{DeviceFilter, Platform, WorkerHandle, WorkerMetadata, WorkerSession};
    pub use crate::error::{AcquireError, DispatchError, OperationError, ProvisionError};
    pub use crate::manager::{Attachment, DeviceManager, DeviceTarget, Provisioner};
    pub use crate::metrics::{NoopMetrics, PoolMetrics};
    pub use crate::pool::{CallOptions, DevicePool, Dispatcher};
    pub use crate::service::DeviceService;
}

// Re-export key types at crate root
pub use cancel::CancelSignal;
pub use config::PoolConfig;
pub use device::{DestroyReason, DeviceFilter, Platform, WorkerHandle, WorkerMetadata, WorkerSession};
pub use error::{AcquireError, CapacityShortfall, DispatchError, OperationError, ProvisionError};
pub use manager::{Attachment, DeviceManager, DeviceTarget, ManagerPhase, Provisioner};
pub use metrics::{InMemoryMetrics, NoopMetrics, PoolMetrics, RequestPhase};
pub use pool::{
    CallContext, CallOptions, CallTiming, DevicePool, DeviceSnapshot, Dispatched, Dispatcher,
    PingSummary, PoolSnapshot, VersionSummary,
};
pub use reliability::RetryPolicy;
pub use service::DeviceService;
pub use telemetry::{init_telemetry, TelemetryConfig};
