//! Worker pool and request dispatch
//!
//! This module provides:
//! - [`DevicePool`] - Availability bookkeeping and the FIFO wait queue
//! - [`CallOptions`] / [`Dispatcher`] - Acquire, run, quarantine and retry
//! - [`PoolSnapshot`] / [`PingSummary`] - Health checks and introspection

mod device_pool;
mod dispatch;
mod health;
mod queue;

pub use device_pool::{DevicePool, RemovalHook};
pub use dispatch::{
    CallContext, CallOptions, CallTiming, Dispatched, Dispatcher, DEFAULT_QUEUE_TIMEOUT,
};
pub use health::{DeviceSnapshot, PingSummary, PoolSnapshot, VersionSummary, DEFAULT_PING_TIMEOUT};
