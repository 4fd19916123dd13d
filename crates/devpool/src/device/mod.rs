//! Worker handles and capability filters
//!
//! This module provides:
//! - [`WorkerHandle`] - One attached worker with metadata and liveness
//! - [`WorkerSession`] - The invocable API behind a worker
//! - [`DeviceFilter`] - Predicates used to select acceptable workers

mod filter;
mod handle;

pub(crate) use filter::accepts;
pub use filter::DeviceFilter;
pub use handle::{DestroyReason, Platform, WorkerHandle, WorkerMetadata, WorkerSession};
