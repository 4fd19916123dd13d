//! Device provisioning and reattachment
//!
//! This module provides:
//! - [`Provisioner`] - Setup, attach and shutdown of a device
//! - [`DeviceManager`] - One device's worker across reattachments

mod device_manager;
mod provision;

pub use device_manager::{DeviceManager, ManagerPhase, ReattachFailedHook};
pub use provision::{Attachment, DeviceTarget, Provisioner};
