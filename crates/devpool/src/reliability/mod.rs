//! Reliability patterns
//!
//! This module provides:
//! - [`RetryPolicy`] - Backoff with jitter for reattaching lost devices

mod retry;

pub use retry::RetryPolicy;
