//! Capability filters over worker metadata

use std::sync::Arc;

use super::handle::{Platform, WorkerHandle};

/// Predicate selecting acceptable workers
#[derive(Clone)]
pub struct DeviceFilter {
    description: Arc<str>,
    predicate: Arc<dyn Fn(&WorkerHandle) -> bool + Send + Sync>,
}

impl DeviceFilter {
    /// Arbitrary predicate
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&WorkerHandle) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into().into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Exact app version
    pub fn version(version: impl Into<String>) -> Self {
        let version = version.into();
        Self::new(format!("version={version}"), move |device| {
            device.metadata().version == version
        })
    }

    pub fn platform(platform: Platform) -> Self {
        Self::new(format!("platform={platform}"), move |device| {
            device.metadata().platform == platform
        })
    }

    /// App build at least `build`
    pub fn min_build(build: u32) -> Self {
        Self::new(format!("build>={build}"), move |device| {
            device.metadata().build >= build
        })
    }

    /// Both filters must accept
    pub fn and(self, other: DeviceFilter) -> Self {
        let description = format!("{} && {}", self.description, other.description);
        Self::new(description, move |device| {
            self.matches(device) && other.matches(device)
        })
    }

    pub fn matches(&self, device: &WorkerHandle) -> bool {
        (self.predicate)(device)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl std::fmt::Debug for DeviceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceFilter").field(&self.description).finish()
    }
}

/// `None` accepts every worker
pub(crate) fn accepts(filter: Option<&DeviceFilter>, device: &WorkerHandle) -> bool {
    filter.map_or(true, |filter| filter.matches(device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::WorkerMetadata;
    use crate::testing::FakeSession;

    fn device(version: &str, build: u32) -> WorkerHandle {
        WorkerHandle::new(
            "device",
            WorkerMetadata::new(Platform::Android, version, build),
            FakeSession::healthy(),
        )
    }

    #[test]
    fn test_version_filter() {
        let filter = DeviceFilter::version("2.10.1");
        assert!(filter.matches(&device("2.10.1", 4207)));
        assert!(!filter.matches(&device("2.9.0", 4000)));
        assert_eq!(filter.description(), "version=2.10.1");
    }

    #[test]
    fn test_combined_filter() {
        let filter = DeviceFilter::platform(Platform::Android).and(DeviceFilter::min_build(4100));
        assert!(filter.matches(&device("2.10.1", 4207)));
        assert!(!filter.matches(&device("2.9.0", 4000)));
    }

    #[test]
    fn test_no_filter_accepts_everything() {
        assert!(accepts(None, &device("1.0.0", 1)));
    }
}
