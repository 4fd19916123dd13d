//! Device pool: availability bookkeeping and worker acquisition

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::queue::WaitQueue;
use crate::cancel::CancelSignal;
use crate::device::{accepts, DestroyReason, DeviceFilter, WorkerHandle};
use crate::error::{AcquireError, CapacityShortfall};
use crate::metrics::{NoopMetrics, PoolMetrics};

/// Callback fired when a worker leaves the pool
pub type RemovalHook = Arc<dyn Fn(&Arc<WorkerHandle>) + Send + Sync>;

/// Pool bookkeeping, always mutated under one lock
#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) devices: Vec<Arc<WorkerHandle>>,
    pub(crate) available: VecDeque<Arc<WorkerHandle>>,
    pub(crate) waiting: WaitQueue,
}

impl PoolState {
    fn contains(&self, device: &WorkerHandle) -> bool {
        self.devices.iter().any(|d| **d == *device)
    }

    fn take_available(&mut self, filter: Option<&DeviceFilter>) -> Option<Arc<WorkerHandle>> {
        let index = self.available.iter().position(|d| accepts(filter, d))?;
        self.available.remove(index)
    }

    /// Offer a worker to the waiters, else park it as available
    fn make_available(&mut self, device: Arc<WorkerHandle>) {
        match self.waiting.offer(device) {
            Ok(matched) => {
                debug!(
                    waiter_id = matched.waiter_id,
                    queued_ms = matched.queued_for.as_millis() as u64,
                    "Worker handed to waiting request"
                );
            }
            Err(device) => self.available.push_back(device),
        }
    }

    /// Strip a worker from both collections; true if it was a member
    fn detach(&mut self, device: &WorkerHandle) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| **d != *device);
        self.available.retain(|d| **d != *device);
        self.devices.len() != before
    }

    fn shortfall(&self, filter: Option<&DeviceFilter>) -> CapacityShortfall {
        if self.devices.iter().any(|d| accepts(filter, d)) {
            CapacityShortfall::AllBusy
        } else if filter.is_some() {
            CapacityShortfall::NoMatchingWorkers
        } else {
            CapacityShortfall::NoWorkers
        }
    }
}

/// A worker handed to a caller, with how it was obtained
pub(crate) struct Acquired {
    pub(crate) device: Arc<WorkerHandle>,
    /// Time spent queued, if the caller had to wait
    pub(crate) waited: Option<Duration>,
    /// The wait began while the pool had no workers at all
    pub(crate) pool_was_empty: bool,
}

enum WaitOutcome {
    Assigned(Result<Arc<WorkerHandle>, oneshot::error::RecvError>),
    TimedOut,
    Cancelled(String),
}

/// A registered waiter; deregisters itself unless it received a worker
struct PendingWait<'a> {
    pool: &'a DevicePool,
    waiter_id: u64,
    rx: oneshot::Receiver<Arc<WorkerHandle>>,
    settled: bool,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.abandon_wait(self.waiter_id, &mut self.rx);
        }
    }
}

/// A worker checked out of the pool
///
/// Dropping the checkout gives the worker back, so a caller that stops
/// polling mid-operation never strands it. [`quarantine`](Self::quarantine)
/// consumes it instead.
pub(crate) struct Checkout<'a> {
    pool: &'a DevicePool,
    device: Arc<WorkerHandle>,
    settled: bool,
}

impl<'a> Checkout<'a> {
    pub(crate) fn new(pool: &'a DevicePool, device: Arc<WorkerHandle>) -> Self {
        Self {
            pool,
            device,
            settled: false,
        }
    }

    pub(crate) fn device(&self) -> &Arc<WorkerHandle> {
        &self.device
    }

    /// Return the worker to the pool
    pub(crate) fn release(self) {}

    /// Take the worker out of the pool for good
    pub(crate) fn quarantine(mut self, error: &str) -> Arc<WorkerHandle> {
        self.settled = true;
        self.pool.handle_device_unavailable(&self.device, Some(error));
        self.device.clone()
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.return_available_device(self.device.clone());
        }
    }
}

/// Pool of attached workers
///
/// Workers are handed out one caller at a time: a worker checked out by
/// [`get_available_device`](Self::get_available_device) or
/// [`wait_for_available_device`](Self::wait_for_available_device) is absent
/// from the available set until it is returned or quarantined.
///
/// # Example
///
/// ```ignore
/// use devpool::{CallOptions, DevicePool, DeviceFilter};
///
/// let pool = DevicePool::new();
/// pool.add(handle);
///
/// let options = CallOptions::default().with_filter(DeviceFilter::version("2.10.1"));
/// let f = pool
///     .call_with_device(&options, |device, _ctx| async move {
///         device.session().call("genAudioH", args.clone()).await
///     })
///     .await?;
/// ```
pub struct DevicePool {
    pub(crate) state: Mutex<PoolState>,
    metrics: Arc<dyn PoolMetrics>,
    on_device_removed: RwLock<Option<RemovalHook>>,
}

impl Default for DevicePool {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePool {
    /// Create an empty pool without metrics
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(NoopMetrics))
    }

    pub fn with_metrics(metrics: Arc<dyn PoolMetrics>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            metrics,
            on_device_removed: RwLock::new(None),
        }
    }

    /// Register the callback fired whenever a worker leaves the pool
    pub fn set_on_device_removed<F>(&self, hook: F)
    where
        F: Fn(&Arc<WorkerHandle>) + Send + Sync + 'static,
    {
        *self.on_device_removed.write() = Some(Arc::new(hook));
    }

    pub fn metrics(&self) -> &Arc<dyn PoolMetrics> {
        &self.metrics
    }

    /// Take the first available worker accepted by `filter`
    pub fn get_available_device(&self, filter: Option<&DeviceFilter>) -> Option<Arc<WorkerHandle>> {
        let mut state = self.state.lock();
        let device = state.take_available(filter)?;
        debug!(
            device_id = %device.device_id(),
            available = state.available.len(),
            total = state.devices.len(),
            "Use worker"
        );
        Some(device)
    }

    /// Take a matching worker, waiting up to `timeout` for one to free up
    ///
    /// Returns the worker and, when the caller had to queue, the time spent
    /// waiting. Without a timeout (or with a zero timeout) this never waits.
    /// When the pool has workers but none could ever match `filter`, this
    /// fails immediately instead of waiting.
    pub async fn wait_for_available_device(
        &self,
        filter: Option<DeviceFilter>,
        timeout: Option<Duration>,
        cancel: Option<&CancelSignal>,
    ) -> Result<(Arc<WorkerHandle>, Option<Duration>), AcquireError> {
        let acquired = self.acquire(filter, timeout, cancel).await?;
        Ok((acquired.device, acquired.waited))
    }

    pub(crate) async fn acquire(
        &self,
        filter: Option<DeviceFilter>,
        timeout: Option<Duration>,
        cancel: Option<&CancelSignal>,
    ) -> Result<Acquired, AcquireError> {
        let (rx, waiter_id, timeout, pool_was_empty) = {
            let mut state = self.state.lock();

            if let Some(device) = state.take_available(filter.as_ref()) {
                debug!(
                    device_id = %device.device_id(),
                    available = state.available.len(),
                    total = state.devices.len(),
                    "Use worker"
                );
                return Ok(Acquired {
                    device,
                    waited: None,
                    pool_was_empty: false,
                });
            }

            let Some(timeout) = timeout.filter(|t| !t.is_zero()) else {
                return Err(AcquireError::NoCapacity(state.shortfall(filter.as_ref())));
            };

            if !state.devices.is_empty() && !state.devices.iter().any(|d| accepts(filter.as_ref(), d)) {
                return Err(AcquireError::NoCapacity(CapacityShortfall::NoMatchingWorkers));
            }

            if let Some(reason) = cancel.and_then(|c| c.reason()) {
                return Err(AcquireError::Cancelled {
                    reason,
                    pool_was_empty: state.devices.is_empty(),
                });
            }

            debug!(
                total = state.devices.len(),
                queue = state.waiting.len() + 1,
                filter = ?filter,
                "Waiting for worker"
            );

            let pool_was_empty = state.devices.is_empty();
            let (tx, rx) = oneshot::channel();
            let waiter_id = state.waiting.push(filter, tx);
            (rx, waiter_id, timeout, pool_was_empty)
        };

        let mut pending = PendingWait {
            pool: self,
            waiter_id,
            rx,
            settled: false,
        };
        let start = Instant::now();
        let cancelled = async {
            match cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            assigned = &mut pending.rx => WaitOutcome::Assigned(assigned),
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
            reason = cancelled => WaitOutcome::Cancelled(reason),
        };

        match outcome {
            WaitOutcome::Assigned(Ok(device)) => {
                pending.settled = true;
                let waited = start.elapsed();
                debug!(
                    device_id = %device.device_id(),
                    waited_ms = waited.as_millis() as u64,
                    "Use worker after waiting"
                );
                Ok(Acquired {
                    device,
                    waited: Some(waited),
                    pool_was_empty,
                })
            }
            WaitOutcome::Assigned(Err(_)) => {
                pending.settled = true;
                Err(AcquireError::Closed)
            }
            WaitOutcome::TimedOut => {
                drop(pending);
                debug!(timeout_ms = timeout.as_millis() as u64, "Timeout waiting for worker");
                Err(AcquireError::Timeout {
                    waited: start.elapsed(),
                    pool_was_empty,
                })
            }
            WaitOutcome::Cancelled(reason) => {
                drop(pending);
                debug!(%reason, "Wait for worker cancelled");
                Err(AcquireError::Cancelled {
                    reason,
                    pool_was_empty,
                })
            }
        }
    }

    /// Deregister a waiter that gave up
    ///
    /// If a worker was handed over in the meantime it goes back to the pool.
    fn abandon_wait(&self, waiter_id: u64, rx: &mut oneshot::Receiver<Arc<WorkerHandle>>) {
        let mut state = self.state.lock();
        if state.waiting.remove(waiter_id) {
            return;
        }
        if let Ok(device) = rx.try_recv() {
            debug!(device_id = %device.device_id(), "Waiter gave up after assignment, returning worker");
            if state.contains(&device) && !device.is_destroyed() {
                state.make_available(device);
            }
        }
    }

    /// Check out `device` if it is idle
    pub(crate) fn check_out(&self, device: &Arc<WorkerHandle>) -> Option<Checkout<'_>> {
        let mut state = self.state.lock();
        let index = state.available.iter().position(|d| d == device)?;
        let device = state.available.remove(index)?;
        Some(Checkout::new(self, device))
    }

    /// Give a checked-out worker back
    ///
    /// No-op when the worker has since been removed or quarantined.
    pub fn return_available_device(&self, device: Arc<WorkerHandle>) {
        let mut state = self.state.lock();
        if !state.contains(&device) || device.is_destroyed() {
            debug!(device_id = %device.device_id(), "Returned worker is no longer in the pool");
            return;
        }
        if state.available.iter().any(|d| *d == device) {
            warn!(device_id = %device.device_id(), "Worker returned twice");
            return;
        }

        let device_id = device.device_id().to_string();
        state.make_available(device);

        debug!(
            %device_id,
            available = state.available.len(),
            total = state.devices.len(),
            "Return worker"
        );
    }

    /// Add a worker; no-op if it is already known or destroyed
    pub fn add(&self, device: Arc<WorkerHandle>) {
        let labels = device.metadata().labels();
        {
            let mut state = self.state.lock();
            if state.contains(&device) {
                return;
            }
            if device.is_destroyed() {
                warn!(device_id = %device.device_id(), "Refusing to add destroyed worker");
                return;
            }

            state.devices.push(device.clone());
            state.make_available(device.clone());

            info!(
                device_id = %device.device_id(),
                version = %device.metadata().version,
                build = device.metadata().build,
                available = state.available.len(),
                total = state.devices.len(),
                "Worker added"
            );
        }

        self.metrics.worker_added(&labels);
    }

    /// Remove a worker; no-op if it is not in the pool
    pub fn remove(&self, device: &Arc<WorkerHandle>) {
        {
            let mut state = self.state.lock();
            if !state.detach(device) {
                return;
            }
            info!(
                device_id = %device.device_id(),
                available = state.available.len(),
                total = state.devices.len(),
                "Worker removed"
            );
        }

        device.mark_destroyed(DestroyReason::Removed);
        self.notify_removed(device);
    }

    /// Quarantine a worker whose session died
    pub(crate) fn handle_device_unavailable(&self, device: &Arc<WorkerHandle>, error: Option<&str>) {
        let was_member = {
            let mut state = self.state.lock();
            let was_member = state.detach(device);
            warn!(
                device_id = %device.device_id(),
                error = error.unwrap_or("unknown"),
                available = state.available.len(),
                total = state.devices.len(),
                "Worker died"
            );
            was_member
        };

        device.mark_destroyed(DestroyReason::SessionLost);
        if was_member {
            self.notify_removed(device);
        }
    }

    fn notify_removed(&self, device: &Arc<WorkerHandle>) {
        let hook = self.on_device_removed.read().clone();
        if let Some(hook) = hook {
            hook(device);
        }
        self.metrics.worker_removed(&device.metadata().labels());
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn available_count(&self) -> usize {
        self.state.lock().available.len()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// All known workers, in add order
    pub fn devices(&self) -> Vec<Arc<WorkerHandle>> {
        self.state.lock().devices.clone()
    }

    /// Idle workers, in return/add order
    pub fn available(&self) -> Vec<Arc<WorkerHandle>> {
        self.state.lock().available.iter().cloned().collect()
    }

    pub fn contains(&self, device: &WorkerHandle) -> bool {
        self.state.lock().contains(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;
    use crate::metrics::InMemoryMetrics;
    use crate::testing::{android_device, device_with};

    #[test]
    fn test_get_return_scenario() {
        let pool = DevicePool::new();
        assert!(pool.get_available_device(None).is_none());

        let h1 = android_device("2.10.1");
        pool.add(h1.clone());

        let taken = pool.get_available_device(None).unwrap();
        assert_eq!(taken, h1);
        assert_eq!(pool.available_count(), 0);

        pool.return_available_device(taken);
        assert_eq!(pool.available(), vec![h1]);
    }

    #[test]
    fn test_add_is_idempotent() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let pool = DevicePool::with_metrics(metrics.clone());
        let device = android_device("2.10.1");

        pool.add(device.clone());
        pool.add(device.clone());

        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.available_count(), 1);
        assert_eq!(metrics.total_workers(), 1);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let pool = DevicePool::with_metrics(metrics.clone());
        pool.add(android_device("2.10.1"));

        let stranger = android_device("2.10.1");
        pool.remove(&stranger);

        assert_eq!(pool.worker_count(), 1);
        assert_eq!(metrics.total_workers(), 1);
        assert!(!stranger.is_destroyed());
    }

    #[test]
    fn test_remove_strips_and_destroys() {
        let pool = DevicePool::new();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let seen = removed.clone();
        pool.set_on_device_removed(move |d| seen.lock().push(d.instance_id()));

        let device = android_device("2.10.1");
        pool.add(device.clone());
        pool.remove(&device);
        pool.remove(&device);

        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.available_count(), 0);
        assert_eq!(device.destroy_reason(), Some(DestroyReason::Removed));
        assert_eq!(*removed.lock(), vec![device.instance_id()]);
    }

    #[test]
    fn test_available_is_subset_of_devices() {
        let pool = DevicePool::new();
        let devices: Vec<_> = (0..4).map(|_| android_device("2.10.1")).collect();
        for device in &devices {
            pool.add(device.clone());
        }
        pool.add(devices[0].clone());
        pool.remove(&devices[1]);
        let taken = pool.get_available_device(None).unwrap();
        pool.remove(&devices[3]);
        pool.return_available_device(taken.clone());
        pool.return_available_device(taken);

        let all = pool.devices();
        let available = pool.available();
        assert!(available.iter().all(|d| all.contains(d)));
        for device in &available {
            assert_eq!(available.iter().filter(|d| *d == device).count(), 1);
        }
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_return_after_removal_does_not_resurrect() {
        let pool = DevicePool::new();
        let device = android_device("2.10.1");
        pool.add(device.clone());

        let taken = pool.get_available_device(None).unwrap();
        pool.remove(&device);
        pool.return_available_device(taken);

        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn test_destroyed_worker_is_not_added() {
        let pool = DevicePool::new();
        let device = android_device("2.10.1");
        device.mark_destroyed(DestroyReason::SessionLost);
        pool.add(device);
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn test_filtered_take() {
        let pool = DevicePool::new();
        let old = android_device("2.9.0");
        let new = android_device("2.10.1");
        pool.add(old.clone());
        pool.add(new.clone());

        let filter = DeviceFilter::version("2.10.1");
        assert_eq!(pool.get_available_device(Some(&filter)), Some(new));
        assert!(pool.get_available_device(Some(&filter)).is_none());
        assert_eq!(pool.available(), vec![old]);
    }

    #[tokio::test]
    async fn test_no_timeout_fails_fast() {
        let pool = DevicePool::new();
        let err = pool.wait_for_available_device(None, None, None).await.unwrap_err();
        assert!(matches!(err, AcquireError::NoCapacity(CapacityShortfall::NoWorkers)));

        let device = android_device("2.10.1");
        pool.add(device.clone());
        let _taken = pool.get_available_device(None).unwrap();
        let err = pool
            .wait_for_available_device(None, Some(Duration::ZERO), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::NoCapacity(CapacityShortfall::AllBusy)));
    }

    #[tokio::test]
    async fn test_unmatchable_filter_fails_without_waiting() {
        let pool = DevicePool::new();
        pool.add(android_device("2.10.1"));

        let started = Instant::now();
        let err = pool
            .wait_for_available_device(
                Some(DeviceFilter::version("9.9.9")),
                Some(Duration::from_secs(30)),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AcquireError::NoCapacity(CapacityShortfall::NoMatchingWorkers)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_empty_pool() {
        let pool = DevicePool::new();
        let started = tokio::time::Instant::now();

        let err = pool
            .wait_for_available_device(None, Some(Duration::from_millis(100)), None)
            .await
            .unwrap_err();

        assert!(matches!(err, AcquireError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_fifo_wake_order() {
        let pool = Arc::new(DevicePool::new());

        let first = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.wait_for_available_device(None, Some(Duration::from_secs(5)), None)
                    .await
            }
        });
        wait_for_queue(&pool, 1).await;
        let second = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.wait_for_available_device(None, Some(Duration::from_millis(200)), None)
                    .await
            }
        });
        wait_for_queue(&pool, 2).await;

        let device = android_device("2.10.1");
        pool.add(device.clone());

        let (assigned, waited) = first.await.unwrap().unwrap();
        assert_eq!(assigned, device);
        assert!(waited.is_some());

        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, AcquireError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_filter_skip_over() {
        let pool = Arc::new(DevicePool::new());

        let ios_waiter = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.wait_for_available_device(
                    Some(DeviceFilter::platform(Platform::Ios)),
                    Some(Duration::from_secs(5)),
                    None,
                )
                .await
            }
        });
        wait_for_queue(&pool, 1).await;
        let any_waiter = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.wait_for_available_device(None, Some(Duration::from_secs(5)), None)
                    .await
            }
        });
        wait_for_queue(&pool, 2).await;

        let android = android_device("2.10.1");
        pool.add(android.clone());

        let (assigned, _) = any_waiter.await.unwrap().unwrap();
        assert_eq!(assigned, android);
        assert_eq!(pool.queue_len(), 1);

        let ios = device_with(Platform::Ios, "2.10.1", 4207);
        pool.add(ios.clone());
        let (assigned, _) = ios_waiter.await.unwrap().unwrap();
        assert_eq!(assigned, ios);
        assert_eq!(pool.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_rejects_with_reason() {
        let pool = Arc::new(DevicePool::new());
        let cancel = CancelSignal::new();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move {
                pool.wait_for_available_device(None, Some(Duration::from_secs(30)), Some(&cancel))
                    .await
            }
        });
        wait_for_queue(&pool, 1).await;

        cancel.cancel("Request aborted");
        let err = waiter.await.unwrap().unwrap_err();
        match err {
            AcquireError::Cancelled { reason, .. } => assert_eq!(reason, "Request aborted"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(pool.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_queue() {
        let pool = DevicePool::new();
        let cancel = CancelSignal::new();
        cancel.cancel("gone");

        let err = pool
            .wait_for_available_device(None, Some(Duration::from_secs(30)), Some(&cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Cancelled { .. }));
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn test_abandoned_assignment_returns_worker() {
        let pool = DevicePool::new();
        let (tx, mut rx) = oneshot::channel();
        let waiter_id = pool.state.lock().waiting.push(None, tx);

        let device = android_device("2.10.1");
        pool.add(device.clone());
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.queue_len(), 0);

        pool.abandon_wait(waiter_id, &mut rx);
        assert_eq!(pool.available(), vec![device]);
    }

    #[tokio::test]
    async fn test_dropped_wait_leaves_queue() {
        let pool = DevicePool::new();
        pool.add(android_device("2.10.1"));
        let busy = pool.get_available_device(None).unwrap();

        let mut wait = Box::pin(pool.wait_for_available_device(None, Some(Duration::from_secs(30)), None));
        assert!(futures::poll!(&mut wait).is_pending());
        assert_eq!(pool.queue_len(), 1);

        drop(wait);
        assert_eq!(pool.queue_len(), 0);
        assert_eq!(pool.snapshot().queue, 0);

        pool.return_available_device(busy.clone());
        assert_eq!(pool.available(), vec![busy]);
    }

    #[tokio::test]
    async fn test_dropped_wait_after_assignment_returns_worker() {
        let pool = DevicePool::new();
        let mut wait = Box::pin(pool.wait_for_available_device(None, Some(Duration::from_secs(30)), None));
        assert!(futures::poll!(&mut wait).is_pending());

        let device = android_device("2.10.1");
        pool.add(device.clone());
        assert_eq!(pool.available_count(), 0);

        drop(wait);
        assert_eq!(pool.available(), vec![device]);
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn test_dropped_checkout_returns_worker() {
        let pool = DevicePool::new();
        let device = android_device("2.10.1");
        pool.add(device.clone());

        let checkout = pool.check_out(&device).unwrap();
        assert!(pool.check_out(&device).is_none());
        assert_eq!(pool.available_count(), 0);

        drop(checkout);
        assert_eq!(pool.available(), vec![device]);
    }

    #[test]
    fn test_quarantined_checkout_stays_out() {
        let pool = DevicePool::new();
        let device = android_device("2.10.1");
        pool.add(device.clone());

        let checkout = pool.check_out(&device).unwrap();
        let dead = checkout.quarantine("Script is destroyed");
        assert_eq!(dead, device);
        assert!(device.is_destroyed());
        assert_eq!(pool.worker_count(), 0);
    }

    async fn wait_for_queue(pool: &DevicePool, len: usize) {
        for _ in 0..200 {
            if pool.queue_len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {len}");
    }
}
