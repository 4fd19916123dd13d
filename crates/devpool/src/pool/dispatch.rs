//! Dispatching operations onto pooled workers

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::device_pool::{Checkout, DevicePool};
use crate::cancel::CancelSignal;
use crate::config::PoolConfig;
use crate::device::{DeviceFilter, WorkerHandle};
use crate::error::{DispatchError, OperationError};
use crate::metrics::RequestPhase;

/// Default bound on the wait for a worker
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call acquisition settings
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Only workers accepted by this filter are used
    pub filter: Option<DeviceFilter>,

    /// Bound on each wait for a worker; `None` or zero never waits
    pub timeout: Option<Duration>,

    /// Extra attempts after a worker's session dies
    pub retry: u32,

    /// Withdraws the caller while it is waiting for a worker
    pub cancel: Option<CancelSignal>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            filter: None,
            timeout: Some(DEFAULT_QUEUE_TIMEOUT),
            retry: 1,
            cancel: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail immediately when no worker is free
    pub fn without_wait(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl From<&PoolConfig> for CallOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            timeout: Some(config.queue_timeout),
            retry: config.retry,
            ..Default::default()
        }
    }
}

/// What an operation is told about its acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    /// Time this attempt spent waiting for a worker, if it had to wait
    pub waited: Option<Duration>,
    /// The wait began while the pool had no workers at all
    pub waited_for_capacity: bool,
    /// 1-based attempt number
    pub attempt: u32,
}

impl CallContext {
    /// Wait spent behind busy workers
    pub fn queue_wait(&self) -> Option<Duration> {
        self.waited.filter(|_| !self.waited_for_capacity)
    }

    /// Wait spent for any worker to come online
    pub fn attach_wait(&self) -> Option<Duration> {
        self.waited.filter(|_| self.waited_for_capacity)
    }
}

impl DevicePool {
    /// Run `operation` on a matching worker
    ///
    /// The worker goes back to the pool when the operation succeeds, fails
    /// with an ordinary error, or the returned future is dropped mid-call. When the operation reports
    /// [`OperationError::SessionDestroyed`], the worker is quarantined and the
    /// whole acquire-and-run cycle repeats up to `options.retry` more times,
    /// each wait bounded by `options.timeout` again.
    pub async fn call_with_device<T, F, Fut>(
        &self,
        options: &CallOptions,
        mut operation: F,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(Arc<WorkerHandle>, CallContext) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let mut attempt: u32 = 1;

        loop {
            let acquired = self
                .acquire(
                    options.filter.clone(),
                    options.timeout,
                    options.cancel.as_ref(),
                )
                .await?;
            let checkout = Checkout::new(self, acquired.device);
            let context = CallContext {
                waited: acquired.waited,
                waited_for_capacity: acquired.pool_was_empty,
                attempt,
            };

            let device = checkout.device().clone();
            match operation(device, context).await {
                Ok(result) => {
                    checkout.release();
                    return Ok(result);
                }
                Err(OperationError::SessionDestroyed(message)) => {
                    let device = checkout.quarantine(&message);

                    if attempt <= options.retry {
                        warn!(
                            device_id = %device.device_id(),
                            attempt,
                            retry = options.retry,
                            error = %message,
                            "Worker session died, retrying"
                        );
                        attempt += 1;
                        continue;
                    }

                    return Err(DispatchError::SessionLost {
                        device,
                        attempts: attempt,
                        message,
                    });
                }
                Err(OperationError::Failed(err)) => {
                    checkout.release();
                    return Err(DispatchError::Operation(err));
                }
            }
        }
    }
}

/// Timing side channel of one dispatched request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallTiming {
    /// Waiting while the pool had no workers
    pub attach: Option<Duration>,
    /// Waiting for a busy worker
    pub queue: Option<Duration>,
    /// Running on the last worker used
    pub process: Option<Duration>,
    pub attempts: u32,
    pub device_id: Option<String>,
}

impl CallTiming {
    /// Render as a `Server-Timing` header value
    pub fn server_timing(&self) -> String {
        let mut parts = Vec::new();
        if let Some(attach) = self.attach {
            parts.push(format!("attach;dur={}", attach.as_millis()));
        }
        parts.push(format!(
            "queue;dur={}",
            self.queue.unwrap_or_default().as_millis()
        ));
        if let Some(process) = self.process {
            parts.push(format!("process;dur={}", process.as_millis()));
        }
        parts.join(",")
    }

    fn add_wait(&mut self, waited: Duration, attaching: bool) {
        let slot = if attaching {
            &mut self.attach
        } else {
            &mut self.queue
        };
        *slot = Some(slot.unwrap_or_default() + waited);
    }
}

/// Outcome of [`Dispatcher::dispatch`]: the result plus timing, even on failure
#[derive(Debug)]
pub struct Dispatched<T> {
    pub result: Result<T, DispatchError>,
    pub timing: CallTiming,
}

/// Request-facing entry point over a [`DevicePool`]
///
/// Wraps [`DevicePool::call_with_device`] with timing and metrics reporting.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<DevicePool>,
    timeout: Option<Duration>,
    retry: u32,
}

impl Dispatcher {
    pub fn new(pool: Arc<DevicePool>) -> Self {
        let defaults = CallOptions::default();
        Self {
            pool,
            timeout: defaults.timeout,
            retry: defaults.retry,
        }
    }

    pub fn from_config(pool: Arc<DevicePool>, config: &PoolConfig) -> Self {
        Self {
            pool,
            timeout: Some(config.queue_timeout),
            retry: config.retry,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    /// Dispatch one request of `request_type`
    #[instrument(skip(self, filter, cancel, operation), fields(filter = ?filter))]
    pub async fn dispatch<T, F, Fut>(
        &self,
        request_type: &str,
        filter: Option<DeviceFilter>,
        cancel: Option<CancelSignal>,
        operation: F,
    ) -> Dispatched<T>
    where
        F: Fn(Arc<WorkerHandle>, CallContext) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let options = CallOptions {
            filter,
            timeout: self.timeout,
            retry: self.retry,
            cancel,
        };

        let timing = Arc::new(Mutex::new(CallTiming::default()));
        let wait_started = Arc::new(Mutex::new(Instant::now()));

        let result = self
            .pool
            .call_with_device(&options, |device, context| {
                {
                    let mut timing = timing.lock();
                    timing.attempts = context.attempt;
                    timing.device_id = Some(device.device_id().to_string());
                    if let Some(waited) = context.waited {
                        timing.add_wait(waited, context.waited_for_capacity);
                    }
                }

                let timing = timing.clone();
                let wait_started = wait_started.clone();
                let fut = operation(device, context);
                async move {
                    let processing = Instant::now();
                    let result = fut.await;
                    timing.lock().process = Some(processing.elapsed());
                    *wait_started.lock() = Instant::now();
                    result
                }
            })
            .await;

        let mut timing = timing.lock().clone();
        if let Err(DispatchError::Acquire(err)) = &result {
            // The last wait never produced a worker
            let waited = wait_started.lock().elapsed();
            timing.add_wait(waited, err.pool_was_empty());
        }

        self.record(request_type, &result, &timing);

        debug!(
            request_type,
            attempts = timing.attempts,
            server_timing = %timing.server_timing(),
            ok = result.is_ok(),
            "Dispatched request"
        );

        Dispatched { result, timing }
    }

    fn record<T>(&self, request_type: &str, result: &Result<T, DispatchError>, timing: &CallTiming) {
        let metrics = self.pool.metrics();
        let status = match result {
            Ok(_) => 200,
            Err(err) => err.status_code(),
        };

        metrics.request_completed(status, request_type);
        if let Some(attach) = timing.attach {
            metrics.observe_duration(status, request_type, RequestPhase::Attach, attach);
        }
        metrics.observe_duration(
            status,
            request_type,
            RequestPhase::Queue,
            timing.queue.unwrap_or_default(),
        );
        if let Some(process) = timing.process {
            metrics.observe_duration(status, request_type, RequestPhase::Process, process);
        }
    }
}
