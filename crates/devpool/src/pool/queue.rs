//! Waiting callers
//!
//! Entries are matched at the moment a worker becomes available. The oldest
//! entry whose filter accepts the worker wins; entries whose filter rejects it
//! stay queued in place.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::device::{accepts, DeviceFilter, WorkerHandle};

struct Waiter {
    id: u64,
    filter: Option<DeviceFilter>,
    tx: oneshot::Sender<Arc<WorkerHandle>>,
    queued_at: Instant,
}

#[derive(Default)]
pub(crate) struct WaitQueue {
    entries: VecDeque<Waiter>,
    next_id: u64,
}

impl WaitQueue {
    /// Enqueue a waiter, returning its id
    pub(crate) fn push(
        &mut self,
        filter: Option<DeviceFilter>,
        tx: oneshot::Sender<Arc<WorkerHandle>>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(Waiter {
            id,
            filter,
            tx,
            queued_at: Instant::now(),
        });
        id
    }

    /// Deregister a waiter; false if it was already matched or removed
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|w| w.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Hand `device` to the oldest waiter that accepts it
    ///
    /// Waiters whose receiver is gone are dropped while scanning. Gives the
    /// device back when nobody takes it.
    pub(crate) fn offer(
        &mut self,
        mut device: Arc<WorkerHandle>,
    ) -> Result<WaiterMatch, Arc<WorkerHandle>> {
        let mut index = 0;
        while index < self.entries.len() {
            let waiter = &self.entries[index];
            if waiter.tx.is_closed() {
                self.entries.remove(index);
                continue;
            }
            if !accepts(waiter.filter.as_ref(), &device) {
                index += 1;
                continue;
            }

            let Some(waiter) = self.entries.remove(index) else {
                break;
            };
            let queued_for = waiter.queued_at.elapsed();
            match waiter.tx.send(device) {
                Ok(()) => {
                    return Ok(WaiterMatch {
                        waiter_id: waiter.id,
                        queued_for,
                    })
                }
                Err(returned) => device = returned,
            }
        }
        Err(device)
    }
}

/// A waiter that received a worker
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaiterMatch {
    pub(crate) waiter_id: u64,
    pub(crate) queued_for: std::time::Duration,
}
