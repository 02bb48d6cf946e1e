use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::error::{Result, SimError};
use crate::request::{RequestClass, SimRequest};

/// Three-class blocking queue with a configurable interleaving policy.
///
/// All pending work lives here; every node worker pops from the same
/// queue. One mutex guards the three sub-queues plus the closed flag and
/// the pop counter; a semaphore carries one permit per queued item so
/// that each push wakes exactly one waiter and close wakes all of them.
pub struct PrioQueue {
    state: Mutex<QueueState>,
    ready: Semaphore,
    high_prio_per_fast_track: u64,
    fast_track_drain_first: bool,
}

struct QueueState {
    fast_track: VecDeque<SimRequest>,
    high_prio: VecDeque<SimRequest>,
    low_prio: VecDeque<SimRequest>,
    max_fast_track: usize,
    max_high_prio: usize,
    max_low_prio: usize,
    /// Completed pops; drives the phase within the interleave cycle.
    pops: u64,
    closed: bool,
}

/// Point-in-time queue depths, exposed for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub fast_track: usize,
    pub high_prio: usize,
    pub low_prio: usize,
    pub closed: bool,
}

impl QueueState {
    /// Picks the next request under the lock.
    ///
    /// Interleaving runs on a cycle of `ratio + 1` pops: the last phase of
    /// each cycle prefers high-prio, every other phase prefers fast-track.
    /// With ratio 1 the pattern is fast, high, fast, high; with ratio 2 it
    /// is fast, fast, high. Low-prio is strictly residual. Drain-first
    /// empties fast-track before high-prio is considered at all.
    fn select(&mut self, drain_first: bool, ratio: u64) -> Option<SimRequest> {
        let prefer_high = if drain_first {
            false
        } else {
            ratio > 0 && self.pops % (ratio + 1) == ratio
        };

        let request = if prefer_high {
            self.high_prio
                .pop_front()
                .or_else(|| self.fast_track.pop_front())
                .or_else(|| self.low_prio.pop_front())
        } else {
            self.fast_track
                .pop_front()
                .or_else(|| self.high_prio.pop_front())
                .or_else(|| self.low_prio.pop_front())
        };

        if request.is_some() {
            self.pops += 1;
        }
        request
    }

    fn len(&self) -> usize {
        self.fast_track.len() + self.high_prio.len() + self.low_prio.len()
    }
}

impl PrioQueue {
    /// Capacity bounds of 0 mean unbounded.
    pub fn new(
        max_fast_track: usize,
        max_high_prio: usize,
        max_low_prio: usize,
        high_prio_per_fast_track: u64,
        fast_track_drain_first: bool,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                fast_track: VecDeque::new(),
                high_prio: VecDeque::new(),
                low_prio: VecDeque::new(),
                max_fast_track,
                max_high_prio,
                max_low_prio,
                pops: 0,
                closed: false,
            }),
            ready: Semaphore::new(0),
            high_prio_per_fast_track,
            fast_track_drain_first,
        }
    }

    /// Appends the request to the sub-queue selected by its class and
    /// wakes one waiter.
    ///
    /// Pushing onto a closed queue is a no-op; pushing onto a sub-queue
    /// that is at capacity fails with `QueueFull`.
    pub async fn push(&self, request: SimRequest) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.closed {
            debug!(id = %request.id, "queue closed, dropping push");
            return Ok(());
        }

        let class = request.class();
        let state = &mut *guard;
        let (queue, cap) = match class {
            RequestClass::FastTrack => (&mut state.fast_track, state.max_fast_track),
            RequestClass::HighPrio => (&mut state.high_prio, state.max_high_prio),
            RequestClass::LowPrio => (&mut state.low_prio, state.max_low_prio),
        };
        if cap > 0 && queue.len() >= cap {
            return Err(SimError::QueueFull(class));
        }
        queue.push_back(request);
        drop(guard);

        self.ready.add_permits(1);
        Ok(())
    }

    /// Blocks until a request is available or the queue is closed.
    ///
    /// After close, requests already in the queue are still delivered;
    /// `None` means the queue is closed and drained.
    pub async fn pop(&self) -> Option<SimRequest> {
        loop {
            match self.ready.acquire().await {
                Ok(permit) => {
                    let mut state = self.state.lock().await;
                    let request =
                        state.select(self.fast_track_drain_first, self.high_prio_per_fast_track);
                    if request.is_some() {
                        permit.forget();
                        return request;
                    }
                    // Permit without an item should not happen; release it
                    // and retry.
                    drop(permit);
                }
                Err(_) => {
                    // Closed: drain whatever is left, no permits required.
                    let mut state = self.state.lock().await;
                    return state.select(self.fast_track_drain_first, self.high_prio_per_fast_track);
                }
            }
        }
    }

    /// Marks the queue closed and wakes every waiter. Subsequent pushes
    /// are dropped; pops keep returning queued requests until empty.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.ready.close();
    }

    /// Closes the queue and waits until all queued requests have been
    /// popped.
    pub async fn close_and_wait(&self) {
        self.close().await;
        loop {
            if self.num_requests().await == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    pub async fn num_requests(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            fast_track: state.fast_track.len(),
            high_prio: state.high_prio.len(),
            low_prio: state.low_prio.len(),
            closed: state.closed,
        }
    }

    /// One-line diagnostic description of the queue contents.
    pub async fn summary(&self) -> String {
        let stats = self.stats().await;
        format!(
            "PrioQueue[fastTrack: {}, highPrio: {}, lowPrio: {}, closed: {}]",
            stats.fast_track, stats.high_prio, stats.low_prio, stats.closed
        )
    }
}
