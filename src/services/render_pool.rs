//! Bounded concurrency for watermark renders.
//!
//! `workers` renders run at once; at most `queue_depth` more may wait for a
//! slot. Anything beyond that is turned away with [`RenderError::Busy`]. The
//! timeout covers both the wait and the render itself.

use crate::services::watermark::{RenderError, WatermarkJob, WatermarkRenderer};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RenderPool {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    queue_depth: usize,
    timeout: Duration,
}

impl RenderPool {
    pub fn new(workers: usize, queue_depth: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            queue_depth,
            timeout,
        }
    }

    /// Run `job` on `renderer` once a worker slot is free.
    pub async fn submit(
        &self,
        renderer: &dyn WatermarkRenderer,
        job: &WatermarkJob,
    ) -> Result<(), RenderError> {
        match tokio::time::timeout(self.timeout, self.run(renderer, job)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(label = %job.label, "watermark render timed out after {:?}", self.timeout);
                Err(RenderError::Timeout(self.timeout))
            }
        }
    }

    /// Renders currently waiting for a worker.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    async fn run(
        &self,
        renderer: &dyn WatermarkRenderer,
        job: &WatermarkJob,
    ) -> Result<(), RenderError> {
        let _permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                let _slot = QueueSlot::claim(&self.waiting, self.queue_depth).ok_or_else(|| {
                    warn!(label = %job.label, "render queue full, rejecting job");
                    RenderError::Busy
                })?;
                debug!(label = %job.label, queued = self.queued(), "waiting for a render worker");
                Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| RenderError::Busy)?
            }
            Err(TryAcquireError::Closed) => return Err(RenderError::Busy),
        };

        renderer.render(job).await
    }
}

/// RAII guard that releases a queue slot on drop.
struct QueueSlot {
    counter: Arc<AtomicUsize>,
}

impl QueueSlot {
    fn claim(counter: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            counter: Arc::clone(counter),
        })
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
