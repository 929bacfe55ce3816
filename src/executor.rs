// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fire-and-forget write-behind tasks.
//!
//! Work that must not hold up the caller (remote refills, proxy arming,
//! database writes) runs as a detached tokio task. Failures are logged and
//! counted, never retried or reported back. [`drain`](WriteBehindExecutor::drain)
//! waits until every task spawned so far has finished.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Default)]
pub struct WriteBehindExecutor {
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WriteBehindExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let count = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        crate::metrics::set_write_behind_in_flight(count);

        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);
        tokio::spawn(async move {
            match future.await {
                Ok(()) => {
                    debug!(task, "Write-behind task done");
                    crate::metrics::record_write_behind(task, true);
                }
                Err(e) => {
                    warn!(task, error = %e, "Write-behind task failed, dropping");
                    crate::metrics::record_write_behind(task, false);
                }
            }

            let remaining = in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
            crate::metrics::set_write_behind_in_flight(remaining);
            if remaining == 0 {
                idle.notify_waiters();
            }
        });
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no task is in flight.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}
