// Copyright 2024 The Reservoir Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(clippy::all)]

//! Delayed and periodic callbacks with cancellable handles
//!
//! The connection pool never sleeps on its own. Every delay it needs (keep-alive eviction,
//! health-check period, wait timeout) goes through a [TimerService] so that the clock can be
//! swapped out:
//! - [TokioTimer] runs each timer as a task on the tokio runtime.
//! - [ManualTimer] only fires when the test driving it calls [ManualTimer::advance()].

mod manual;
mod tokio_timer;

pub use manual::ManualTimer;
pub use tokio_timer::TokioTimer;

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// The work a timer runs when it fires.
pub type TimerFuture = BoxFuture<'static, ()>;
/// The callback of a one-shot timer.
pub type OnceCallback = Box<dyn FnOnce() -> TimerFuture + Send>;
/// The callback of a periodic timer. It is called once per period, never concurrently with itself.
pub type PeriodicCallback = Box<dyn FnMut() -> TimerFuture + Send>;

/// Periods below this are rounded up so that a zero interval cannot spin.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// The scheduler seam of the pool.
pub trait TimerService: Send + Sync + 'static {
    /// Run `callback` once after `delay`, unless the returned handle is cancelled first.
    fn schedule_once(&self, delay: Duration, callback: OnceCallback) -> TimerHandle;

    /// Run `callback` every `period` until the returned handle is cancelled.
    ///
    /// The first run happens one `period` from now. The next period starts only after the
    /// future returned by the previous run completes.
    fn schedule_periodic(&self, period: Duration, callback: PeriodicCallback) -> TimerHandle;
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to cancel a scheduled timer.
///
/// Cancelling is idempotent. A callback that is already running is not interrupted, but a
/// cancelled periodic timer is not rescheduled.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl TimerHandle {
    /// Create a new armed handle. Only [TimerService] implementations need this.
    pub fn new() -> Self {
        TimerHandle {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// The unique id of this timer
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the timer
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            // notify_one() keeps a permit if the timer task is not waiting yet
            self.notify.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the timer is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_idempotent() {
        let handle = TimerHandle::new();
        let observer = handle.clone();
        assert!(!observer.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(observer.is_cancelled());
        assert_eq!(handle.id(), observer.id());
    }

    #[test]
    fn test_unique_ids() {
        let a = TimerHandle::new();
        let b = TimerHandle::new();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_cancelled_wakes() {
        let handle = TimerHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        handle.cancel();
        task.await.unwrap();
    }
}
