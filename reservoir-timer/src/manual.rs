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

//! A deterministic clock for tests
//!
//! Timers are kept in a tree ordered by (deadline, registration order). Nothing fires until
//! [ManualTimer::advance()] moves the virtual clock forward, at which point every due timer runs
//! to completion in deadline order before `advance()` returns.

use super::{OnceCallback, PeriodicCallback, TimerHandle, TimerService, MIN_PERIOD};
use log::trace;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

enum Callback {
    Once(OnceCallback),
    Periodic(Duration, PeriodicCallback),
}

struct Scheduled {
    handle: TimerHandle,
    callback: Callback,
}

// (deadline since creation, sequence number)
type Slot = (Duration, u64);

#[derive(Default)]
struct Clock {
    now: Duration,
    seq: u64,
    timers: BTreeMap<Slot, Scheduled>,
}

impl Clock {
    fn insert(&mut self, deadline: Duration, scheduled: Scheduled) {
        self.seq += 1;
        self.timers.insert((deadline, self.seq), scheduled);
    }

    // pop the earliest timer that is due at or before `until`
    fn pop_due(&mut self, until: Duration) -> Option<(Duration, Scheduled)> {
        let entry = self.timers.first_entry()?;
        if entry.key().0 > until {
            return None;
        }
        let ((deadline, _), scheduled) = entry.remove_entry();
        Some((deadline, scheduled))
    }
}

/// A [TimerService] driven by hand.
#[derive(Default)]
pub struct ManualTimer {
    // never held while a callback runs, callbacks may schedule or cancel timers
    clock: Mutex<Clock>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The virtual time elapsed since this timer was created
    pub fn now(&self) -> Duration {
        self.clock.lock().now
    }

    /// The number of timers that are scheduled and not cancelled
    pub fn pending(&self) -> usize {
        self.clock
            .lock()
            .timers
            .values()
            .filter(|s| !s.handle.is_cancelled())
            .count()
    }

    /// Move the clock forward by `by`, running every timer that becomes due.
    pub async fn advance(&self, by: Duration) {
        let until = self.now() + by;
        loop {
            let due = {
                let mut clock = self.clock.lock();
                let due = clock.pop_due(until);
                if let Some((deadline, _)) = due.as_ref() {
                    clock.now = clock.now.max(*deadline);
                }
                due
            }; // lock released here
            let Some((deadline, scheduled)) = due else {
                break;
            };
            if scheduled.handle.is_cancelled() {
                continue;
            }
            trace!("manual timer {} fired at {:?}", scheduled.handle.id(), deadline);
            match scheduled.callback {
                Callback::Once(callback) => callback().await,
                Callback::Periodic(period, mut callback) => {
                    callback().await;
                    if !scheduled.handle.is_cancelled() {
                        let mut clock = self.clock.lock();
                        let next = clock.now + period;
                        clock.insert(
                            next,
                            Scheduled {
                                handle: scheduled.handle,
                                callback: Callback::Periodic(period, callback),
                            },
                        );
                    }
                }
            }
        }
        let mut clock = self.clock.lock();
        clock.now = clock.now.max(until);
    }
}

impl TimerService for ManualTimer {
    fn schedule_once(&self, delay: Duration, callback: OnceCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut clock = self.clock.lock();
        let deadline = clock.now + delay;
        clock.insert(
            deadline,
            Scheduled {
                handle: handle.clone(),
                callback: Callback::Once(callback),
            },
        );
        handle
    }

    fn schedule_periodic(&self, period: Duration, callback: PeriodicCallback) -> TimerHandle {
        let period = period.max(MIN_PERIOD);
        let handle = TimerHandle::new();
        let mut clock = self.clock.lock();
        let deadline = clock.now + period;
        clock.insert(
            deadline,
            Scheduled {
                handle: handle.clone(),
                callback: Callback::Periodic(period, callback),
            },
        );
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> OnceCallback {
        let log = log.clone();
        Box::new(move || async move { log.lock().push(name) }.boxed())
    }

    #[tokio::test]
    async fn test_fire_in_deadline_order() {
        let timer = ManualTimer::new();
        let log = Arc::new(Mutex::new(vec![]));
        timer.schedule_once(Duration::from_millis(30), record(&log, "c"));
        timer.schedule_once(Duration::from_millis(10), record(&log, "a"));
        timer.schedule_once(Duration::from_millis(10), record(&log, "b"));
        assert_eq!(timer.pending(), 3);

        timer.advance(Duration::from_millis(9)).await;
        assert!(log.lock().is_empty());

        timer.advance(Duration::from_millis(1)).await;
        assert_eq!(*log.lock(), vec!["a", "b"]);

        timer.advance(Duration::from_millis(100)).await;
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(timer.now(), Duration::from_millis(110));
        assert_eq!(timer.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_never_fires() {
        let timer = ManualTimer::new();
        let log = Arc::new(Mutex::new(vec![]));
        let handle = timer.schedule_once(Duration::from_millis(10), record(&log, "a"));
        handle.cancel();
        assert_eq!(timer.pending(), 0);
        timer.advance(Duration::from_millis(20)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_periodic_until_cancelled() {
        let timer = Arc::new(ManualTimer::new());
        let ticks = Arc::new(Mutex::new(vec![]));
        let t = timer.clone();
        let tk = ticks.clone();
        let handle = timer.schedule_periodic(
            Duration::from_millis(20),
            Box::new(move || {
                let t = t.clone();
                let tk = tk.clone();
                async move { tk.lock().push(t.now()) }.boxed()
            }),
        );

        timer.advance(Duration::from_millis(65)).await;
        assert_eq!(
            *ticks.lock(),
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(60)
            ]
        );
        handle.cancel();
        timer.advance(Duration::from_millis(100)).await;
        assert_eq!(ticks.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_callback_can_schedule() {
        let timer = Arc::new(ManualTimer::new());
        let log = Arc::new(Mutex::new(vec![]));
        let t = timer.clone();
        let l = log.clone();
        timer.schedule_once(
            Duration::from_millis(10),
            Box::new(move || {
                async move {
                    l.lock().push("first");
                    t.schedule_once(Duration::from_millis(5), record(&l, "second"));
                }
                .boxed()
            }),
        );
        timer.advance(Duration::from_millis(15)).await;
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }
}
