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

//! Timers backed by the tokio runtime

use super::{OnceCallback, PeriodicCallback, TimerHandle, TimerService, MIN_PERIOD};
use log::trace;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::sleep;

/// A [TimerService] that runs every timer as its own tokio task.
///
/// Each task sleeps on the tokio clock, so tests can control it with `tokio::time::pause()`.
#[derive(Debug, Default, Clone)]
pub struct TokioTimer {
    runtime: Option<Handle>,
}

impl TokioTimer {
    /// Create a [TokioTimer] that spawns onto the runtime the timer is scheduled from.
    ///
    /// Scheduling outside of a tokio runtime panics, as `tokio::spawn()` does.
    pub fn new() -> Self {
        TokioTimer { runtime: None }
    }

    /// Create a [TokioTimer] that always spawns onto the given runtime.
    pub fn with_runtime(runtime: Handle) -> Self {
        TokioTimer {
            runtime: Some(runtime),
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // the JoinHandle is dropped, the task detaches and is stopped through the TimerHandle
        match &self.runtime {
            Some(rt) => drop(rt.spawn(fut)),
            None => drop(tokio::spawn(fut)),
        }
    }
}

// true if the delay elapsed, false if the timer got cancelled first
async fn wait_or_cancel(stub: &TimerHandle, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stub.cancelled() => false,
        _ = sleep(delay) => !stub.is_cancelled(),
    }
}

impl TimerService for TokioTimer {
    fn schedule_once(&self, delay: Duration, callback: OnceCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        let stub = handle.clone();
        self.spawn(async move {
            if wait_or_cancel(&stub, delay).await {
                trace!("timer {} fired after {:?}", stub.id(), delay);
                callback().await;
            } else {
                trace!("timer {} cancelled", stub.id());
            }
        });
        handle
    }

    fn schedule_periodic(&self, period: Duration, mut callback: PeriodicCallback) -> TimerHandle {
        let period = period.max(MIN_PERIOD);
        let handle = TimerHandle::new();
        let stub = handle.clone();
        self.spawn(async move {
            while wait_or_cancel(&stub, period).await {
                trace!("periodic timer {} fired", stub.id());
                callback().await;
            }
            trace!("periodic timer {} cancelled", stub.id());
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_once(counter: &Arc<AtomicUsize>) -> OnceCallback {
        let counter = counter.clone();
        Box::new(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    fn counting_periodic(counter: &Arc<AtomicUsize>) -> PeriodicCallback {
        let counter = counter.clone();
        Box::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires() {
        let timer = TokioTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let _handle = timer.schedule_once(Duration::from_millis(50), counting_once(&fired));

        sleep(Duration::from_millis(49)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_cancelled() {
        let timer = TokioTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = timer.schedule_once(Duration::from_millis(50), counting_once(&fired));

        sleep(Duration::from_millis(10)).await;
        handle.cancel();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic() {
        let timer = TokioTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = timer.schedule_periodic(Duration::from_millis(20), counting_periodic(&fired));

        sleep(Duration::from_millis(65)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        handle.cancel();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
