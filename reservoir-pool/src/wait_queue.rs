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

//! The queue of acquisitions waiting for a connection
//!
//! Entries are served highest priority first, and in arrival order within a priority.

use reservoir_error::{BError, Result};
use reservoir_timer::TimerHandle;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::connection::{Connection, PooledConnection};

/// Where a wait entry sits in the queue. It also serves as the entry's unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitKey {
    // ordering matters: priority first (higher first), then arrival
    priority: Reverse<i32>,
    seq: u64,
}

impl WaitKey {
    pub fn priority(&self) -> i32 {
        self.priority.0
    }

    pub fn id(&self) -> u64 {
        self.seq
    }
}

pub(crate) type WaitResult<C> = Result<PooledConnection<C>>;

pub(crate) struct WaitEntry<C: Connection> {
    pub enqueued_at: Instant,
    // fulfilled exactly once, by whoever removes the entry from the queue
    slot: oneshot::Sender<WaitResult<C>>,
    timeout: Option<TimerHandle>,
}

impl<C: Connection> WaitEntry<C> {
    /// Fulfill the slot with a connection. The connection comes back if the receiver is gone.
    pub fn fulfill(
        mut self,
        conn: PooledConnection<C>,
    ) -> std::result::Result<(), PooledConnection<C>> {
        self.disarm();
        match self.slot.send(Ok(conn)) {
            Ok(()) => Ok(()),
            Err(returned) => match returned {
                Ok(conn) => Err(conn),
                // we just sent Ok
                Err(_) => Ok(()),
            },
        }
    }

    /// Fail the slot. Nothing happens if the receiver is gone.
    pub fn fail(mut self, e: BError) {
        self.disarm();
        let _ = self.slot.send(Err(e));
    }

    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timeout.take() {
            timer.cancel();
        }
    }
}

/// The pending acquisitions of a pool
pub(crate) struct WaitQueue<C: Connection> {
    entries: BTreeMap<WaitKey, WaitEntry<C>>,
    next_seq: u64,
}

impl<C: Connection> WaitQueue<C> {
    pub fn new() -> Self {
        WaitQueue {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a new entry and return its key together with the receiving end of its slot.
    pub fn push(&mut self, priority: i32) -> (WaitKey, oneshot::Receiver<WaitResult<C>>) {
        self.next_seq += 1;
        let key = WaitKey {
            priority: Reverse(priority),
            seq: self.next_seq,
        };
        let (slot, rx) = oneshot::channel();
        self.entries.insert(
            key,
            WaitEntry {
                enqueued_at: Instant::now(),
                slot,
                timeout: None,
            },
        );
        (key, rx)
    }

    /// Attach the timeout timer of an entry. The timer is cancelled if the entry is already gone.
    pub fn set_timeout(&mut self, key: &WaitKey, timer: TimerHandle) {
        match self.entries.get_mut(key) {
            Some(entry) => entry.timeout = Some(timer),
            None => timer.cancel(),
        }
    }

    /// Take the entry to serve next
    pub fn pop_head(&mut self) -> Option<(WaitKey, WaitEntry<C>)> {
        self.entries.pop_first()
    }

    pub fn remove(&mut self, key: &WaitKey) -> Option<WaitEntry<C>> {
        self.entries.remove(key)
    }

    /// Remove every entry, in serving order
    pub fn drain(&mut self) -> impl Iterator<Item = WaitEntry<C>> {
        std::mem::take(&mut self.entries).into_values()
    }
}
