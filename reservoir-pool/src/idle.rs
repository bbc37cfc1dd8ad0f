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

//! Idle connections and their keep-alive timers

use reservoir_timer::TimerHandle;
use std::collections::HashMap;

use crate::connection::{Connection, ConnectionId};

/// Where an idle connection is in its keep-alive life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdlePhase {
    /// Released recently, the one-shot keep-alive timer is armed
    Armed,
    /// Kept at the floor, the periodic health-check timer is armed
    HealthCheck,
    /// A ping is in flight, the connection is out of the entry
    Pinging,
}

pub(crate) struct IdleEntry<C> {
    // None only while Pinging
    pub conn: Option<C>,
    // either the keep-alive timer or the health-check timer, never both
    pub timer: Option<TimerHandle>,
    // which arming of `timer` is current, callbacks of earlier ones are stale
    pub arm: u64,
    pub phase: IdlePhase,
}

impl<C> IdleEntry<C> {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// The idle connections of a pool, addressed by connection id
pub(crate) struct IdleSet<C: Connection> {
    entries: HashMap<ConnectionId, IdleEntry<C>>,
    next_arm: u64,
}

impl<C: Connection> IdleSet<C> {
    pub fn new() -> Self {
        IdleSet {
            entries: HashMap::new(),
            next_arm: 0,
        }
    }

    /// The number of idle connections, including the ones being pinged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A fresh tag for the next timer armed on an entry. A connection keeps its id across
    /// borrows, the tag tells a timer of the current idle period from a stale one.
    pub fn next_arm(&mut self) -> u64 {
        self.next_arm += 1;
        self.next_arm
    }

    /// Park a connection with its freshly armed keep-alive timer, tagged `arm`
    pub fn insert(&mut self, id: ConnectionId, conn: C, timer: TimerHandle, arm: u64) {
        let old = self.entries.insert(
            id,
            IdleEntry {
                conn: Some(conn),
                timer: Some(timer),
                arm,
                phase: IdlePhase::Armed,
            },
        );
        debug_assert!(old.is_none(), "{id} is already idle");
    }

    /// Take any connection that is not being pinged, disarming its timer.
    pub fn take_any(&mut self) -> Option<(ConnectionId, C)> {
        // any connection will do
        let id = self
            .entries
            .iter()
            .find(|(_, entry)| entry.conn.is_some())
            .map(|(id, _)| *id)?;
        let (conn, _) = self.remove(id)?;
        conn.map(|c| (id, c))
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut IdleEntry<C>> {
        self.entries.get_mut(&id)
    }

    /// The entry of `id` if its current timer is the one tagged `arm`
    pub fn get_armed(&mut self, id: ConnectionId, arm: u64) -> Option<&mut IdleEntry<C>> {
        self.entries.get_mut(&id).filter(|entry| entry.arm == arm)
    }

    /// Detach an entry, disarming its timer. Also returns the phase it was in.
    pub fn remove(&mut self, id: ConnectionId) -> Option<(Option<C>, IdlePhase)> {
        let mut entry = self.entries.remove(&id)?;
        entry.disarm();
        Some((entry.conn, entry.phase))
    }

    /// Detach every entry, disarming all timers. Connections being pinged are not returned.
    pub fn drain(&mut self) -> Vec<C> {
        self.entries
            .drain()
            .filter_map(|(_, mut entry)| {
                entry.disarm();
                entry.conn
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Debug, PartialEq)]
    struct Nop(u32);

    #[async_trait]
    impl Connection for Nop {
        async fn close(&mut self) {}
    }

    #[test]
    fn test_take_disarms() {
        let mut idle = IdleSet::new();
        let timer = TimerHandle::new();
        idle.insert(ConnectionId(1), Nop(1), timer.clone(), 1);
        assert_eq!(idle.len(), 1);

        let (id, conn) = idle.take_any().unwrap();
        assert_eq!(id, ConnectionId(1));
        assert_eq!(conn, Nop(1));
        assert!(timer.is_cancelled());
        assert!(idle.is_empty());
        assert!(idle.take_any().is_none());
    }

    #[test]
    fn test_take_skips_pinging() {
        let mut idle = IdleSet::new();
        idle.insert(ConnectionId(1), Nop(1), TimerHandle::new(), 1);
        idle.insert(ConnectionId(2), Nop(2), TimerHandle::new(), 2);

        let entry = idle.get_mut(ConnectionId(1)).unwrap();
        entry.phase = IdlePhase::Pinging;
        let pinged = entry.conn.take().unwrap();
        assert_eq!(pinged, Nop(1));

        let (id, _) = idle.take_any().unwrap();
        assert_eq!(id, ConnectionId(2));
        // the pinging entry is still counted as idle but cannot be taken
        assert_eq!(idle.len(), 1);
        assert!(idle.take_any().is_none());
    }

    #[test]
    fn test_remove_returns_phase() {
        let mut idle = IdleSet::new();
        let timer = TimerHandle::new();
        idle.insert(ConnectionId(3), Nop(3), timer.clone(), 3);
        idle.get_mut(ConnectionId(3)).unwrap().phase = IdlePhase::HealthCheck;

        let (conn, phase) = idle.remove(ConnectionId(3)).unwrap();
        assert_eq!(conn, Some(Nop(3)));
        assert_eq!(phase, IdlePhase::HealthCheck);
        assert!(timer.is_cancelled());
        assert!(idle.remove(ConnectionId(3)).is_none());
    }

    #[test]
    fn test_drain() {
        let mut idle = IdleSet::new();
        let t1 = TimerHandle::new();
        let t2 = TimerHandle::new();
        idle.insert(ConnectionId(1), Nop(1), t1.clone(), 1);
        idle.insert(ConnectionId(2), Nop(2), t2.clone(), 2);
        idle.get_mut(ConnectionId(2)).unwrap().conn.take();

        let drained = idle.drain();
        assert_eq!(drained, vec![Nop(1)]);
        assert!(t1.is_cancelled() && t2.is_cancelled());
        assert!(idle.is_empty());
    }

    #[test]
    fn test_stale_arm() {
        let mut idle = IdleSet::new();
        let first = idle.next_arm();
        idle.insert(ConnectionId(1), Nop(1), TimerHandle::new(), first);
        assert!(idle.get_armed(ConnectionId(1), first).is_some());

        // borrowed and parked again
        idle.remove(ConnectionId(1));
        let second = idle.next_arm();
        assert_ne!(first, second);
        idle.insert(ConnectionId(1), Nop(1), TimerHandle::new(), second);
        assert!(idle.get_armed(ConnectionId(1), first).is_none());
        assert!(idle.get_armed(ConnectionId(1), second).is_some());
    }
}
