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

//! The connection capabilities the pool consumes, and the handle it lends out

use async_trait::async_trait;
use log::debug;
use reservoir_error::{ErrorType, Result};
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;

use crate::wait_queue::WaitKey;

/// A stateful connection to the backend
///
/// The pool never looks inside a connection. It only probes, gracefully terminates or forcefully
/// closes it.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Liveness probe used by the health check of idle connections.
    ///
    /// `Ok(())` if the connection is usable.
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    /// Best-effort graceful termination, used when an idle connection is evicted.
    async fn quit(&mut self) -> Result<()> {
        self.close().await;
        Ok(())
    }

    /// Forceful termination. This cannot fail as far as the pool is concerned.
    async fn close(&mut self);
}

/// The capability to open new connections to the backend
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new connection. The pool does not retry on failure.
    async fn create(&self) -> Result<Self::Connection>;
}

/// The pool-assigned identity of a connection, unique within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

// What a borrowed connection or a pending acquisition needs from the pool that issued it,
// without knowing the factory type.
pub(crate) trait Reclaim<C>: Send + Sync {
    fn pool_id(&self) -> u64;
    /// A borrowed connection was dropped without being released
    fn reclaim(&self, id: ConnectionId, conn: C);
    /// A connection was handed to a waiter that went away before receiving it
    fn give_back(&self, id: ConnectionId, conn: C);
    /// Remove a pending wait entry and fail it with `reason`. False if it was already consumed.
    fn abandon(&self, key: WaitKey, reason: ErrorType) -> bool;
}

/// A connection on loan from a [crate::ConnectionPool]
///
/// Give it back with [crate::ConnectionPool::release()]. Dropping it instead tells the pool
/// the connection is gone: the pool frees its slot and closes the connection.
pub struct PooledConnection<C: Connection> {
    id: ConnectionId,
    // only None between into_parts() and drop
    conn: Option<C>,
    pool: Weak<dyn Reclaim<C>>,
}

impl<C: Connection> PooledConnection<C> {
    pub(crate) fn new(id: ConnectionId, conn: C, pool: Weak<dyn Reclaim<C>>) -> Self {
        PooledConnection {
            id,
            conn: Some(conn),
            pool,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn belongs_to(&self, pool_id: u64) -> bool {
        self.pool
            .upgrade()
            .map_or(false, |pool| pool.pool_id() == pool_id)
    }

    pub(crate) fn into_parts(mut self) -> (ConnectionId, C) {
        // the connection is always present until here
        let conn = self.conn.take().expect("connection already taken");
        (self.id, conn)
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection already taken")
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection already taken")
    }
}

impl<C: Connection> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish()
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.reclaim(self.id, conn),
            None => {
                debug!("{} dropped after its pool, closing it", self.id);
                dispose(conn);
            }
        }
    }
}

/// Run `fut` on the current tokio runtime if there is one. False if it could not be spawned.
pub(crate) fn spawn_detached<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            drop(rt.spawn(fut));
            true
        }
        Err(_) => false,
    }
}

/// Close a connection the pool no longer tracks, without waiting for it.
pub(crate) fn dispose<C: Connection>(mut conn: C) {
    if !spawn_detached(async move { conn.close().await }) {
        debug!("no runtime to close the connection on, dropping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Probe {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for Probe {
        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Recorder {
        reclaimed: Mutex<Vec<ConnectionId>>,
    }

    impl Reclaim<Probe> for Recorder {
        fn pool_id(&self) -> u64 {
            7
        }
        fn reclaim(&self, id: ConnectionId, _conn: Probe) {
            self.reclaimed.lock().push(id);
        }
        fn give_back(&self, _id: ConnectionId, _conn: Probe) {}
        fn abandon(&self, _key: WaitKey, _reason: ErrorType) -> bool {
            false
        }
    }

    fn probe() -> (Probe, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Probe {
                closed: closed.clone(),
            },
            closed,
        )
    }

    #[tokio::test]
    async fn test_default_quit_closes() {
        let (mut conn, closed) = probe();
        conn.ping().await.unwrap();
        assert!(!closed.load(Ordering::SeqCst));
        conn.quit().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_reclaims() {
        let pool = Arc::new(Recorder::default());
        let weak: Weak<dyn Reclaim<Probe>> = Arc::downgrade(&pool) as Weak<Recorder>;
        let (conn, _) = probe();
        let pooled = PooledConnection::new(ConnectionId(3), conn, weak);
        assert!(pooled.belongs_to(7));
        assert!(!pooled.belongs_to(8));
        drop(pooled);
        assert_eq!(*pool.reclaimed.lock(), vec![ConnectionId(3)]);
    }

    #[test]
    fn test_into_parts_skips_reclaim() {
        let pool = Arc::new(Recorder::default());
        let weak: Weak<dyn Reclaim<Probe>> = Arc::downgrade(&pool) as Weak<Recorder>;
        let (conn, _) = probe();
        let pooled = PooledConnection::new(ConnectionId(4), conn, weak);
        let (id, _conn) = pooled.into_parts();
        assert_eq!(id, ConnectionId(4));
        assert!(pool.reclaimed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_drop_after_pool_closes() {
        let pool = Arc::new(Recorder::default());
        let weak: Weak<dyn Reclaim<Probe>> = Arc::downgrade(&pool) as Weak<Recorder>;
        drop(pool);
        let (conn, closed) = probe();
        drop(PooledConnection::new(ConnectionId(5), conn, weak));
        tokio::task::yield_now().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_display_id() {
        assert_eq!(ConnectionId(12).to_string(), "conn#12");
    }
}
