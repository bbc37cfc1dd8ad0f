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

//! The connection pool
//!
//! All the bookkeeping of a pool lives in one [PoolState] behind a mutex. The mutex is only held
//! by synchronous steps, never across an `.await`, so every transition below is atomic with
//! respect to the others. Work that has to wait on a connection (`create`, `ping`, `quit`,
//! `close`) happens after the counters already reflect its outcome.

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use reservoir_error::{BError, Error, ErrorType, ErrorType::*, OrErr, Result};
use reservoir_timer::{TimerHandle, TimerService, TokioTimer};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::connection::{
    dispose, spawn_detached, Connection, ConnectionFactory, ConnectionId, PooledConnection, Reclaim,
};
use crate::idle::{IdlePhase, IdleSet};
use crate::wait_queue::{WaitKey, WaitQueue, WaitResult};

type Conn<F> = <F as ConnectionFactory>::Connection;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Cumulative counters of a pool, see [ConnectionPool::stats()]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections successfully opened by the factory
    pub created: u64,
    /// Failed calls to the factory
    pub create_failed: u64,
    /// Idle connections evicted by the keep-alive timer
    pub evicted: u64,
    /// Idle connections dropped because their ping failed
    pub health_check_failed: u64,
    /// Releases that went straight to a waiter
    pub handoffs: u64,
    /// Queued acquisitions that hit the wait timeout
    pub wait_timeouts: u64,
    /// Queued acquisitions cancelled by their caller
    pub cancelled: u64,
    /// Borrowed connections dropped without being released
    pub discarded: u64,
}

struct PoolState<C: Connection> {
    // created and not yet disposed, including the ones being created
    current: usize,
    idle: IdleSet<C>,
    waiting: WaitQueue<C>,
    closed: bool,
    quitting: bool,
    quit_waiter: Option<oneshot::Sender<()>>,
    stats: PoolStats,
}

impl<C: Connection> PoolState<C> {
    fn new() -> Self {
        PoolState {
            current: 0,
            idle: IdleSet::new(),
            waiting: WaitQueue::new(),
            closed: false,
            quitting: false,
            quit_waiter: None,
            stats: PoolStats::default(),
        }
    }

    fn borrowed(&self) -> usize {
        self.current - self.idle.len()
    }

    // quitting and nothing is on loan anymore
    fn drained(&self) -> bool {
        self.quitting && self.borrowed() == 0
    }
}

// What is left to do once the state lock is released
struct FollowUp<C> {
    dispose: Vec<C>,
    replenish: bool,
}

impl<C> FollowUp<C> {
    fn none() -> Self {
        FollowUp {
            dispose: vec![],
            replenish: false,
        }
    }

    fn dispose(conns: Vec<C>) -> Self {
        FollowUp {
            dispose: conns,
            replenish: false,
        }
    }
}

fn pool_error<S: Into<reservoir_error::ErrorContext>>(etype: ErrorType, context: S) -> BError {
    Error::explain(etype, context).into_pool()
}

struct Inner<F: ConnectionFactory> {
    id: u64,
    me: Weak<Inner<F>>,
    factory: F,
    timer: Arc<dyn TimerService>,
    config: PoolConfig,
    next_conn_id: AtomicU64,
    state: Mutex<PoolState<Conn<F>>>,
}

// Gives back the capacity of a creation that never completed, e.g. when the acquiring future is
// dropped while the factory is still connecting.
struct CreationSlot<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for CreationSlot<F> {
    fn drop(&mut self) {
        if self.armed {
            debug!("connection creation abandoned");
            self.inner.free_slot(|_| {});
        }
    }
}

impl<F: ConnectionFactory> Inner<F> {
    fn handle(&self) -> Weak<dyn Reclaim<Conn<F>>> {
        self.me.clone()
    }

    fn lend(&self, id: ConnectionId, conn: Conn<F>) -> PooledConnection<Conn<F>> {
        PooledConnection::new(id, conn, self.handle())
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    fn follow_up(&self, follow: FollowUp<Conn<F>>) {
        for conn in follow.dispose {
            dispose(conn);
        }
        if follow.replenish {
            self.spawn_replenish();
        }
    }

    /// Account for a counted connection that is gone for good.
    ///
    /// Finishes a pending quit if this was the last one on loan. With `replenish`, the freed
    /// capacity is reserved for a new connection if acquisitions are waiting, otherwise they
    /// could wait on a release that never comes.
    fn on_slot_freed(&self, state: &mut PoolState<Conn<F>>, replenish: bool) -> FollowUp<Conn<F>> {
        debug_assert!(state.current > 0);
        state.current -= 1;
        if state.drained() {
            return FollowUp::dispose(self.close_locked(state));
        }
        if replenish
            && !state.closed
            && !state.quitting
            && !state.waiting.is_empty()
            && state.current < self.config.max_connections
        {
            state.current += 1;
            return FollowUp {
                dispose: vec![],
                replenish: true,
            };
        }
        FollowUp::none()
    }

    fn free_slot(&self, count: impl FnOnce(&mut PoolStats)) {
        let follow = {
            let mut state = self.state.lock();
            count(&mut state.stats);
            self.on_slot_freed(&mut state, true)
        };
        self.follow_up(follow);
    }

    /// Take back a connection that is not on loan anymore: hand it to the next waiter, or park
    /// it as idle.
    fn check_in(
        &self,
        state: &mut PoolState<Conn<F>>,
        id: ConnectionId,
        conn: Conn<F>,
    ) -> FollowUp<Conn<F>> {
        if state.closed {
            debug!("{id} returned to a closed pool, closing it");
            state.current -= 1;
            return FollowUp::dispose(vec![conn]);
        }

        let mut pooled = self.lend(id, conn);
        while let Some((key, entry)) = state.waiting.pop_head() {
            let waited = entry.waited();
            match entry.fulfill(pooled) {
                Ok(()) => {
                    state.stats.handoffs += 1;
                    debug!(
                        "{id} handed to waiter {} (priority {}) after {waited:?}",
                        key.id(),
                        key.priority()
                    );
                    return FollowUp::none();
                }
                // the waiter went away without cleaning up, try the next one
                Err(returned) => pooled = returned,
            }
        }

        let (id, conn) = pooled.into_parts();
        let arm = state.idle.next_arm();
        let timer = self.arm_keepalive(id, arm);
        state.idle.insert(id, conn, timer, arm);
        trace!("{id} is idle, {} idle in total", state.idle.len());

        if state.drained() {
            return FollowUp::dispose(self.close_locked(state));
        }
        FollowUp::none()
    }

    fn close_locked(&self, state: &mut PoolState<Conn<F>>) -> Vec<Conn<F>> {
        if state.closed {
            return vec![];
        }
        state.closed = true;
        state.quitting = false;

        // connections being pinged are counted as idle, their health check disposes them
        state.current -= state.idle.len();
        let idle = state.idle.drain();
        let mut failed = 0;
        for entry in state.waiting.drain() {
            entry.fail(pool_error(PoolClosed, "pool closed while waiting"));
            failed += 1;
        }
        if let Some(quit_waiter) = state.quit_waiter.take() {
            let _ = quit_waiter.send(());
        }
        info!(
            "pool {} closed: {} idle disposed, {failed} waiters failed, {} still borrowed",
            self.id,
            idle.len(),
            state.current
        );
        idle
    }

    fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            self.close_locked(&mut state)
        };
        for conn in idle {
            dispose(conn);
        }
    }

    fn begin_quit(&self) -> Result<Option<oneshot::Receiver<()>>> {
        let (idle, waiter) = {
            let mut state = self.state.lock();
            if state.closed || state.quitting {
                return Err(pool_error(PoolClosed, "pool already closed or quitting"));
            }
            state.quitting = true;
            if state.drained() {
                (self.close_locked(&mut state), None)
            } else {
                info!(
                    "pool {} quitting, waiting for {} borrowed connections",
                    self.id,
                    state.borrowed()
                );
                let (tx, rx) = oneshot::channel();
                state.quit_waiter = Some(tx);
                (vec![], Some(rx))
            }
        };
        for conn in idle {
            dispose(conn);
        }
        Ok(waiter)
    }

    fn create_connection(self: Arc<Self>) -> BoxFuture<'static, WaitResult<Conn<F>>> {
        // the slot is owned by the future so that dropping it before the first poll rolls back too
        let mut slot = CreationSlot {
            inner: self,
            armed: true,
        };
        async move {
            let created = slot.inner.factory.create().await;
            slot.armed = false;
            match created {
                Ok(conn) => slot.inner.on_created(conn),
                Err(e) => {
                    debug!("failed to create connection: {e}");
                    slot.inner.free_slot(|stats| stats.create_failed += 1);
                    Err(e)
                }
            }
        }
        .boxed()
    }

    fn on_created(&self, conn: Conn<F>) -> WaitResult<Conn<F>> {
        let id = self.next_id();
        {
            let mut state = self.state.lock();
            if state.closed {
                state.current -= 1;
            } else {
                state.stats.created += 1;
                debug!("{id} created, {} connections in total", state.current);
                return Ok(self.lend(id, conn));
            }
        }
        debug!("{id} created after the pool closed, closing it");
        dispose(conn);
        Err(pool_error(PoolClosed, "pool closed while connecting"))
    }

    // A new connection on behalf of the waiters, its slot is already counted
    fn spawn_replenish(&self) {
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        let spawned = spawn_detached(async move {
            match inner.factory.create().await {
                Ok(conn) => {
                    let id = inner.next_id();
                    let follow = {
                        let mut state = inner.state.lock();
                        if !state.closed {
                            state.stats.created += 1;
                        }
                        inner.check_in(&mut state, id, conn)
                    };
                    inner.follow_up(follow);
                }
                Err(e) => {
                    let follow = {
                        let mut state = inner.state.lock();
                        state.stats.create_failed += 1;
                        // the waiter this connection was meant for learns why it is not coming
                        if let Some((key, entry)) = state.waiting.pop_head() {
                            debug!("failing waiter {}: {e}", key.id());
                            entry.fail(e);
                        }
                        inner.on_slot_freed(&mut state, true)
                    };
                    inner.follow_up(follow);
                }
            }
        });
        if !spawned {
            warn!("no runtime to create a connection for the waiters on");
            let follow = {
                let mut state = self.state.lock();
                self.on_slot_freed(&mut state, false)
            };
            self.follow_up(follow);
        }
    }

    fn arm_keepalive(&self, id: ConnectionId, arm: u64) -> TimerHandle {
        let pool = self.me.clone();
        self.timer.schedule_once(
            self.config.keepalive_interval(),
            Box::new(move || {
                async move {
                    if let Some(inner) = pool.upgrade() {
                        inner.on_keepalive_expired(id, arm).await;
                    }
                }
                .boxed()
            }),
        )
    }

    fn arm_health_check(&self, id: ConnectionId, arm: u64) -> TimerHandle {
        let pool = self.me.clone();
        self.timer.schedule_periodic(
            self.config.keepalive_interval(),
            Box::new(move || {
                let pool = pool.clone();
                async move {
                    if let Some(inner) = pool.upgrade() {
                        inner.on_health_check(id, arm).await;
                    }
                }
                .boxed()
            }),
        )
    }

    fn arm_wait_timeout(&self, key: WaitKey, timeout: std::time::Duration) -> TimerHandle {
        let pool = self.me.clone();
        self.timer.schedule_once(
            timeout,
            Box::new(move || {
                async move {
                    if let Some(inner) = pool.upgrade() {
                        inner.abandon(key, WaitTimeout);
                    }
                }
                .boxed()
            }),
        )
    }

    async fn on_keepalive_expired(&self, id: ConnectionId, arm: u64) {
        let mut ping_now = None;
        let evicted = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            // a timer that lost the race against a re-borrow must not touch the new idle period
            let current = state
                .idle
                .get_armed(id, arm)
                .map_or(false, |entry| entry.phase == IdlePhase::Armed);
            if !current {
                return;
            }
            let idle_count = state.idle.len();
            if idle_count <= self.config.min_connections {
                trace!("{id} kept at the floor, health checking it");
                let check = state.idle.next_arm();
                let timer = self.arm_health_check(id, check);
                if let Some(entry) = state.idle.get_mut(id) {
                    entry.timer = Some(timer);
                    entry.arm = check;
                    entry.phase = IdlePhase::HealthCheck;
                }
                ping_now = Some(check);
                None
            } else {
                // shrink towards the floor
                let Some((Some(conn), _)) = state.idle.remove(id) else {
                    return;
                };
                state.stats.evicted += 1;
                debug!(
                    "evicting idle {id}: {idle_count} idle above floor {}",
                    self.config.min_connections
                );
                Some((conn, self.on_slot_freed(state, false)))
            }
        };

        if let Some((mut conn, follow)) = evicted {
            self.follow_up(follow);
            if let Err(e) = conn.quit().await {
                debug!("{id} failed to quit gracefully, closing it: {e}");
                conn.close().await;
            }
        } else if let Some(check) = ping_now {
            // the first health check runs right away, the periodic timer takes over from there
            self.on_health_check(id, check).await;
        }
    }

    async fn on_health_check(&self, id: ConnectionId, arm: u64) {
        let mut conn = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let Some(entry) = state.idle.get_armed(id, arm) else {
                return;
            };
            if entry.phase != IdlePhase::HealthCheck {
                return;
            }
            let Some(conn) = entry.conn.take() else {
                return;
            };
            entry.phase = IdlePhase::Pinging;
            conn
        };

        let pinged = conn.ping().await;

        let follow = {
            let mut state = self.state.lock();
            match pinged {
                Ok(()) => self.on_ping_ok(&mut state, id, conn),
                Err(e) => {
                    if state.idle.remove(id).is_some() {
                        state.stats.health_check_failed += 1;
                        warn!("health check of idle {id} failed, dropping it: {e}");
                        let mut follow = self.on_slot_freed(&mut state, true);
                        follow.dispose.push(conn);
                        follow
                    } else {
                        // the pool closed during the ping and already stopped counting it
                        FollowUp::dispose(vec![conn])
                    }
                }
            }
        };
        self.follow_up(follow);
    }

    fn on_ping_ok(
        &self,
        state: &mut PoolState<Conn<F>>,
        id: ConnectionId,
        conn: Conn<F>,
    ) -> FollowUp<Conn<F>> {
        let Some(entry) = state.idle.get_mut(id) else {
            return FollowUp::dispose(vec![conn]);
        };
        if state.waiting.is_empty() {
            trace!("{id} passed health check");
            entry.conn = Some(conn);
            entry.phase = IdlePhase::HealthCheck;
            return FollowUp::none();
        }
        // acquisitions queued up while it was out for the ping
        state.idle.remove(id);
        self.check_in(state, id, conn)
    }
}

impl<F: ConnectionFactory> Reclaim<Conn<F>> for Inner<F> {
    fn pool_id(&self) -> u64 {
        self.id
    }

    fn reclaim(&self, id: ConnectionId, conn: Conn<F>) {
        let follow = {
            let mut state = self.state.lock();
            state.stats.discarded += 1;
            debug!("{id} dropped while borrowed, freeing its slot");
            let mut follow = self.on_slot_freed(&mut state, true);
            follow.dispose.push(conn);
            follow
        };
        self.follow_up(follow);
    }

    fn give_back(&self, id: ConnectionId, conn: Conn<F>) {
        let follow = {
            let mut state = self.state.lock();
            self.check_in(&mut state, id, conn)
        };
        self.follow_up(follow);
    }

    fn abandon(&self, key: WaitKey, reason: ErrorType) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.waiting.remove(&key) else {
            // already served or failed
            return false;
        };
        let waited = entry.waited();
        let e = if reason == WaitTimeout {
            state.stats.wait_timeouts += 1;
            pool_error(reason, format!("no connection after waiting {waited:?}"))
        } else {
            state.stats.cancelled += 1;
            Error::explain(reason, "acquisition abandoned by the caller").into_caller()
        };
        debug!("waiter {} gave up after {waited:?}: {e}", key.id());
        entry.fail(e);
        true
    }
}

impl<F: ConnectionFactory> Drop for Inner<F> {
    fn drop(&mut self) {
        // stop the timers so that periodic health checks do not outlive the pool
        let state = self.state.get_mut();
        for conn in state.idle.drain() {
            dispose(conn);
        }
        for entry in state.waiting.drain() {
            entry.fail(pool_error(PoolClosed, "pool dropped"));
        }
    }
}

/// A pool of reusable connections to a single backend
///
/// Connections are created on demand up to `max_connections`. When none is available,
/// acquisitions queue up, highest priority first, and are served directly by
/// [ConnectionPool::release()]. Released connections that nobody waits for stay idle for the
/// keep-alive interval, after which they are evicted while the pool is above `min_connections`,
/// or periodically pinged otherwise.
///
/// The pool is cheap to clone, all clones share the same connections.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a new [ConnectionPool] whose timers run on the tokio runtime.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self> {
        Self::with_timer(config, factory, Arc::new(TokioTimer::new()))
    }

    /// Create a new [ConnectionPool] that schedules its timers on `timer`.
    pub fn with_timer(config: PoolConfig, factory: F, timer: Arc<dyn TimerService>) -> Result<Self> {
        let config = config.validate()?;
        let inner = Arc::new_cyclic(|me| Inner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            factory,
            timer,
            config,
            next_conn_id: AtomicU64::new(1),
            state: Mutex::new(PoolState::new()),
        });
        debug!("pool {} created with {:?}", inner.id, inner.config);
        Ok(ConnectionPool { inner })
    }

    /// Acquire a connection with the default priority `0`.
    pub fn acquire(&self) -> Acquire<Conn<F>> {
        self.acquire_with_priority(0)
    }

    /// Acquire a connection.
    ///
    /// The decision is made right away: an idle connection is reused, otherwise a new one is
    /// created if there is capacity, otherwise the acquisition is queued behind every waiter of
    /// higher or equal `priority`. The returned [Acquire] resolves once a connection is ready.
    pub fn acquire_with_priority(&self, priority: i32) -> Acquire<Conn<F>> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.closed {
            return Acquire::ready(Err(pool_error(PoolClosed, "pool is closed")));
        }
        if state.quitting {
            return Acquire::ready(Err(pool_error(PoolClosed, "pool is quitting")));
        }

        if let Some((id, conn)) = state.idle.take_any() {
            trace!("reusing idle {id}");
            return Acquire::ready(Ok(inner.lend(id, conn)));
        }

        if state.current < inner.config.max_connections {
            state.current += 1;
            drop(state);
            return Acquire::creating(inner.clone().create_connection());
        }

        if let Some(limit) = inner.config.wait_queue_limit() {
            if state.waiting.len() >= limit {
                return Acquire::ready(Err(pool_error(
                    QueueOverflow,
                    format!("{limit} acquisitions already waiting"),
                )));
            }
        }

        let (key, rx) = state.waiting.push(priority);
        if let Some(timeout) = inner.config.wait_timeout() {
            let timer = inner.arm_wait_timeout(key, timeout);
            state.waiting.set_timeout(&key, timer);
        }
        trace!(
            "waiter {} queued with priority {priority}, {} waiting",
            key.id(),
            state.waiting.len()
        );
        Acquire::waiting(key, rx, inner.handle())
    }

    /// Give a borrowed connection back.
    ///
    /// The connection goes to the next waiter if there is one, without ever becoming idle.
    pub fn release(&self, conn: PooledConnection<Conn<F>>) {
        if !conn.belongs_to(self.inner.id) {
            warn!("{} does not belong to pool {}, dropping it", conn.id(), self.inner.id);
            return;
        }
        let (id, conn) = conn.into_parts();
        self.inner.give_back(id, conn);
    }

    /// Gracefully shut the pool down.
    ///
    /// New acquisitions fail right away. The returned future resolves once every borrowed
    /// connection is back, at which point the pool is closed. Fails with `PoolClosed` if the
    /// pool is already closed or quitting.
    pub fn quit(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let begun = self.inner.begin_quit();
        async move {
            match begun? {
                None => Ok(()),
                Some(drained) => drained
                    .await
                    .or_err(PoolClosed, "pool dropped before it drained"),
            }
        }
    }

    /// Close the pool now.
    ///
    /// Idle connections are closed and waiters fail with `PoolClosed`. Borrowed connections are
    /// closed when they are released. Calling it again does nothing.
    pub fn close(&self) {
        self.inner.close()
    }

    /// Open connections until the pool holds `min_connections`. Returns how many were opened.
    ///
    /// Stops at the first creation failure and returns it.
    pub async fn prewarm(&self) -> Result<usize> {
        let mut created = 0;
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed || state.quitting {
                    return Err(pool_error(PoolClosed, "cannot prewarm a closed pool"));
                }
                if state.current >= self.inner.config.min_connections {
                    break;
                }
                state.current += 1;
            }
            let conn = self
                .inner
                .clone()
                .create_connection()
                .await
                .map_err(|e| {
                    warn!("prewarm stopped after {created} connections: {e}");
                    e
                })?;
            self.release(conn);
            created += 1;
        }
        info!("pool {} prewarmed {created} connections", self.inner.id);
        Ok(created)
    }

    /// Connections created and not yet disposed, on loan or idle
    pub fn current_connections(&self) -> usize {
        self.inner.state.lock().current
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn borrowed_count(&self) -> usize {
        self.inner.state.lock().borrowed()
    }

    pub fn wait_queue_len(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().stats
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_quitting(&self) -> bool {
        self.inner.state.lock().quitting
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

enum AcquireState<C: Connection> {
    Ready(Option<WaitResult<C>>),
    Creating(BoxFuture<'static, WaitResult<C>>),
    Waiting {
        key: WaitKey,
        rx: oneshot::Receiver<WaitResult<C>>,
        pool: Weak<dyn Reclaim<C>>,
    },
    Done,
}

/// A pending acquisition, returned by [ConnectionPool::acquire()]
///
/// Dropping a queued [Acquire] takes it out of the wait queue. If a connection was already
/// handed to it, the connection goes back to the pool.
pub struct Acquire<C: Connection> {
    state: AcquireState<C>,
}

// the connection is never pinned, it is only moved around by value
impl<C: Connection> Unpin for Acquire<C> {}

impl<C: Connection> Acquire<C> {
    fn ready(result: WaitResult<C>) -> Self {
        Acquire {
            state: AcquireState::Ready(Some(result)),
        }
    }

    fn creating(fut: BoxFuture<'static, WaitResult<C>>) -> Self {
        Acquire {
            state: AcquireState::Creating(fut),
        }
    }

    fn waiting(key: WaitKey, rx: oneshot::Receiver<WaitResult<C>>, pool: Weak<dyn Reclaim<C>>) -> Self {
        Acquire {
            state: AcquireState::Waiting { key, rx, pool },
        }
    }

    /// Whether this acquisition went through the wait queue
    pub fn is_queued(&self) -> bool {
        matches!(self.state, AcquireState::Waiting { .. })
    }

    /// The position of this acquisition in the wait queue, if it was queued
    pub fn wait_key(&self) -> Option<WaitKey> {
        match &self.state {
            AcquireState::Waiting { key, .. } => Some(*key),
            _ => None,
        }
    }

    /// Give up a queued acquisition.
    ///
    /// Awaiting it afterwards yields `Cancelled`, unless a connection was handed over first, in
    /// which case the connection is returned. Has no effect on acquisitions that were not queued.
    pub fn cancel(&mut self) {
        if let AcquireState::Waiting { key, pool, .. } = &self.state {
            if let Some(pool) = pool.upgrade() {
                pool.abandon(*key, Cancelled);
            }
        }
    }
}

impl<C: Connection> Future for Acquire<C> {
    type Output = Result<PooledConnection<C>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            AcquireState::Ready(result) => result
                .take()
                .unwrap_or_else(|| Error::e_explain(InternalError, "acquire polled after completion")),
            AcquireState::Creating(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(result) => result,
                Poll::Pending => return Poll::Pending,
            },
            AcquireState::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(e)) => Error::e_because(PoolClosed, "pool dropped while waiting", e),
                Poll::Pending => return Poll::Pending,
            },
            AcquireState::Done => Error::e_explain(InternalError, "acquire polled after completion"),
        };
        this.state = AcquireState::Done;
        Poll::Ready(result)
    }
}

impl<C: Connection> Drop for Acquire<C> {
    fn drop(&mut self) {
        let AcquireState::Waiting { key, rx, pool } = &mut self.state else {
            return;
        };
        let Some(pool) = pool.upgrade() else {
            return;
        };
        pool.abandon(*key, Cancelled);
        // a connection may have been handed over after the last poll
        rx.close();
        if let Ok(Ok(conn)) = rx.try_recv() {
            let (id, conn) = conn.into_parts();
            debug!("{id} was handed to a dropped waiter, taking it back");
            pool.give_back(id, conn);
        }
    }
}
