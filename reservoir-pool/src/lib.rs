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

//! A bounded pool of stateful backend connections
//!
//! The pool caps how many connections exist at once, queues acquisitions by priority when the
//! cap is reached, and hands released connections straight to waiters. Connections nobody waits
//! for go idle: above the `min_connections` floor they are evicted after the keep-alive interval,
//! at the floor they are pinged periodically instead.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use reservoir_pool::{Connection, ConnectionFactory, ConnectionPool, PoolConfig, Result};
//!
//! struct Session;
//!
//! #[async_trait]
//! impl Connection for Session {
//!     async fn close(&mut self) {}
//! }
//!
//! struct Connector;
//!
//! #[async_trait]
//! impl ConnectionFactory for Connector {
//!     type Connection = Session;
//!     async fn create(&self) -> Result<Session> {
//!         Ok(Session)
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let pool = ConnectionPool::new(PoolConfig::new(1, 4), Connector)?;
//! let conn = pool.acquire().await?;
//! // use the connection
//! pool.release(conn);
//! pool.quit().await
//! # }
//! ```

#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

mod config;
mod connection;
mod idle;
mod pool;
mod wait_queue;

pub use config::PoolConfig;
pub use connection::{Connection, ConnectionFactory, ConnectionId, PooledConnection};
pub use pool::{Acquire, ConnectionPool, PoolStats};
pub use wait_queue::WaitKey;

pub use reservoir_error::{BError, Error, ErrorSource, ErrorType, Result};
pub use reservoir_timer::{ManualTimer, TimerHandle, TimerService, TokioTimer};

#[cfg(test)]
mod tests_util {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    pub fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Default)]
    struct Calls {
        created: AtomicUsize,
        pings: AtomicUsize,
        quits: AtomicUsize,
        closed: AtomicUsize,
        fail_create: AtomicBool,
        fail_pings: AtomicBool,
    }

    /// A factory whose connections only count what is done to them
    #[derive(Default)]
    pub struct FakeFactory {
        calls: Arc<Calls>,
    }

    impl FakeFactory {
        pub fn created(&self) -> usize {
            self.calls.created.load(Ordering::SeqCst)
        }
        pub fn pings(&self) -> usize {
            self.calls.pings.load(Ordering::SeqCst)
        }
        pub fn quits(&self) -> usize {
            self.calls.quits.load(Ordering::SeqCst)
        }
        pub fn closed(&self) -> usize {
            self.calls.closed.load(Ordering::SeqCst)
        }
        pub fn fail_next_create(&self) {
            self.calls.fail_create.store(true, Ordering::SeqCst);
        }
        pub fn fail_pings(&self) {
            self.calls.fail_pings.store(true, Ordering::SeqCst);
        }
    }

    pub struct FakeConnection {
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn ping(&mut self) -> Result<()> {
            self.calls.pings.fetch_add(1, Ordering::SeqCst);
            if self.calls.fail_pings.load(Ordering::SeqCst) {
                return Error::e_explain(ErrorType::PingFailure, "fake backend stopped answering");
            }
            Ok(())
        }

        async fn quit(&mut self) -> Result<()> {
            self.calls.quits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            self.calls.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConnection;

        async fn create(&self) -> Result<FakeConnection> {
            if self.calls.fail_create.swap(false, Ordering::SeqCst) {
                return Err(Error::explain(ErrorType::ConnectRefused, "fake backend refused").into_backend());
            }
            self.calls.created.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                calls: self.calls.clone(),
            })
        }
    }
}
