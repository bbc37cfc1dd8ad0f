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

//! Pool configurations
//!
//! The configuration is fixed once a pool is built. It can be written in code or loaded from a
//! YAML document:
//! ```yaml
//! ---
//! min_connections: 2
//! max_connections: 10
//! keepalive_interval_ms: 30000
//! max_wait_queue_length: 100
//! wait_timeout_ms: 0
//! ```

use log::{debug, trace};
use reservoir_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// The settings of a [crate::ConnectionPool]
///
/// Unknown keys in a configuration file are ignored, missing keys take their default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections are not evicted by the keep-alive timer while the idle count is at or
    /// below this floor. They are health-checked instead.
    pub min_connections: usize,
    /// Hard cap on simultaneously created connections. Must be at least 1.
    pub max_connections: usize,
    /// How long a released connection stays idle before it is evicted or health-checked, and the
    /// period of the health check afterwards.
    pub keepalive_interval_ms: u64,
    /// How many acquisitions may wait for a connection. `0` means unbounded.
    pub max_wait_queue_length: usize,
    /// How long a queued acquisition may wait. `0` means forever.
    pub wait_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_connections: 2,
            max_connections: 10,
            keepalive_interval_ms: 30_000,
            max_wait_queue_length: 100,
            wait_timeout_ms: 0,
        }
    }
}

impl PoolConfig {
    /// Create a config with the given connection bounds and default timings.
    pub fn new(min_connections: usize, max_connections: usize) -> Self {
        PoolConfig {
            min_connections,
            max_connections,
            ..Default::default()
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// `None` if queued acquisitions never time out
    pub fn wait_timeout(&self) -> Option<Duration> {
        (self.wait_timeout_ms > 0).then(|| Duration::from_millis(self.wait_timeout_ms))
    }

    /// `None` if the wait queue is unbounded
    pub fn wait_queue_limit(&self) -> Option<usize> {
        (self.max_wait_queue_length > 0).then_some(self.max_wait_queue_length)
    }

    /// Sub-millisecond parts are dropped, intervals beyond `u64::MAX` ms saturate.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = saturating_millis(interval);
        self
    }

    /// Sub-millisecond parts are dropped, timeouts beyond `u64::MAX` ms saturate.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_max_wait_queue_length(mut self, len: usize) -> Self {
        self.max_wait_queue_length = len;
        self
    }

    // Does not have to be async until we want runtime reload
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: PoolConfig = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).or_err(InternalError, "Unable to serialize pool conf")
    }

    /// Check the bounds, returning the config unchanged if they hold.
    pub fn validate(self) -> Result<Self> {
        if self.max_connections == 0 {
            return Error::e_explain(InvalidConfig, "max_connections must be at least 1");
        }
        if self.min_connections > self.max_connections {
            return Error::e_explain(
                InvalidConfig,
                format!(
                    "min_connections {} exceeds max_connections {}",
                    self.min_connections, self.max_connections
                ),
            );
        }
        Ok(self)
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_yaml() {
        init_log();
        let conf_str = r#"
---
min_connections: 1
max_connections: 4
keepalive_interval_ms: 20
max_wait_queue_length: 0
wait_timeout_ms: 50
        "#;
        let conf = PoolConfig::from_yaml(conf_str).unwrap();
        assert_eq!(1, conf.min_connections);
        assert_eq!(4, conf.max_connections);
        assert_eq!(Duration::from_millis(20), conf.keepalive_interval());
        assert_eq!(None, conf.wait_queue_limit());
        assert_eq!(Some(Duration::from_millis(50)), conf.wait_timeout());
    }

    #[test]
    fn test_default() {
        init_log();
        let conf = PoolConfig::from_yaml("---\nmax_connections: 3").unwrap();
        assert_eq!(2, conf.min_connections);
        assert_eq!(3, conf.max_connections);
        assert_eq!(Duration::from_secs(30), conf.keepalive_interval());
        assert_eq!(Some(100), conf.wait_queue_limit());
        assert_eq!(None, conf.wait_timeout());
    }

    #[test]
    fn test_validate() {
        init_log();
        let e = PoolConfig::from_yaml("---\nmax_connections: 0").unwrap_err();
        assert_eq!(e.etype(), &InvalidConfig);

        let e = PoolConfig::new(5, 4).validate().unwrap_err();
        assert_eq!(e.etype(), &InvalidConfig);
        assert!(e.to_string().contains("min_connections 5 exceeds max_connections 4"));

        assert!(PoolConfig::new(0, 1).validate().is_ok());
    }

    #[test]
    fn test_bad_yaml() {
        init_log();
        let e = PoolConfig::from_yaml("---\nmax_connections: many").unwrap_err();
        assert_eq!(e.etype(), &ReadError);
    }

    #[test]
    fn test_yaml_round_trip() {
        init_log();
        let conf = PoolConfig::new(0, 1)
            .with_keepalive_interval(Duration::from_millis(20))
            .with_wait_timeout(Duration::from_millis(50))
            .with_max_wait_queue_length(1);
        let yaml = conf.to_yaml().unwrap();
        assert_eq!(PoolConfig::from_yaml(&yaml).unwrap(), conf);
    }

    #[test]
    fn test_load_missing_file() {
        init_log();
        let e = PoolConfig::load_from_yaml("/nonexistent/reservoir.yaml").unwrap_err();
        assert_eq!(e.etype(), &ReadError);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let conf = PoolConfig::new(0, 1)
            .with_keepalive_interval(Duration::MAX)
            .with_wait_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(conf.keepalive_interval_ms, u64::MAX);
        assert_eq!(conf.wait_timeout_ms, u64::MAX);

        let conf = PoolConfig::new(0, 1).with_keepalive_interval(Duration::from_micros(20_900));
        assert_eq!(conf.keepalive_interval_ms, 20);
    }
}
