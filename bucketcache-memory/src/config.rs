//  Copyright 2025 bucketcache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::time::Duration;

use bucketcache_common::{
    bucket::DEFAULT_BUCKET_COUNT,
    error::{Error, Result},
};
use serde::{Deserialize, Serialize};

use crate::{
    entry::Priority,
    eviction::PolicyConfig,
    oplog::DEFAULT_STOP_LOGGING_THRESHOLD,
};

/// Where eviction passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionMode {
    /// On the writer thread. A write short of space runs a pass and retries.
    Sync,
    /// On a background thread. Writes short of space fail immediately and schedule a pass.
    #[default]
    Async,
}

/// Eviction config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Whether entries are evicted at all.
    pub enabled: bool,
    /// Fraction of the usage one pass frees, in `(0, 1]`.
    pub evict_ratio: f64,
    /// Where passes run.
    pub mode: EvictionMode,
    /// Victim selection.
    pub policy: PolicyConfig,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evict_ratio: 0.25,
            mode: EvictionMode::default(),
            policy: PolicyConfig::default(),
        }
    }
}

/// Pull-based client notification config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Interval between poller wake-ups, in milliseconds.
    pub poll_interval_ms: u64,
    /// Idle time after which a client is dropped, in milliseconds.
    pub dead_client_timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            dead_client_timeout_ms: 30 * 60 * 1000,
        }
    }
}

impl NotificationConfig {
    /// Interval between poller wake-ups.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle time after which a client is dropped.
    pub fn dead_client_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_client_timeout_ms)
    }
}

/// Config of a [`crate::cache::PartitionedCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name used as metrics label and in thread names.
    pub name: String,
    /// Capacity in bytes.
    pub capacity: usize,
    /// Optional ceiling of the entry count.
    pub max_count: Option<usize>,
    /// Store shard count.
    pub shards: usize,
    /// Bucket count. 0 disables partitioning: a single bucket owned from the start.
    pub bucket_count: u32,
    /// Backlog below which draining a log finalizes a transfer.
    pub stop_logging_threshold: usize,
    /// Whether the group index is kept.
    pub indexing: bool,
    /// Eviction.
    pub eviction: EvictionConfig,
    /// Client notifications, disabled if none.
    pub notification: Option<NotificationConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "bucketcache".to_string(),
            capacity: 64 * 1024 * 1024,
            max_count: None,
            shards: 8,
            bucket_count: DEFAULT_BUCKET_COUNT,
            stop_logging_threshold: DEFAULT_STOP_LOGGING_THRESHOLD,
            indexing: true,
            eviction: EvictionConfig::default(),
            notification: None,
        }
    }
}

impl CacheConfig {
    /// Check the config is usable.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("cache name must not be empty"));
        }
        if self.capacity == 0 {
            return Err(Error::config("capacity must be positive").with_context("capacity", self.capacity));
        }
        if self.max_count == Some(0) {
            return Err(Error::config("max count must be positive when set"));
        }
        if self.shards == 0 {
            return Err(Error::config("shard count must be positive").with_context("shards", self.shards));
        }
        let ratio = self.eviction.evict_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::config("evict ratio must be in (0, 1]").with_context("evict_ratio", ratio));
        }
        if let PolicyConfig::Priority {
            default_priority: Priority::Default,
        } = self.eviction.policy
        {
            return Err(Error::config("default priority must name a concrete priority"));
        }
        if let Some(notification) = &self.notification {
            if notification.poll_interval_ms == 0 {
                return Err(Error::config("poll interval must be positive"));
            }
        }
        Ok(())
    }
}
