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

use super::{registry::noop::NoopMetricsRegistry, BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

/// Metrics of a partitioned cache.
#[derive(Debug)]
pub struct Metrics {
    /// Successful adds of new keys.
    pub cache_add: BoxedCounter,
    /// Successful inserts of new keys.
    pub cache_insert: BoxedCounter,
    /// Successful inserts over existing keys.
    pub cache_overwrite: BoxedCounter,
    /// Removed entries.
    pub cache_remove: BoxedCounter,
    /// Point reads that found an entry.
    pub cache_hit: BoxedCounter,
    /// Point reads that found nothing.
    pub cache_miss: BoxedCounter,
    /// Entries removed by eviction.
    pub cache_evict: BoxedCounter,
    /// Entries removed by expiration.
    pub cache_expire: BoxedCounter,
    /// Operations recorded into an operation log.
    pub cache_logged: BoxedCounter,
    /// Logged operations replayed into the store.
    pub cache_replayed: BoxedCounter,
    /// Operations rejected because the bucket is not owned.
    pub cache_rejected: BoxedCounter,

    /// Bytes held by the store.
    pub cache_usage: BoxedGauge,
    /// Entries held by the store.
    pub cache_entries: BoxedGauge,

    /// Duration of eviction passes in seconds.
    pub cache_evict_duration: BoxedHistogram,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new(name: &str, registry: &(impl RegistryOps + ?Sized)) -> Self {
        let op_total =
            registry.register_counter_vec("bucketcache_op_total", "bucketcache operations", &["name", "op"]);
        let usage = registry.register_gauge_vec("bucketcache_usage", "bucketcache usage", &["name", "type"]);
        let pass_duration = registry.register_histogram_vec(
            "bucketcache_pass_duration",
            "bucketcache background pass durations",
            &["name", "pass"],
        );

        let cache_add = op_total.counter(&[name, "add"]);
        let cache_insert = op_total.counter(&[name, "insert"]);
        let cache_overwrite = op_total.counter(&[name, "overwrite"]);
        let cache_remove = op_total.counter(&[name, "remove"]);
        let cache_hit = op_total.counter(&[name, "hit"]);
        let cache_miss = op_total.counter(&[name, "miss"]);
        let cache_evict = op_total.counter(&[name, "evict"]);
        let cache_expire = op_total.counter(&[name, "expire"]);
        let cache_logged = op_total.counter(&[name, "logged"]);
        let cache_replayed = op_total.counter(&[name, "replayed"]);
        let cache_rejected = op_total.counter(&[name, "rejected"]);

        let cache_usage = usage.gauge(&[name, "bytes"]);
        let cache_entries = usage.gauge(&[name, "entries"]);

        let cache_evict_duration = pass_duration.histogram(&[name, "evict"]);

        Self {
            cache_add,
            cache_insert,
            cache_overwrite,
            cache_remove,
            cache_hit,
            cache_miss,
            cache_evict,
            cache_expire,
            cache_logged,
            cache_replayed,
            cache_rejected,
            cache_usage,
            cache_entries,
            cache_evict_duration,
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be called by other crates.
    pub fn noop() -> Self {
        Self::new("test", &NoopMetricsRegistry)
    }
}
