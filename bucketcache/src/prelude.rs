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

#[cfg(feature = "prometheus")]
pub use crate::common::metrics::registry::prometheus::PrometheusMetricsRegistry;
pub use crate::{
    common::{
        bucket::{BucketHashBuilder, BucketId, BucketRouter, DEFAULT_BUCKET_COUNT},
        code::Key,
        error::{Error, ErrorKind, Result},
        event::{CacheEvent, EventListener, NoopEventListener, RemoveReason},
        metrics::{model::Metrics, registry::noop::NoopMetricsRegistry, BoxedRegistry, RegistryOps},
        scope::Scope,
    },
    memory::{
        AddResult, BucketState, BucketStatsSnapshot, CacheConfig, ChangeSet, Entry, EvictionConfig, EvictionMode,
        EvictionPolicy, Expiration, ExpirationIndex, GroupInfo, Hint, InsertResult, Interest, LockAccess, LockInfo,
        LockOutcome, LogMode, LogTable, NoopExpiration, NotificationConfig, OpKind, OpOrigin, PartitionedCache,
        PartitionedCacheBuilder, PolicyConfig, PollNotificationManager, PollResult, Priority, ReplayStats,
        TopicStats, TtlExpiration, WriteOptions,
    },
};
