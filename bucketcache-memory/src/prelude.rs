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

#[cfg(any(test, feature = "test_utils"))]
pub use crate::test_utils::{keys_in_bucket, RecordedEvent, RecordingListener};
pub use crate::{
    bucket::{BucketState, BucketStatsSnapshot, TopicStats},
    cache::{OpOrigin, PartitionedCache, PartitionedCacheBuilder, ReplayStats},
    config::{CacheConfig, EvictionConfig, EvictionMode, NotificationConfig},
    entry::{Entry, Expiration, GroupInfo, Hint, LockAccess, LockInfo, LockOutcome, Priority, WriteOptions},
    eviction::{EvictionPolicy, PolicyConfig},
    expiration::{ExpirationIndex, NoopExpiration, TtlExpiration},
    notification::{Interest, PollNotificationManager, PollResult},
    oplog::{ChangeSet, LogMode, LogTable, OpKind},
    store::{AddResult, InsertResult},
};
