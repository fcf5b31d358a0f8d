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

use bucketcache_common::{
    bucket::{BucketId, BucketRouter},
    code::Key,
    event::{CacheEvent, EventListener, RemoveReason},
};
use parking_lot::Mutex;

/// An owned copy of a [`CacheEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent<K> {
    /// See [`CacheEvent::ItemAdded`].
    Added(K),
    /// See [`CacheEvent::ItemUpdated`].
    Updated(K),
    /// See [`CacheEvent::ItemRemoved`].
    Removed(K, RemoveReason),
    /// See [`CacheEvent::CacheCleared`].
    Cleared,
    /// See [`CacheEvent::PollRequired`].
    PollRequired(String),
}

/// A listener that records all events.
#[derive(Debug)]
pub struct RecordingListener<K> {
    events: Mutex<Vec<RecordedEvent<K>>>,
}

impl<K> Default for RecordingListener<K> {
    fn default() -> Self {
        Self {
            events: Mutex::new(vec![]),
        }
    }
}

impl<K> RecordingListener<K>
where
    K: Key,
{
    /// Copy of the recorded events.
    pub fn events(&self) -> Vec<RecordedEvent<K>> {
        self.events.lock().clone()
    }

    /// Take the recorded events, leaving none.
    pub fn take(&self) -> Vec<RecordedEvent<K>> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl<K> EventListener for RecordingListener<K>
where
    K: Key,
{
    type Key = K;

    fn on_event(&self, event: CacheEvent<'_, Self::Key>) {
        let recorded = match event {
            CacheEvent::ItemAdded { key } => RecordedEvent::Added(key.clone()),
            CacheEvent::ItemUpdated { key } => RecordedEvent::Updated(key.clone()),
            CacheEvent::ItemRemoved { key, reason } => RecordedEvent::Removed(key.clone(), reason),
            CacheEvent::CacheCleared => RecordedEvent::Cleared,
            CacheEvent::PollRequired { client } => RecordedEvent::PollRequired(client.to_string()),
        };
        self.events.lock().push(recorded);
    }
}

/// The first `n` keys of the form `key-{i}` routed to `bucket` among `bucket_count` buckets.
pub fn keys_in_bucket(bucket_count: u32, bucket: BucketId, n: usize) -> Vec<String> {
    let router = BucketRouter::new(bucket_count);
    (0..)
        .map(|i| format!("key-{i}"))
        .filter(|key| router.bucket(key) == bucket)
        .take(n)
        .collect()
}
