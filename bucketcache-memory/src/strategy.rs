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

//! Pluggable secondary indexing and key partitioning.

use std::{hash::Hash, marker::PhantomData};

use bucketcache_common::{
    bucket::{BucketId, BucketRouter},
    code::Key,
};
use parking_lot::RwLock;

use crate::{entry::Entry, group::GroupIndex};

/// Secondary indexes maintained alongside the store.
pub trait IndexingStrategy<K>: Send + Sync + 'static
where
    K: Key,
{
    /// A new key was stored.
    fn on_added(&self, key: &K, entry: &Entry<K>);

    /// An existing key was overwritten.
    fn on_updated(&self, key: &K, old: &Entry<K>, new: &Entry<K>) {
        self.on_removed(key, old);
        self.on_added(key, new);
    }

    /// A key was removed.
    fn on_removed(&self, key: &K, entry: &Entry<K>);

    /// Members of the group, or only of the sub-group if one is named.
    fn group_keys(&self, group: &str, sub_group: Option<&str>) -> Vec<K>;

    /// Whether the group has members.
    fn group_exists(&self, group: &str) -> bool;

    /// Whether the key is a member of the group, and of the sub-group if one is named.
    fn key_exists(&self, key: &K, group: &str, sub_group: Option<&str>) -> bool;

    /// Estimated bytes held by the indexes.
    fn in_memory_size(&self) -> usize;

    /// Drop the indexes.
    fn clear(&self);
}

/// Keeps no index.
#[derive(Debug)]
pub struct NoIndexing<K>(PhantomData<K>);

impl<K> Default for NoIndexing<K> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K> IndexingStrategy<K> for NoIndexing<K>
where
    K: Key,
{
    fn on_added(&self, _: &K, _: &Entry<K>) {}

    fn on_updated(&self, _: &K, _: &Entry<K>, _: &Entry<K>) {}

    fn on_removed(&self, _: &K, _: &Entry<K>) {}

    fn group_keys(&self, _: &str, _: Option<&str>) -> Vec<K> {
        vec![]
    }

    fn group_exists(&self, _: &str) -> bool {
        false
    }

    fn key_exists(&self, _: &K, _: &str, _: Option<&str>) -> bool {
        false
    }

    fn in_memory_size(&self) -> usize {
        0
    }

    fn clear(&self) {}
}

/// Indexes entries by their data group.
#[derive(Debug)]
pub struct GroupIndexing<K> {
    index: RwLock<GroupIndex<K>>,
}

impl<K> Default for GroupIndexing<K> {
    fn default() -> Self {
        Self {
            index: RwLock::new(GroupIndex::default()),
        }
    }
}

impl<K> IndexingStrategy<K> for GroupIndexing<K>
where
    K: Key,
{
    fn on_added(&self, key: &K, entry: &Entry<K>) {
        if let Some(info) = entry.group() {
            self.index.write().add_to_group(key, info);
        }
    }

    fn on_updated(&self, key: &K, old: &Entry<K>, new: &Entry<K>) {
        if old.group() == new.group() {
            return;
        }
        let mut index = self.index.write();
        if let Some(info) = old.group() {
            index.remove_from_group(key, info);
        }
        if let Some(info) = new.group() {
            index.add_to_group(key, info);
        }
    }

    fn on_removed(&self, key: &K, entry: &Entry<K>) {
        if let Some(info) = entry.group() {
            self.index.write().remove_from_group(key, info);
        }
    }

    fn group_keys(&self, group: &str, sub_group: Option<&str>) -> Vec<K> {
        self.index.read().get_group_keys(group, sub_group)
    }

    fn group_exists(&self, group: &str) -> bool {
        self.index.read().group_exists(group)
    }

    fn key_exists(&self, key: &K, group: &str, sub_group: Option<&str>) -> bool {
        self.index.read().key_exists(key, group, sub_group)
    }

    fn in_memory_size(&self) -> usize {
        self.index.read().in_memory_size()
    }

    fn clear(&self) {
        self.index.write().clear();
    }
}

/// Maps keys to buckets.
pub trait PartitioningStrategy<K>: Send + Sync + 'static
where
    K: Key,
{
    /// Count of buckets.
    fn bucket_count(&self) -> u32;

    /// Bucket of the key.
    fn bucket(&self, key: &K) -> BucketId;

    /// Bucket of a message id, for topic accounting.
    fn message_bucket(&self, message_id: &str) -> BucketId;

    /// Whether buckets start owned, before any ownership update.
    fn initially_owned(&self) -> bool;
}

/// A single bucket, owned from the start. For standalone caches.
#[derive(Debug, Default)]
pub struct NoPartitioning;

impl<K> PartitioningStrategy<K> for NoPartitioning
where
    K: Key,
{
    fn bucket_count(&self) -> u32 {
        1
    }

    fn bucket(&self, _: &K) -> BucketId {
        0
    }

    fn message_bucket(&self, _: &str) -> BucketId {
        0
    }

    fn initially_owned(&self) -> bool {
        true
    }
}

/// Hash partitioning over a fixed bucket count. Buckets start not owned until the rebalancer assigns them.
#[derive(Debug, Default)]
pub struct HashedPartitioning {
    router: BucketRouter,
}

impl HashedPartitioning {
    /// Partition over `bucket_count` buckets.
    pub fn new(bucket_count: u32) -> Self {
        Self {
            router: BucketRouter::new(bucket_count),
        }
    }

    /// The router.
    pub fn router(&self) -> &BucketRouter {
        &self.router
    }

    fn route<Q>(&self, key: &Q) -> BucketId
    where
        Q: Hash + ?Sized,
    {
        self.router.bucket(key)
    }
}

impl<K> PartitioningStrategy<K> for HashedPartitioning
where
    K: Key,
{
    fn bucket_count(&self) -> u32 {
        self.router.bucket_count()
    }

    fn bucket(&self, key: &K) -> BucketId {
        self.route(key)
    }

    fn message_bucket(&self, message_id: &str) -> BucketId {
        self.route(message_id)
    }

    fn initially_owned(&self) -> bool {
        false
    }
}
