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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bucketcache_common::{bucket::BucketId, code::Key, strict_assert};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::oplog::LogMode;

/// Ownership state of a bucket on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BucketState {
    /// Another node owns the bucket. Key operations are refused.
    #[default]
    NotOwned,
    /// This node owns the bucket.
    Owned,
    /// This node owns the bucket and is handing it over. Writes are logged in the given mode.
    Transferring(LogMode),
}

impl BucketState {
    /// Whether key operations are served.
    pub fn is_owned(&self) -> bool {
        !matches!(self, BucketState::NotOwned)
    }

    /// The log mode while transferring.
    pub fn log_mode(&self) -> Option<LogMode> {
        match self {
            BucketState::Transferring(mode) => Some(*mode),
            _ => None,
        }
    }
}

/// Counters of one message topic inside a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    /// Tracked messages.
    pub count: usize,
    /// Bytes of tracked messages.
    pub size: usize,
}

/// Live accounting of one bucket.
#[derive(Debug)]
pub struct BucketStats<K> {
    count: usize,
    size: usize,
    keys: HashSet<K>,
    topics: HashMap<String, TopicStats>,
}

impl<K> Default for BucketStats<K> {
    fn default() -> Self {
        Self {
            count: 0,
            size: 0,
            keys: HashSet::new(),
            topics: HashMap::new(),
        }
    }
}

impl<K> BucketStats<K>
where
    K: Key,
{
    fn is_empty(&self) -> bool {
        self.count == 0 && self.keys.is_empty() && self.topics.is_empty()
    }

    fn snapshot(&self) -> BucketStatsSnapshot {
        BucketStatsSnapshot {
            count: self.count,
            size: self.size,
            topics: self
                .topics
                .iter()
                .map(|(topic, stats)| (topic.clone(), *stats))
                .sorted_by(|a, b| a.0.cmp(&b.0))
                .collect(),
            state_transfer_started: false,
        }
    }
}

/// Copy of the accounting of a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketStatsSnapshot {
    /// Entries.
    pub count: usize,
    /// Bytes of entries.
    pub size: usize,
    /// Per-topic message counters, sorted by topic.
    pub topics: Vec<(String, TopicStats)>,
    /// Whether state transfer of the bucket into this node has been prepared.
    pub state_transfer_started: bool,
}

/// Shared read access to the bucket states.
pub type StatesReadGuard<'a> = RwLockReadGuard<'a, Box<[BucketState]>>;
/// Exclusive access to the bucket states.
pub type StatesWriteGuard<'a> = RwLockWriteGuard<'a, Box<[BucketState]>>;

/// Ownership states and per-bucket accounting.
///
/// The state table sits behind one reader-writer lock: key operations hold it shared for their whole duration, and
/// ownership transitions hold it exclusively, so no key operation observes a transition halfway. Accounting is
/// guarded per bucket and kept only for buckets with members.
#[derive(Debug)]
pub struct BucketTable<K> {
    states: RwLock<Box<[BucketState]>>,
    stats: Box<[Mutex<Option<BucketStats<K>>>]>,
    transfer_started: Box<[AtomicBool]>,
    key_list_size: AtomicUsize,
}

impl<K> BucketTable<K>
where
    K: Key,
{
    /// Create a table of `count` buckets in the given initial state.
    pub fn new(count: u32, initial: BucketState) -> Self {
        let count = count.max(1) as usize;
        Self {
            states: RwLock::new(vec![initial; count].into_boxed_slice()),
            stats: (0..count).map(|_| Mutex::new(None)).collect(),
            transfer_started: (0..count).map(|_| AtomicBool::new(false)).collect(),
            key_list_size: AtomicUsize::new(0),
        }
    }

    /// Count of buckets.
    pub fn bucket_count(&self) -> u32 {
        self.stats.len() as u32
    }

    /// Share the state table.
    ///
    /// Recursive, so a thread already holding it shared re-enters even with a writer queued.
    pub fn read(&self) -> StatesReadGuard<'_> {
        self.states.read_recursive()
    }

    /// Lock the state table for a transition.
    pub fn write(&self) -> StatesWriteGuard<'_> {
        self.states.write()
    }

    /// State of the bucket.
    pub fn state(&self, bucket: BucketId) -> BucketState {
        self.read().get(bucket as usize).copied().unwrap_or_default()
    }

    fn with_stats<F, R>(&self, bucket: BucketId, f: F) -> R
    where
        F: FnOnce(&mut BucketStats<K>) -> R,
    {
        let mut slot = self.stats[bucket as usize].lock();
        let stats = slot.get_or_insert_with(BucketStats::default);
        let r = f(stats);
        if stats.is_empty() {
            *slot = None;
        }
        r
    }

    /// Account a new member.
    pub fn record_add(&self, bucket: BucketId, key: &K, size: usize) {
        self.with_stats(bucket, |stats| {
            if stats.keys.insert(key.clone()) {
                stats.count += 1;
                stats.size += size;
                self.key_list_size.fetch_add(std::mem::size_of::<K>(), Ordering::Relaxed);
            } else {
                strict_assert!(false, "key {key:?} accounted twice in bucket {bucket}");
            }
        })
    }

    /// Account an overwrite.
    pub fn record_resize(&self, bucket: BucketId, old_size: usize, new_size: usize) {
        self.with_stats(bucket, |stats| {
            strict_assert!(stats.size >= old_size);
            stats.size = stats.size.saturating_sub(old_size) + new_size;
        })
    }

    /// Account a removed member.
    pub fn record_remove(&self, bucket: BucketId, key: &K, size: usize) {
        self.with_stats(bucket, |stats| {
            if stats.keys.remove(key) {
                strict_assert!(stats.size >= size);
                stats.count -= 1;
                stats.size = stats.size.saturating_sub(size);
                self.key_list_size.fetch_sub(std::mem::size_of::<K>(), Ordering::Relaxed);
            }
        })
    }

    /// Members of the bucket.
    pub fn keys(&self, bucket: BucketId) -> Vec<K> {
        self.stats[bucket as usize]
            .lock()
            .as_ref()
            .map(|stats| stats.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of the accounting of the bucket. Buckets without members read as zero.
    pub fn snapshot(&self, bucket: BucketId) -> BucketStatsSnapshot {
        let mut snapshot = self.stats[bucket as usize]
            .lock()
            .as_ref()
            .map(BucketStats::snapshot)
            .unwrap_or_default();
        snapshot.state_transfer_started = self.transfer_started[bucket as usize].load(Ordering::Acquire);
        snapshot
    }

    /// Flag the bucket as being received through state transfer.
    pub fn set_transfer_started(&self, bucket: BucketId, started: bool) {
        self.transfer_started[bucket as usize].store(started, Ordering::Release);
    }

    /// Account a message of the topic.
    pub fn track_message(&self, bucket: BucketId, topic: &str, size: usize) {
        self.with_stats(bucket, |stats| {
            let topic = stats.topics.entry_ref(topic).or_default();
            topic.count += 1;
            topic.size += size;
        })
    }

    /// Forget a message of the topic.
    pub fn untrack_message(&self, bucket: BucketId, topic: &str, size: usize) {
        self.with_stats(bucket, |stats| {
            let Some(t) = stats.topics.get_mut(topic) else {
                return;
            };
            t.count = t.count.saturating_sub(1);
            t.size = t.size.saturating_sub(size);
            if t.count == 0 {
                stats.topics.remove(topic);
            }
        })
    }

    /// Forget the topic in every bucket.
    pub fn remove_topic(&self, topic: &str) {
        for slot in self.stats.iter() {
            let mut slot = slot.lock();
            if let Some(stats) = slot.as_mut() {
                stats.topics.remove(topic);
                if stats.is_empty() {
                    *slot = None;
                }
            }
        }
    }

    /// Drop the accounting of the bucket.
    pub fn clear_bucket(&self, bucket: BucketId) {
        self.set_transfer_started(bucket, false);
        if let Some(stats) = self.stats[bucket as usize].lock().take() {
            self.key_list_size
                .fetch_sub(stats.keys.len() * std::mem::size_of::<K>(), Ordering::Relaxed);
        }
    }

    /// Drop all accounting.
    pub fn clear(&self) {
        for bucket in 0..self.bucket_count() {
            self.clear_bucket(bucket);
        }
    }

    /// Sum of bucket sizes.
    pub fn total_size(&self) -> usize {
        self.stats
            .iter()
            .map(|slot| slot.lock().as_ref().map_or(0, |stats| stats.size))
            .sum()
    }

    /// Sum of bucket entry counts.
    pub fn total_count(&self) -> usize {
        self.stats
            .iter()
            .map(|slot| slot.lock().as_ref().map_or(0, |stats| stats.count))
            .sum()
    }

    /// Bytes spent on the per-bucket key lists.
    pub fn key_list_size(&self) -> usize {
        self.key_list_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<BucketTable<u64>>();
    }

    #[test]
    fn test_states() {
        let table = BucketTable::<u64>::new(4, BucketState::NotOwned);
        assert_eq!(table.bucket_count(), 4);
        assert!(!table.state(2).is_owned());

        table.write()[2] = BucketState::Transferring(LogMode::Deferred);
        assert!(table.state(2).is_owned());
        assert_eq!(table.state(2).log_mode(), Some(LogMode::Deferred));
        assert_eq!(table.state(100), BucketState::NotOwned);

        // Recursive reads.
        let outer = table.read();
        let inner = table.read();
        assert_eq!(outer[2], inner[2]);
    }

    #[test]
    fn test_accounting() {
        let table = BucketTable::<u64>::new(2, BucketState::Owned);
        table.record_add(0, &1, 100);
        table.record_add(0, &2, 50);
        table.record_add(1, &3, 10);
        table.record_resize(0, 100, 120);

        let snapshot = table.snapshot(0);
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.size, 170);
        assert_eq!(table.total_size(), 180);
        assert_eq!(table.total_count(), 3);
        assert_eq!(table.key_list_size(), 3 * std::mem::size_of::<u64>());

        table.record_remove(0, &1, 120);
        table.record_remove(0, &1, 120);
        assert_eq!(table.snapshot(0).size, 50);

        table.record_remove(0, &2, 50);
        // Emptied buckets drop their accounting.
        assert!(table.stats[0].lock().is_none());
        assert_eq!(table.snapshot(0), BucketStatsSnapshot::default());
        assert_eq!(table.key_list_size(), std::mem::size_of::<u64>());

        table.set_transfer_started(1, true);
        assert!(table.snapshot(1).state_transfer_started);

        table.clear();
        assert!(!table.snapshot(1).state_transfer_started);
        assert_eq!(table.total_size(), 0);
        assert_eq!(table.key_list_size(), 0);
    }

    #[test]
    fn test_topics() {
        let table = BucketTable::<u64>::new(2, BucketState::Owned);
        table.track_message(1, "orders", 10);
        table.track_message(1, "orders", 20);
        table.track_message(1, "audit", 5);
        assert_eq!(
            table.snapshot(1).topics,
            vec![
                ("audit".to_string(), TopicStats { count: 1, size: 5 }),
                ("orders".to_string(), TopicStats { count: 2, size: 30 }),
            ]
        );

        table.untrack_message(1, "orders", 10);
        table.untrack_message(1, "missing", 10);
        assert_eq!(table.snapshot(1).topics[1].1, TopicStats { count: 1, size: 20 });

        table.remove_topic("orders");
        table.untrack_message(1, "audit", 5);
        assert!(table.stats[1].lock().is_none());
    }
}
