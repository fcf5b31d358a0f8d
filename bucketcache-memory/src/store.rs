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

use std::{
    convert::Infallible,
    hash::BuildHasher,
    sync::atomic::{AtomicUsize, Ordering},
};

use bucketcache_common::{bucket::BucketHashBuilder, code::Key, strict_assert};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::entry::Entry;

/// User writes may fill the capacity except for `1 / USER_RESERVE_DIVISOR` of it. Internal writes may use all of it.
const USER_RESERVE_DIVISOR: usize = 20;
/// Accommodation of `1 / EXTRA_DIVISOR` of the capacity granted while eviction catches up.
const EXTRA_DIVISOR: usize = 5;

/// Result of [`Store::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// Stored.
    Success,
    /// The key is already present. Nothing changed.
    KeyExists,
    /// Capacity exhausted. Nothing changed.
    NotEnoughSpace,
    /// Stored, but an eviction pass should run.
    SuccessNearEviction,
}

/// Result of [`Store::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Stored a new key.
    Success,
    /// Replaced an existing entry.
    SuccessOverwrite,
    /// Capacity exhausted. Nothing changed.
    NotEnoughSpace,
    /// Stored a new key, but an eviction pass should run.
    SuccessNearEviction,
    /// Replaced an existing entry, but an eviction pass should run.
    SuccessOverwriteNearEviction,
}

impl InsertResult {
    /// Whether the entry was stored.
    pub fn is_success(self) -> bool {
        !matches!(self, InsertResult::NotEnoughSpace)
    }

    /// Whether an existing entry was replaced.
    pub fn is_overwrite(self) -> bool {
        matches!(
            self,
            InsertResult::SuccessOverwrite | InsertResult::SuccessOverwriteNearEviction
        )
    }

    /// Whether an eviction pass should run.
    pub fn is_near_eviction(self) -> bool {
        matches!(
            self,
            InsertResult::SuccessNearEviction | InsertResult::SuccessOverwriteNearEviction
        )
    }

    /// Fold the near-eviction variants into plain success.
    pub fn settled(self) -> Self {
        match self {
            InsertResult::SuccessNearEviction => InsertResult::Success,
            InsertResult::SuccessOverwriteNearEviction => InsertResult::SuccessOverwrite,
            r => r,
        }
    }
}

impl AddResult {
    /// Fold the near-eviction variant into plain success.
    pub fn settled(self) -> Self {
        match self {
            AddResult::SuccessNearEviction => AddResult::Success,
            r => r,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Fits,
    Near,
    Full,
}

/// Config of a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity in bytes.
    pub capacity: usize,
    /// Optional ceiling of the entry count.
    pub max_count: Option<usize>,
    /// Shard count.
    pub shards: usize,
    /// Whether an eviction policy backs the store, granting extra accommodation.
    pub eviction_enabled: bool,
}

/// The physical entry table.
///
/// Entries are spread over shards by key hash. Each shard is guarded by its own lock, while usage and count are
/// shared atomics, so the capacity check is best effort across shards. The extra accommodation absorbs the overshoot.
pub struct Store<K, S = BucketHashBuilder>
where
    K: Key,
    S: BuildHasher + Send + Sync + 'static,
{
    shards: Vec<RwLock<HashMap<K, Entry<K>>>>,
    hash_builder: S,

    capacity: usize,
    max_count: Option<usize>,
    extra: usize,

    usage: AtomicUsize,
    count: AtomicUsize,
}

impl<K, S> Store<K, S>
where
    K: Key,
    S: BuildHasher + Send + Sync + 'static,
{
    /// Create a store.
    pub fn new(config: StoreConfig, hash_builder: S) -> Self {
        let shards = config.shards.max(1);
        let extra = if config.eviction_enabled {
            config.capacity / EXTRA_DIVISOR
        } else {
            0
        };
        Self {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            hash_builder,
            capacity: config.capacity,
            max_count: config.max_count,
            extra,
            usage: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }

    fn shard(&self, key: &K) -> usize {
        self.hash_builder.hash_one(key) as usize % self.shards.len()
    }

    fn has_space(&self, next: usize, internal: bool) -> Space {
        let max = if internal {
            self.capacity
        } else {
            self.capacity - self.capacity / USER_RESERVE_DIVISOR
        };
        if next <= max {
            Space::Fits
        } else if next <= max + self.extra {
            Space::Near
        } else {
            Space::Full
        }
    }

    fn count_exhausted(&self) -> bool {
        self.max_count
            .is_some_and(|max| self.count.load(Ordering::Relaxed) >= max)
    }

    /// Store a new key. Fails with [`AddResult::KeyExists`] if present.
    pub fn add(&self, key: K, entry: Entry<K>, internal: bool) -> AddResult {
        self.add_with(key, entry, internal, |_| {})
    }

    /// Like [`Self::add`], calling `commit` with the stored entry under the shard lock once the write is certain.
    pub fn add_with<C>(&self, key: K, entry: Entry<K>, internal: bool, commit: C) -> AddResult
    where
        C: FnOnce(&Entry<K>),
    {
        let size = entry.size();
        let mut shard = self.shards[self.shard(&key)].write();
        if shard.contains_key(&key) {
            return AddResult::KeyExists;
        }
        if self.count_exhausted() {
            return AddResult::NotEnoughSpace;
        }
        let space = self.has_space(self.usage.load(Ordering::Relaxed) + size, internal);
        if space == Space::Full {
            return AddResult::NotEnoughSpace;
        }
        commit(&entry);
        shard.insert(key, entry);
        self.usage.fetch_add(size, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        match space {
            Space::Near => AddResult::SuccessNearEviction,
            _ => AddResult::Success,
        }
    }

    /// Store a key, replacing any existing entry. The replaced entry is returned on success.
    pub fn insert(&self, key: K, entry: Entry<K>, internal: bool) -> (InsertResult, Option<Entry<K>>) {
        let Ok(res) = self.insert_with::<_, _, Infallible>(key, entry, internal, |_, _| Ok(()), |_, _| {});
        res
    }

    /// Like [`Self::insert`], with two hooks running under the shard lock, so no other write to the key interleaves.
    ///
    /// `prepare` validates the write against the entry it replaces and may adjust the metadata of the new entry.
    /// `commit` sees the replaced and the new entry once the write is certain.
    pub fn insert_with<P, C, E>(
        &self,
        key: K,
        mut entry: Entry<K>,
        internal: bool,
        prepare: P,
        commit: C,
    ) -> Result<(InsertResult, Option<Entry<K>>), E>
    where
        P: FnOnce(Option<&Entry<K>>, &mut Entry<K>) -> Result<(), E>,
        C: FnOnce(Option<&Entry<K>>, &Entry<K>),
    {
        let mut shard = self.shards[self.shard(&key)].write();
        prepare(shard.get(&key), &mut entry)?;
        let size = entry.size();
        let old_size = shard.get(&key).map(Entry::size);
        if old_size.is_none() && self.count_exhausted() {
            return Ok((InsertResult::NotEnoughSpace, None));
        }
        let next = (self.usage.load(Ordering::Relaxed) + size).saturating_sub(old_size.unwrap_or(0));
        let space = self.has_space(next, internal);
        if space == Space::Full {
            return Ok((InsertResult::NotEnoughSpace, None));
        }
        commit(shard.get(&key), &entry);
        let old = shard.insert(key, entry);
        self.usage.fetch_add(size, Ordering::Relaxed);
        match &old {
            Some(old) => {
                self.usage.fetch_sub(old.size(), Ordering::Relaxed);
            }
            None => {
                self.count.fetch_add(1, Ordering::Relaxed);
            }
        }

        let result = match (old.is_some(), space) {
            (false, Space::Near) => InsertResult::SuccessNearEviction,
            (true, Space::Near) => InsertResult::SuccessOverwriteNearEviction,
            (false, _) => InsertResult::Success,
            (true, _) => InsertResult::SuccessOverwrite,
        };
        Ok((result, old))
    }

    /// Remove a key, returning its entry.
    pub fn remove(&self, key: &K) -> Option<Entry<K>> {
        let Ok(old) = self.remove_with::<_, _, Infallible>(key, |_| Ok(()), |_| {});
        old
    }

    /// Like [`Self::remove`], with two hooks running under the shard lock.
    ///
    /// `check` must accept the entry before it is removed. `commit` sees the removed entry.
    pub fn remove_with<F, C, E>(&self, key: &K, check: F, commit: C) -> Result<Option<Entry<K>>, E>
    where
        F: FnOnce(&Entry<K>) -> Result<(), E>,
        C: FnOnce(&Entry<K>),
    {
        let mut shard = self.shards[self.shard(key)].write();
        let Some(current) = shard.get(key) else {
            return Ok(None);
        };
        check(current)?;
        let old = shard.remove(key);
        if let Some(old) = &old {
            strict_assert!(self.usage.load(Ordering::Relaxed) >= old.size());
            self.usage.fetch_sub(old.size(), Ordering::Relaxed);
            self.count.fetch_sub(1, Ordering::Relaxed);
            commit(old);
        }
        drop(shard);
        Ok(old)
    }

    /// Get a clone of the entry.
    pub fn get(&self, key: &K) -> Option<Entry<K>> {
        self.shards[self.shard(key)].read().get(key).cloned()
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.shards[self.shard(key)].read().contains_key(key)
    }

    /// Size of the entry, if present.
    pub fn entry_size(&self, key: &K) -> Option<usize> {
        self.shards[self.shard(key)].read().get(key).map(Entry::size)
    }

    /// Mutate the entry metadata in place. The payload size must not change.
    pub fn update<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&mut Entry<K>) -> R,
    {
        self.shards[self.shard(key)].write().get_mut(key).map(|entry| {
            let size = entry.size();
            let r = f(entry);
            strict_assert!(entry.size() == size);
            r
        })
    }

    /// Visit every entry. Each shard is read-locked while visited.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &Entry<K>),
    {
        for shard in self.shards.iter() {
            shard.read().iter().for_each(|(k, e)| f(k, e));
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let drained = std::mem::take(&mut *shard.write());
            // Deallocate data out of the lock critical section.
            drop(drained);
        }
        self.usage.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }

    /// Bytes held.
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    /// Entries held.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize, eviction_enabled: bool) -> Store<u64> {
        Store::new(
            StoreConfig {
                capacity,
                max_count: None,
                shards: 4,
                eviction_enabled,
            },
            BucketHashBuilder::default(),
        )
    }

    fn entry(size: usize) -> Entry<u64> {
        Entry::new(vec![0u8; size])
    }

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Store<u64>>();
    }

    #[test]
    fn test_add_and_key_exists() {
        let store = store(1000, false);
        assert_eq!(store.add(1, entry(10), false), AddResult::Success);
        assert_eq!(store.add(1, entry(20), false), AddResult::KeyExists);
        assert_eq!(store.get(&1).unwrap().size(), 10);
        assert_eq!(store.usage(), 10);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_user_capacity_threshold() {
        let store = store(1000, false);
        assert_eq!(store.add(1, entry(950), false), AddResult::Success);
        // Over 95% for user writes, no accommodation without eviction.
        assert_eq!(store.add(2, entry(1), false), AddResult::NotEnoughSpace);
        // Internal writes may use the full capacity.
        assert_eq!(store.add(2, entry(50), true), AddResult::Success);
        assert_eq!(store.add(3, entry(1), true), AddResult::NotEnoughSpace);
        assert_eq!(store.usage(), 1000);
    }

    #[test]
    fn test_near_eviction() {
        let store = store(1000, true);
        assert_eq!(store.add(1, entry(900), false), AddResult::Success);
        // 950 + 200 accommodation.
        assert_eq!(store.add(2, entry(200), false), AddResult::SuccessNearEviction);
        assert_eq!(store.add(3, entry(100), false), AddResult::NotEnoughSpace);
        assert_eq!(store.usage(), 1100);
    }

    #[test]
    fn test_insert_overwrite_accounts_delta() {
        let store = store(1000, true);
        assert_eq!(store.insert(1, entry(100), false).0, InsertResult::Success);
        let (res, old) = store.insert(1, entry(120), false);
        assert_eq!(res, InsertResult::SuccessOverwrite);
        assert_eq!(old.unwrap().size(), 100);
        assert_eq!(store.usage(), 120);
        assert_eq!(store.count(), 1);

        // Shrinking an entry always fits.
        assert_eq!(store.insert(2, entry(830), false).0, InsertResult::Success);
        let (res, _) = store.insert(2, entry(1000), false);
        assert_eq!(res, InsertResult::SuccessOverwriteNearEviction);
        let (res, _) = store.insert(2, entry(10), false);
        assert_eq!(res, InsertResult::SuccessOverwrite);
        assert_eq!(store.usage(), 130);
    }

    #[test]
    fn test_insert_not_enough_space_keeps_old() {
        let store = store(100, false);
        store.insert(1, entry(50), false);
        let (res, old) = store.insert(1, entry(200), false);
        assert_eq!(res, InsertResult::NotEnoughSpace);
        assert!(old.is_none());
        assert_eq!(store.get(&1).unwrap().size(), 50);
        assert_eq!(store.usage(), 50);
    }

    #[test]
    fn test_max_count() {
        let store = Store::<u64>::new(
            StoreConfig {
                capacity: 1000,
                max_count: Some(2),
                shards: 1,
                eviction_enabled: false,
            },
            BucketHashBuilder::default(),
        );
        assert_eq!(store.add(1, entry(1), false), AddResult::Success);
        assert_eq!(store.add(2, entry(1), false), AddResult::Success);
        assert_eq!(store.add(3, entry(1), false), AddResult::NotEnoughSpace);
        // Overwrites do not grow the count.
        assert_eq!(store.insert(2, entry(2), false).0, InsertResult::SuccessOverwrite);
    }

    #[test]
    fn test_remove_and_clear() {
        let store = store(1000, false);
        for i in 0..10 {
            store.add(i, entry(10), false);
        }
        assert_eq!(store.remove(&3).unwrap().size(), 10);
        assert!(store.remove(&3).is_none());
        assert!(!store.contains(&3));
        assert_eq!(store.usage(), 90);

        let mut seen = 0;
        store.for_each(|_, _| seen += 1);
        assert_eq!(seen, 9);

        store.clear();
        assert_eq!(store.usage(), 0);
        assert_eq!(store.count(), 0);
        assert!(store.get(&1).is_none());
    }

    #[test]
    fn test_checked_writes() {
        use bucketcache_common::error::{Error, ErrorKind};

        let store = store(1000, false);
        store.insert(1, entry(10), false);

        let res = store.insert_with(
            1,
            entry(20),
            false,
            |old, _| match old {
                Some(_) => Err(Error::key_exists()),
                None => Ok(()),
            },
            |_, _| unreachable!(),
        );
        assert_eq!(res.unwrap_err().kind(), ErrorKind::KeyExists);
        assert_eq!(store.usage(), 10);

        let mut committed = None;
        let (res, old) = store
            .insert_with(
                1,
                entry(20),
                false,
                |old, new| {
                    new.update_version(old);
                    Ok::<_, Error>(())
                },
                |old, new| committed = Some((old.map(Entry::size), new.size())),
            )
            .unwrap();
        assert_eq!(res, InsertResult::SuccessOverwrite);
        assert_eq!(committed, Some((Some(10), 20)));
        assert_eq!(old.unwrap().version(), 0);
        assert_eq!(store.get(&1).unwrap().version(), 1);

        let res = store.remove_with(&1, |_| Err(Error::item_locked()), |_| unreachable!());
        assert_eq!(res.unwrap_err().kind(), ErrorKind::ItemLocked);
        assert!(store.contains(&1));
        assert!(store
            .remove_with(&2, |_| Err(Error::item_locked()), |_| unreachable!())
            .unwrap()
            .is_none());

        let mut removed = 0;
        let old = store
            .remove_with(&1, |_| Ok::<_, Error>(()), |old| removed = old.size())
            .unwrap();
        assert_eq!(old.unwrap().size(), 20);
        assert_eq!(removed, 20);
    }

    #[test]
    fn test_commit_skipped_when_full() {
        let store = store(100, false);
        let mut committed = false;
        assert_eq!(
            store.add_with(1, entry(200), false, |_| committed = true),
            AddResult::NotEnoughSpace
        );
        assert!(!committed);
        assert_eq!(store.add_with(1, entry(20), false, |_| committed = true), AddResult::Success);
        assert!(committed);
    }

    #[test]
    fn test_settled() {
        assert_eq!(InsertResult::SuccessNearEviction.settled(), InsertResult::Success);
        assert_eq!(
            InsertResult::SuccessOverwriteNearEviction.settled(),
            InsertResult::SuccessOverwrite
        );
        assert_eq!(AddResult::SuccessNearEviction.settled(), AddResult::Success);
        assert_eq!(AddResult::KeyExists.settled(), AddResult::KeyExists);
    }
}
