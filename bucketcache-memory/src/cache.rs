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
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use bucketcache_common::{
    bucket::{BucketHashBuilder, BucketId},
    code::Key,
    error::{Error, ErrorKind, Result},
    event::{CacheEvent, EventListener, RemoveReason},
    metrics::{model::Metrics, registry::noop::NoopMetricsRegistry, BoxedRegistry},
    strict_assert,
};
use hashbrown::HashSet;
use itertools::Itertools;
use parking_lot::Mutex;

use crate::{
    bucket::{BucketState, BucketStatsSnapshot, BucketTable},
    config::{CacheConfig, EvictionConfig, EvictionMode, NotificationConfig},
    entry::{Entry, GroupInfo, LockAccess, LockInfo, LockOutcome, WriteOptions},
    eviction::EvictionPolicy,
    evictor::Evictor,
    expiration::{ExpirationIndex, TtlExpiration},
    notification::PollNotificationManager,
    oplog::{ChangeSet, LogMode, LogTable, OpKind, OperationLogManager},
    store::{AddResult, InsertResult, Store, StoreConfig},
    strategy::{GroupIndexing, HashedPartitioning, IndexingStrategy, NoIndexing, NoPartitioning, PartitioningStrategy},
};

/// Max victims removed under one acquisition of the bucket states during a background pass.
const EVICTION_BATCH: usize = 300;
/// Passes a synchronous writer runs before giving up on space.
const SYNC_EVICTION_RETRIES: usize = 3;

/// Who issued an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOrigin {
    /// A cache user.
    User,
    /// State transfer, replication or log replay.
    Internal,
    /// An eviction pass.
    Eviction,
    /// The expiration index.
    Expiration,
    /// The removal of an entry this one depends on.
    Dependency,
}

impl OpOrigin {
    /// Whether the operation came from a cache user.
    pub fn is_user(self) -> bool {
        self == OpOrigin::User
    }
}

/// Outcome of replaying deferred logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Keys removed.
    pub removed: usize,
    /// Keys written.
    pub updated: usize,
    /// Logged operations that could not be applied.
    pub failed: usize,
}

enum Notice<K> {
    Added(K),
    Updated(K),
    Removed(K, RemoveReason),
    Cleared,
}

/// Side effects an operation collects while locks are held, applied after they are released.
struct OpContext<K> {
    notices: Vec<Notice<K>>,
    evict: bool,
}

impl<K> Default for OpContext<K> {
    fn default() -> Self {
        Self {
            notices: vec![],
            evict: false,
        }
    }
}

struct CacheInner<K>
where
    K: Key,
{
    name: String,

    partitioning: Box<dyn PartitioningStrategy<K>>,
    buckets: BucketTable<K>,
    logs: OperationLogManager<K>,
    store: Store<K>,
    indexing: Box<dyn IndexingStrategy<K>>,

    policy: Option<Mutex<Box<dyn EvictionPolicy<K>>>>,
    eviction_mode: EvictionMode,
    evictor: Evictor,

    expiration: Arc<dyn ExpirationIndex<K>>,
    notifications: Option<PollNotificationManager<K>>,
    listener: Option<Arc<dyn EventListener<Key = K>>>,

    metrics: Arc<Metrics>,

    cache_full: AtomicBool,
    closed: AtomicBool,
}

impl<K> CacheInner<K>
where
    K: Key,
{
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed());
        }
        Ok(())
    }

    fn bucket(&self, key: &K) -> BucketId {
        self.partitioning.bucket(key)
    }

    fn check_range(&self, bucket: BucketId) -> Result<()> {
        let count = self.buckets.bucket_count();
        if bucket >= count {
            return Err(Error::invariant("bucket out of range")
                .with_context("bucket", bucket)
                .with_context("bucket_count", count));
        }
        Ok(())
    }

    fn check_owned(&self, states: &[BucketState], bucket: BucketId) -> Result<BucketState> {
        let state = states.get(bucket as usize).copied().unwrap_or_default();
        if state.is_owned() {
            Ok(state)
        } else {
            self.metrics.cache_rejected.increase(1);
            Err(Error::bucket_not_owned(bucket))
        }
    }

    fn is_served(states: &[BucketState], bucket: BucketId) -> bool {
        states.get(bucket as usize).is_some_and(|state| state.is_owned())
    }

    fn with_states<F, R>(&self, held: Option<&[BucketState]>, f: F) -> R
    where
        F: FnOnce(&[BucketState]) -> R,
    {
        match held {
            Some(states) => f(states),
            None => {
                let states = self.buckets.read();
                f(&states)
            }
        }
    }

    fn normalize_hint(&self, entry: &mut Entry<K>) {
        if let Some(policy) = &self.policy {
            let hint = policy.lock().compatible_hint(entry.eviction_hint());
            entry.set_eviction_hint(hint);
        }
    }

    fn check_preconditions(entry: &Entry<K>, options: &WriteOptions, now: Instant) -> Result<()> {
        match &options.lock {
            LockAccess::Release(lock_id) | LockAccess::Keep(lock_id) if !entry.compare_lock(lock_id, now) => {
                return Err(Error::item_locked());
            }
            _ => {}
        }
        if let Some(expected) = options.expected_version {
            if entry.version() != expected {
                return Err(Error::version_mismatch(expected, entry.version()));
            }
        }
        Ok(())
    }

    /// Validate an insert against the entry it replaces and carry over the metadata that survives it.
    ///
    /// Internal writes carry state already validated elsewhere, so they may change the group of the key.
    fn prepare_insert(
        old: Option<&Entry<K>>,
        new: &mut Entry<K>,
        options: &WriteOptions,
        origin: OpOrigin,
        now: Instant,
    ) -> Result<()> {
        match old {
            Some(old) => {
                Self::check_preconditions(old, options, now)?;
                if origin.is_user() && !GroupInfo::is_compatible(old.group(), new.group()) {
                    return Err(Error::incompatible_group());
                }
                if let LockAccess::Keep(_) = options.lock {
                    new.set_lock(old.lock(now).cloned());
                }
                *new.dependents_mut() = old.dependents().to_vec();
            }
            None => {
                if let Some(expected) = options.expected_version {
                    return Err(Error::version_mismatch(expected, 0));
                }
            }
        }
        match options.lock {
            LockAccess::PreserveVersion(version) => new.set_version(version),
            _ => new.update_version(old),
        }
        Ok(())
    }

    /// Decide a user write of a deferred bucket against the logged state of the key and log it instead of applying it.
    fn log_deferred<F, R>(&self, bucket: BucketId, key: K, stored: Option<Entry<K>>, f: F) -> Result<R>
    where
        F: FnOnce(Option<&Entry<K>>) -> Result<(Option<(Option<Entry<K>>, OpKind)>, R)>,
    {
        let mut logged = false;
        let res = self.logs.log_checked(bucket, key, stored, |current| {
            let (op, res) = f(current)?;
            logged = op.is_some();
            Ok((op, res))
        });
        strict_assert!(res.is_some(), "bucket {bucket} is deferred without a log");
        let res = res.ok_or_else(|| {
            Error::invariant("deferred bucket without a log").with_context("bucket", bucket)
        })??;
        if logged {
            self.metrics.cache_logged.increase(1);
        }
        Ok(res)
    }

    /// Bookkeeping of a write, run under the shard lock of the key.
    #[expect(clippy::too_many_arguments)]
    fn commit_write(
        &self,
        bucket: BucketId,
        state: BucketState,
        origin: OpOrigin,
        kind: OpKind,
        key: &K,
        old: Option<&Entry<K>>,
        new: &Entry<K>,
        now: Instant,
    ) {
        match old {
            Some(old) => {
                self.buckets.record_resize(bucket, old.size(), new.size());
                self.indexing.on_updated(key, old, new);
            }
            None => {
                self.buckets.record_add(bucket, key, new.size());
                self.indexing.on_added(key, new);
            }
        }
        self.expiration.update_index(key, new, now);
        if state.log_mode() == Some(LogMode::Mirrored) && origin != OpOrigin::Internal {
            self.logs.log_operation(bucket, key.clone(), Some(new.clone()), kind);
            self.metrics.cache_logged.increase(1);
        }
    }

    /// Bookkeeping of a removal, run under the shard lock of the key.
    fn commit_remove(&self, bucket: BucketId, state: BucketState, origin: OpOrigin, key: &K, old: &Entry<K>) {
        self.buckets.record_remove(bucket, key, old.size());
        self.indexing.on_removed(key, old);
        self.expiration.remove_from_index(key);
        if state.log_mode() == Some(LogMode::Mirrored) && origin != OpOrigin::Internal {
            self.logs.log_operation(bucket, key.clone(), None, OpKind::Delete);
            self.metrics.cache_logged.increase(1);
        }
    }

    fn cache_full(&self, required: usize) -> Error {
        if !self.cache_full.swap(true, Ordering::Relaxed) {
            tracing::error!(
                "[cache]: cache {} is full, usage: {}, capacity: {}",
                self.name,
                self.store.usage(),
                self.store.capacity()
            );
        }
        Error::not_enough_space(self.store.capacity(), self.store.usage(), required)
    }

    /// Decide what a write short of space does next. Returns true if it should retry.
    fn retry_after_eviction(&self, states: &[BucketState], retries: &mut usize, ctx: &mut OpContext<K>) -> bool {
        if self.policy.is_none() {
            return false;
        }
        match self.eviction_mode {
            EvictionMode::Sync if *retries < SYNC_EVICTION_RETRIES => {
                *retries += 1;
                self.evict_pass(Some(states), ctx);
                true
            }
            EvictionMode::Sync => false,
            EvictionMode::Async => {
                ctx.evict = true;
                false
            }
        }
    }

    fn near_eviction(&self, states: &[BucketState], ctx: &mut OpContext<K>) {
        match self.eviction_mode {
            EvictionMode::Sync => {
                self.evict_pass(Some(states), ctx);
            }
            EvictionMode::Async => ctx.evict = true,
        }
    }

    fn register_dependencies(&self, key: &K, parents: &[K]) {
        for parent in parents.iter().filter(|parent| *parent != key) {
            self.store.update(parent, |entry| {
                if !entry.dependents().contains(key) {
                    entry.dependents_mut().push(key.clone());
                }
            });
        }
    }

    fn unregister_dependencies(&self, key: &K, parents: &[K]) {
        for parent in parents.iter().filter(|parent| *parent != key) {
            self.store.update(parent, |entry| entry.dependents_mut().retain(|dependent| dependent != key));
        }
    }

    #[expect(clippy::too_many_arguments)]
    fn after_write(
        &self,
        kind: OpKind,
        key: &K,
        old: Option<&Entry<K>>,
        new: &Entry<K>,
        options: &WriteOptions,
        origin: OpOrigin,
        ctx: &mut OpContext<K>,
    ) {
        if let Some(policy) = &self.policy {
            policy
                .lock()
                .notify(key, old.and_then(Entry::eviction_hint), new.eviction_hint());
        }
        if let Some(old) = old {
            self.unregister_dependencies(key, old.depends_on());
        }
        self.register_dependencies(key, new.depends_on());

        match old {
            Some(_) => {
                if origin.is_user() {
                    if let Some(notifications) = &self.notifications {
                        notifications.key_updated(key, options.client_id.as_deref());
                    }
                }
                self.metrics.cache_overwrite.increase(1);
                ctx.notices.push(Notice::Updated(key.clone()));
            }
            None => {
                match kind {
                    OpKind::Add => self.metrics.cache_add.increase(1),
                    _ => self.metrics.cache_insert.increase(1),
                }
                ctx.notices.push(Notice::Added(key.clone()));
            }
        }
    }

    fn add(
        &self,
        states: &[BucketState],
        key: K,
        mut entry: Entry<K>,
        options: &WriteOptions,
        origin: OpOrigin,
        ctx: &mut OpContext<K>,
    ) -> Result<AddResult> {
        let bucket = self.bucket(&key);
        let state = self.check_owned(states, bucket)?;
        self.normalize_hint(&mut entry);
        let now = Instant::now();

        match options.lock {
            LockAccess::PreserveVersion(version) => entry.set_version(version),
            _ => entry.update_version(None),
        }

        if origin.is_user() && state.log_mode() == Some(LogMode::Deferred) {
            let stored = self.store.get(&key);
            return self.log_deferred(bucket, key, stored, |current| match current {
                Some(_) => Err(Error::key_exists()),
                None => Ok((Some((Some(entry), OpKind::Add)), AddResult::Success)),
            });
        }

        let internal = !origin.is_user() || matches!(options.lock, LockAccess::PreserveVersion(_));

        let mut retries = 0;
        let result = loop {
            let result = self.store.add_with(key.clone(), entry.clone(), internal, |new| {
                self.commit_write(bucket, state, origin, OpKind::Add, &key, None, new, now)
            });
            match result {
                AddResult::KeyExists => return Err(Error::key_exists()),
                AddResult::NotEnoughSpace => {
                    if !self.retry_after_eviction(states, &mut retries, ctx) {
                        return Err(self.cache_full(entry.size()));
                    }
                }
                result => break result,
            }
        };

        self.after_write(OpKind::Add, &key, None, &entry, options, origin, ctx);
        if result == AddResult::SuccessNearEviction {
            self.near_eviction(states, ctx);
        }
        Ok(result.settled())
    }

    fn insert(
        &self,
        states: &[BucketState],
        key: K,
        mut entry: Entry<K>,
        options: &WriteOptions,
        origin: OpOrigin,
        ctx: &mut OpContext<K>,
    ) -> Result<InsertResult> {
        let bucket = self.bucket(&key);
        let state = self.check_owned(states, bucket)?;
        self.normalize_hint(&mut entry);
        let now = Instant::now();

        if origin.is_user() && state.log_mode() == Some(LogMode::Deferred) {
            let stored = self.store.get(&key);
            return self.log_deferred(bucket, key, stored, |current| {
                Self::prepare_insert(current, &mut entry, options, origin, now)?;
                let result = match current {
                    Some(_) => InsertResult::SuccessOverwrite,
                    None => InsertResult::Success,
                };
                Ok((Some((Some(entry), OpKind::Insert)), result))
            });
        }

        let internal = !origin.is_user() || matches!(options.lock, LockAccess::PreserveVersion(_));
        let mut retries = 0;
        let (result, old, stored) = loop {
            let mut stored = None;
            let (result, old) = self.store.insert_with(
                key.clone(),
                entry.clone(),
                internal,
                |old, new| Self::prepare_insert(old, new, options, origin, now),
                |old, new| {
                    self.commit_write(bucket, state, origin, OpKind::Insert, &key, old, new, now);
                    stored = Some(new.clone());
                },
            )?;
            match (result, stored) {
                (InsertResult::NotEnoughSpace, _) => {
                    if !self.retry_after_eviction(states, &mut retries, ctx) {
                        return Err(self.cache_full(entry.size()));
                    }
                }
                (result, Some(stored)) => break (result, old, stored),
                (_, None) => return Err(Error::invariant("insert stored an entry without committing it")),
            }
        };

        self.after_write(OpKind::Insert, &key, old.as_ref(), &stored, options, origin, ctx);
        if result.is_near_eviction() {
            self.near_eviction(states, ctx);
        }
        Ok(result.settled())
    }

    fn remove(
        &self,
        states: &[BucketState],
        key: &K,
        options: &WriteOptions,
        origin: OpOrigin,
        reason: RemoveReason,
        ctx: &mut OpContext<K>,
    ) -> Result<Option<Entry<K>>> {
        let bucket = self.bucket(key);
        let state = self.check_owned(states, bucket)?;
        let now = Instant::now();

        if state.log_mode() == Some(LogMode::Deferred) {
            match origin {
                OpOrigin::User => {
                    let stored = self.store.get(key);
                    return self.log_deferred(bucket, key.clone(), stored, |current| match current {
                        Some(current) => {
                            Self::check_preconditions(current, options, now)?;
                            Ok((Some((None, OpKind::Delete)), Some(current.clone())))
                        }
                        None => Ok((None, None)),
                    });
                }
                OpOrigin::Internal => {}
                // The bucket content is frozen until the log is replayed.
                _ => return Ok(None),
            }
        }

        self.remove_entry(states, bucket, state, key, options, origin, reason, now, ctx)
    }

    /// Remove without an ownership check.
    #[expect(clippy::too_many_arguments)]
    fn remove_entry(
        &self,
        states: &[BucketState],
        bucket: BucketId,
        state: BucketState,
        key: &K,
        options: &WriteOptions,
        origin: OpOrigin,
        reason: RemoveReason,
        now: Instant,
        ctx: &mut OpContext<K>,
    ) -> Result<Option<Entry<K>>> {
        let removed = self.store.remove_with(
            key,
            |current| Self::check_preconditions(current, options, now),
            |old| self.commit_remove(bucket, state, origin, key, old),
        )?;
        let Some(old) = removed else {
            return Ok(None);
        };

        if let Some(policy) = &self.policy {
            policy.lock().notify(key, old.eviction_hint(), None);
        }
        self.unregister_dependencies(key, old.depends_on());
        if let Some(notifications) = &self.notifications {
            notifications.key_removed(key, options.client_id.as_deref(), origin.is_user());
        }
        self.cache_full.store(false, Ordering::Relaxed);
        self.metrics.cache_remove.increase(1);
        if origin == OpOrigin::Expiration {
            self.metrics.cache_expire.increase(1);
        }
        ctx.notices.push(Notice::Removed(key.clone(), reason));

        if reason != RemoveReason::BucketRemoved {
            for dependent in old.dependents().iter().filter(|dependent| *dependent != key) {
                match self.remove(
                    states,
                    dependent,
                    &WriteOptions::default(),
                    OpOrigin::Dependency,
                    RemoveReason::DependencyChanged,
                    ctx,
                ) {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::BucketNotOwned => {
                        tracing::trace!("[cache]: skip dependent {dependent:?} in a bucket not owned");
                    }
                    Err(e) => tracing::warn!("[cache]: failed to remove dependent {dependent:?}: {e}"),
                }
            }
        }

        Ok(Some(old))
    }

    fn get(&self, states: &[BucketState], key: &K, ctx: &mut OpContext<K>) -> Result<Option<Entry<K>>> {
        let bucket = self.bucket(key);
        self.check_owned(states, bucket)?;

        let Some(entry) = self.store.get(key) else {
            self.metrics.cache_miss.increase(1);
            return Ok(None);
        };
        let now = Instant::now();
        if self.expiration.check_expired(key, &entry, now) {
            self.remove(
                states,
                key,
                &WriteOptions::default(),
                OpOrigin::Expiration,
                RemoveReason::Expired,
                ctx,
            )?;
            self.metrics.cache_miss.increase(1);
            return Ok(None);
        }
        self.expiration.update_index(key, &entry, now);
        if let Some(policy) = &self.policy {
            policy.lock().access(key);
        }
        self.metrics.cache_hit.increase(1);
        Ok(Some(entry))
    }

    /// Run one eviction pass. `held` is the state table when the caller already shares it.
    fn evict_pass(&self, held: Option<&[BucketState]>, ctx: &mut OpContext<K>) -> usize {
        let Some(policy) = &self.policy else {
            return 0;
        };
        let Some(_pass) = self.evictor.try_begin_pass() else {
            return 0;
        };

        let start = Instant::now();
        let ratio = policy.lock().evict_ratio();
        let size_to_free = (self.store.usage() as f64 * ratio).ceil() as usize;
        if size_to_free == 0 {
            return 0;
        }

        let candidates = self.with_states(held, |states| {
            let mut weigh = |key: &K| match states.get(self.bucket(key) as usize) {
                Some(BucketState::Owned | BucketState::Transferring(LogMode::Mirrored)) => self.store.entry_size(key),
                _ => None,
            };
            policy.lock().candidates(size_to_free, &mut weigh)
        });

        let mut evicted = 0;
        for batch in candidates.chunks(EVICTION_BATCH) {
            self.with_states(held, |states| {
                for key in batch {
                    match self.remove(
                        states,
                        key,
                        &WriteOptions::default(),
                        OpOrigin::Eviction,
                        RemoveReason::Evicted,
                        ctx,
                    ) {
                        Ok(Some(_)) => evicted += 1,
                        Ok(None) => {}
                        Err(e) => tracing::debug!("[evictor]: skip victim {key:?}: {e}"),
                    }
                }
            });
        }

        let elapsed = start.elapsed();
        self.metrics.cache_evict.increase(evicted as u64);
        self.metrics.cache_evict_duration.record(elapsed.as_secs_f64());
        tracing::debug!(
            "[evictor]: cache {} evicted {evicted} entries to free {size_to_free} bytes in {elapsed:?}",
            self.name
        );
        evicted
    }

    fn dispatch(&self, notices: Vec<Notice<K>>) {
        let Some(listener) = &self.listener else {
            return;
        };
        for notice in notices.iter() {
            let event = match notice {
                Notice::Added(key) => CacheEvent::ItemAdded { key },
                Notice::Updated(key) => CacheEvent::ItemUpdated { key },
                Notice::Removed(key, reason) => CacheEvent::ItemRemoved { key, reason: *reason },
                Notice::Cleared => CacheEvent::CacheCleared,
            };
            listener.on_event(event);
        }
    }

    fn record_usage(&self) {
        self.metrics.cache_usage.absolute(self.store.usage() as u64);
        self.metrics.cache_entries.absolute(self.store.count() as u64);
    }

    /// Apply the side effects of an operation. Locks must have been released.
    fn finish(self: &Arc<Self>, ctx: OpContext<K>) {
        self.record_usage();
        if ctx.evict {
            self.schedule_eviction();
        }
        self.dispatch(ctx.notices);
    }

    fn schedule_eviction(self: &Arc<Self>) {
        if self.policy.is_none() || self.closed.load(Ordering::Acquire) || !self.evictor.try_schedule() {
            return;
        }
        let weak = Arc::downgrade(self);
        let spawned = self
            .evictor
            .spawn(format!("{}-evictor", self.name), move || Self::background_pass(weak));
        if let Err(e) = spawned {
            self.evictor.finish_schedule();
            tracing::warn!("[evictor]: failed to spawn background pass: {e}");
        }
    }

    fn background_pass(weak: Weak<Self>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            inner.evictor.finish_schedule();
            return;
        }
        let mut ctx = OpContext::default();
        inner.evict_pass(None, &mut ctx);
        inner.evictor.finish_schedule();
        inner.record_usage();
        inner.dispatch(ctx.notices);
    }

    /// Drop every key of the bucket and disown it. The state table must be held exclusively.
    fn remove_bucket(&self, states: &mut [BucketState], bucket: BucketId, ctx: &mut OpContext<K>) -> usize {
        let keys = self.buckets.keys(bucket);
        let now = Instant::now();
        let mut removed = 0;
        for key in keys.iter() {
            match self.remove_entry(
                states,
                bucket,
                BucketState::Owned,
                key,
                &WriteOptions::default(),
                OpOrigin::Internal,
                RemoveReason::BucketRemoved,
                now,
                ctx,
            ) {
                Ok(Some(_)) => removed += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("[bucket]: failed to remove {key:?} of bucket {bucket}: {e}"),
            }
        }
        self.logs.remove_logger(bucket);
        self.buckets.clear_bucket(bucket);
        states[bucket as usize] = BucketState::NotOwned;
        tracing::info!("[bucket]: cache {} removed bucket {bucket} with {removed} keys", self.name);
        removed
    }

    fn replay(
        &self,
        states: &[BucketState],
        bucket: BucketId,
        changes: ChangeSet<K>,
        stats: &mut ReplayStats,
        ctx: &mut OpContext<K>,
    ) {
        let options = WriteOptions::default();
        for key in changes.removed {
            match self.remove(states, &key, &options, OpOrigin::Internal, RemoveReason::Removed, ctx) {
                Ok(_) => stats.removed += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!("[oplog]: failed to replay delete of {key:?} in bucket {bucket}: {e}");
                }
            }
        }
        for (key, entry) in changes.updated {
            let options = WriteOptions::preserve_version(entry.version());
            match self.insert(states, key.clone(), entry, &options, OpOrigin::Internal, ctx) {
                Ok(_) => stats.updated += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!("[oplog]: failed to replay write of {key:?} in bucket {bucket}: {e}");
                }
            }
        }
    }

    fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(notifications) = &self.notifications {
            notifications.stop();
        }
        self.evictor.join();

        let _states = self.buckets.write();
        self.logs.clear();
        self.buckets.clear();
        self.store.clear();
        self.indexing.clear();
        if let Some(policy) = &self.policy {
            policy.lock().clear();
        }
        self.expiration.clear();
        tracing::info!("[cache]: cache {} disposed", self.name);
    }
}

impl<K> Drop for CacheInner<K>
where
    K: Key,
{
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Builder of a [`PartitionedCache`].
pub struct PartitionedCacheBuilder<K>
where
    K: Key,
{
    config: CacheConfig,
    listener: Option<Arc<dyn EventListener<Key = K>>>,
    expiration: Option<Arc<dyn ExpirationIndex<K>>>,
    registry: Option<BoxedRegistry>,
}

impl<K> PartitionedCacheBuilder<K>
where
    K: Key,
{
    /// Start from the default config with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self::from_config(CacheConfig {
            capacity,
            ..Default::default()
        })
    }

    /// Start from a config.
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            listener: None,
            expiration: None,
            registry: None,
        }
    }

    /// Set the name, used as metrics label and in thread names.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Cap the entry count.
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.config.max_count = Some(max_count);
        self
    }

    /// Set the store shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    /// Set the bucket count. 0 disables partitioning.
    pub fn with_bucket_count(mut self, bucket_count: u32) -> Self {
        self.config.bucket_count = bucket_count;
        self
    }

    /// Set the backlog below which draining a mirrored log finishes a transfer.
    pub fn with_stop_logging_threshold(mut self, threshold: usize) -> Self {
        self.config.stop_logging_threshold = threshold;
        self
    }

    /// Enable or disable the group index.
    pub fn with_indexing(mut self, indexing: bool) -> Self {
        self.config.indexing = indexing;
        self
    }

    /// Set the eviction config.
    pub fn with_eviction_config(mut self, eviction: EvictionConfig) -> Self {
        self.config.eviction = eviction;
        self
    }

    /// Enable client notifications.
    pub fn with_notification_config(mut self, notification: NotificationConfig) -> Self {
        self.config.notification = Some(notification);
        self
    }

    /// Set the event listener.
    pub fn with_event_listener(mut self, listener: Arc<dyn EventListener<Key = K>>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Replace the default deadline based expiration.
    pub fn with_expiration(mut self, expiration: Arc<dyn ExpirationIndex<K>>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Set the metrics registry. The noop registry is used if none is set.
    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the cache.
    pub fn build(self) -> Result<PartitionedCache<K>> {
        let config = self.config;
        config.validate()?;

        let partitioning: Box<dyn PartitioningStrategy<K>> = match config.bucket_count {
            0 => Box::new(NoPartitioning),
            count => Box::new(HashedPartitioning::new(count)),
        };
        let initial = if partitioning.initially_owned() {
            BucketState::Owned
        } else {
            BucketState::NotOwned
        };
        let buckets = BucketTable::new(partitioning.bucket_count(), initial);

        let policy = match config.eviction.enabled {
            true => Some(Mutex::new(config.eviction.policy.build(config.eviction.evict_ratio)?)),
            false => None,
        };
        let store = Store::new(
            StoreConfig {
                capacity: config.capacity,
                max_count: config.max_count,
                shards: config.shards,
                eviction_enabled: policy.is_some(),
            },
            BucketHashBuilder::default(),
        );
        let indexing: Box<dyn IndexingStrategy<K>> = match config.indexing {
            true => Box::new(GroupIndexing::default()),
            false => Box::new(NoIndexing::default()),
        };
        let expiration = self
            .expiration
            .unwrap_or_else(|| Arc::new(TtlExpiration::default()));
        let metrics = Arc::new(match &self.registry {
            Some(registry) => Metrics::new(&config.name, &**registry),
            None => Metrics::new(&config.name, &NoopMetricsRegistry),
        });
        let notifications = config
            .notification
            .as_ref()
            .map(|notification| PollNotificationManager::new(notification, self.listener.clone()));

        let inner = Arc::new(CacheInner {
            name: config.name.clone(),
            partitioning,
            buckets,
            logs: OperationLogManager::new(config.stop_logging_threshold),
            store,
            indexing,
            policy,
            eviction_mode: config.eviction.mode,
            evictor: Evictor::default(),
            expiration,
            notifications,
            listener: self.listener,
            metrics,
            cache_full: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        if let Some(notifications) = &inner.notifications {
            notifications.start(&inner.name).map_err(|e| {
                Error::new(ErrorKind::External, "failed to spawn the notification poller").with_source(e)
            })?;
        }

        tracing::info!(
            "[cache]: cache {} built with {} buckets, capacity: {}",
            inner.name,
            inner.buckets.bucket_count(),
            inner.store.capacity()
        );

        Ok(PartitionedCache { inner })
    }
}

/// An in-memory cache whose keys are partitioned into buckets a cluster rebalancer moves between nodes.
///
/// Key operations are served only for owned buckets. A bucket being handed over logs its operations, either
/// instead of applying them ([`LogMode::Deferred`], while this node receives the bucket) or next to applying them
/// ([`LogMode::Mirrored`], while this node sends it).
///
/// Cloning is cheap and shares the cache.
pub struct PartitionedCache<K>
where
    K: Key,
{
    inner: Arc<CacheInner<K>>,
}

impl<K> Clone for PartitionedCache<K>
where
    K: Key,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Debug for PartitionedCache<K>
where
    K: Key,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedCache")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.store.capacity())
            .field("usage", &self.inner.store.usage())
            .field("count", &self.inner.store.count())
            .field("buckets", &self.inner.buckets.bucket_count())
            .finish()
    }
}

impl<K> PartitionedCache<K>
where
    K: Key,
{
    fn with_op<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CacheInner<K>, &[BucketState], &mut OpContext<K>) -> Result<R>,
    {
        self.inner.ensure_open()?;
        let mut ctx = OpContext::default();
        let res = {
            let states = self.inner.buckets.read();
            f(&self.inner, &states, &mut ctx)
        };
        self.inner.finish(ctx);
        res
    }

    fn with_transition<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CacheInner<K>, &mut [BucketState], &mut OpContext<K>) -> Result<R>,
    {
        self.inner.ensure_open()?;
        let mut ctx = OpContext::default();
        let res = {
            let mut states = self.inner.buckets.write();
            f(&self.inner, &mut states, &mut ctx)
        };
        self.inner.finish(ctx);
        res
    }

    /// Name of the cache.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a new key. Fails with [`ErrorKind::KeyExists`] if present.
    pub fn add(&self, key: K, entry: Entry<K>) -> Result<AddResult> {
        self.add_with(key, entry, &WriteOptions::default())
    }

    /// Add a new key with write options.
    pub fn add_with(&self, key: K, entry: Entry<K>, options: &WriteOptions) -> Result<AddResult> {
        self.with_op(|inner, states, ctx| inner.add(states, key, entry, options, OpOrigin::User, ctx))
    }

    /// Insert a key, replacing any existing entry.
    pub fn insert(&self, key: K, entry: Entry<K>) -> Result<InsertResult> {
        self.insert_with(key, entry, &WriteOptions::default())
    }

    /// Insert a key with write options.
    pub fn insert_with(&self, key: K, entry: Entry<K>, options: &WriteOptions) -> Result<InsertResult> {
        self.with_op(|inner, states, ctx| inner.insert(states, key, entry, options, OpOrigin::User, ctx))
    }

    /// Insert on behalf of state transfer or replication.
    ///
    /// The write is applied even in a deferred bucket, may use the extra accommodation, and is never mirrored.
    pub fn insert_internal(&self, key: K, entry: Entry<K>, options: &WriteOptions) -> Result<InsertResult> {
        self.with_op(|inner, states, ctx| inner.insert(states, key, entry, options, OpOrigin::Internal, ctx))
    }

    /// Remove a key, returning its entry.
    pub fn remove(&self, key: &K) -> Result<Option<Entry<K>>> {
        self.remove_with(key, &WriteOptions::default())
    }

    /// Remove a key with write options.
    ///
    /// In a deferred bucket the removal is only logged and the entry still stored is returned.
    pub fn remove_with(&self, key: &K, options: &WriteOptions) -> Result<Option<Entry<K>>> {
        self.with_op(|inner, states, ctx| {
            inner.remove(states, key, options, OpOrigin::User, RemoveReason::Removed, ctx)
        })
    }

    /// Remove on behalf of state transfer or replication.
    pub fn remove_internal(&self, key: &K) -> Result<Option<Entry<K>>> {
        self.with_op(|inner, states, ctx| {
            inner.remove(
                states,
                key,
                &WriteOptions::default(),
                OpOrigin::Internal,
                RemoveReason::Removed,
                ctx,
            )
        })
    }

    /// Get a clone of the entry. An expired entry is removed and reported as a miss.
    pub fn get(&self, key: &K) -> Result<Option<Entry<K>>> {
        self.with_op(|inner, states, ctx| inner.get(states, key, ctx))
    }

    /// Whether the key is stored.
    pub fn contains(&self, key: &K) -> Result<bool> {
        self.with_op(|inner, states, _| {
            inner.check_owned(states, inner.bucket(key))?;
            Ok(inner.store.contains(key))
        })
    }

    /// Entries of all keys in owned buckets. Keys in other buckets are skipped.
    pub fn get_bulk(&self, keys: &[K]) -> Result<Vec<(K, Entry<K>)>> {
        self.with_op(|inner, states, ctx| {
            let mut found = Vec::with_capacity(keys.len());
            for key in keys {
                if !CacheInner::<K>::is_served(states, inner.bucket(key)) {
                    continue;
                }
                if let Some(entry) = inner.get(states, key, ctx)? {
                    found.push((key.clone(), entry));
                }
            }
            Ok(found)
        })
    }

    /// Entries of owned buckets accepted by the predicate. Expired entries are skipped.
    ///
    /// The predicate runs under shard locks and must not call back into the cache.
    pub fn search<F>(&self, mut predicate: F) -> Result<Vec<(K, Entry<K>)>>
    where
        F: FnMut(&K, &Entry<K>) -> bool,
    {
        self.with_op(|inner, states, _| {
            let now = Instant::now();
            let mut found = vec![];
            inner.store.for_each(|key, entry| {
                if CacheInner::<K>::is_served(states, inner.bucket(key))
                    && !inner.expiration.check_expired(key, entry, now)
                    && predicate(key, entry)
                {
                    found.push((key.clone(), entry.clone()));
                }
            });
            Ok(found)
        })
    }

    /// Lock the entry with `lock_id`. Taking a lock already held with the same id refreshes it.
    pub fn lock(&self, key: &K, lock_id: &str, timeout: Option<Duration>) -> Result<LockOutcome> {
        self.with_op(|inner, states, _| {
            inner.check_owned(states, inner.bucket(key))?;
            let now = Instant::now();
            let outcome = inner.store.update(key, |entry| match entry.lock(now) {
                Some(held) if held.lock_id != lock_id => LockOutcome::HeldBy(held.clone()),
                _ => {
                    let lock = LockInfo::new(lock_id, timeout);
                    entry.set_lock(Some(lock.clone()));
                    LockOutcome::Acquired(lock)
                }
            });
            Ok(outcome.unwrap_or(LockOutcome::Missing))
        })
    }

    /// Release the lock held with `lock_id`. Returns false if the entry is missing or not locked.
    pub fn unlock(&self, key: &K, lock_id: &str) -> Result<bool> {
        self.with_op(|inner, states, _| {
            inner.check_owned(states, inner.bucket(key))?;
            let now = Instant::now();
            let released = inner.store.update(key, |entry| {
                let holder = entry.lock(now).map(|lock| lock.lock_id.clone());
                match holder {
                    Some(holder) if holder == lock_id => {
                        entry.take_lock();
                        Ok(true)
                    }
                    Some(_) => Err(Error::item_locked()),
                    None => {
                        // Drop a lapsed lock if any.
                        entry.take_lock();
                        Ok(false)
                    }
                }
            });
            released.unwrap_or(Ok(false))
        })
    }

    /// Keys of the group, or only of the sub-group if one is named.
    pub fn get_group_keys(&self, group: &str, sub_group: Option<&str>) -> Vec<K> {
        self.inner.indexing.group_keys(group, sub_group)
    }

    /// Entries of the group, or only of the sub-group if one is named.
    pub fn get_group_data(&self, group: &str, sub_group: Option<&str>) -> Result<Vec<(K, Entry<K>)>> {
        let keys = self.get_group_keys(group, sub_group);
        self.get_bulk(&keys)
    }

    /// Remove the group, or only the sub-group if one is named. Returns the count of removed keys.
    pub fn remove_group(&self, group: &str, sub_group: Option<&str>) -> Result<usize> {
        let keys = self.get_group_keys(group, sub_group);
        self.with_op(|inner, states, ctx| {
            let options = WriteOptions::default();
            let mut removed = 0;
            for key in keys.iter() {
                match inner.remove(states, key, &options, OpOrigin::User, RemoveReason::Removed, ctx) {
                    Ok(Some(_)) => removed += 1,
                    Ok(None) => {}
                    Err(e) if e.kind() == ErrorKind::BucketNotOwned => {}
                    Err(e) => tracing::warn!("[cache]: failed to remove {key:?} of group {group}: {e}"),
                }
            }
            Ok(removed)
        })
    }

    /// Whether the group has members.
    pub fn group_exists(&self, group: &str) -> bool {
        self.inner.indexing.group_exists(group)
    }

    /// Whether the key is indexed under the group, and under the sub-group if one is named.
    pub fn key_exists_in_group(&self, key: &K, group: &str, sub_group: Option<&str>) -> bool {
        self.inner.indexing.key_exists(key, group, sub_group)
    }

    /// Estimated bytes held by the group index.
    pub fn group_index_size(&self) -> usize {
        self.inner.indexing.in_memory_size()
    }

    /// Remove every entry whose deadline passed. Returns the count of removed entries.
    pub fn expire_now(&self) -> Result<usize> {
        self.with_op(|inner, states, ctx| {
            let options = WriteOptions::default();
            let mut expired = 0;
            for key in inner.expiration.expired_keys(Instant::now()) {
                match inner.remove(states, &key, &options, OpOrigin::Expiration, RemoveReason::Expired, ctx) {
                    Ok(Some(_)) => expired += 1,
                    Ok(None) => {
                        if !inner.store.contains(&key) {
                            inner.expiration.remove_from_index(&key);
                        }
                    }
                    Err(e) => tracing::debug!("[cache]: skip expiring {key:?}: {e}"),
                }
            }
            if expired > 0 {
                tracing::debug!("[cache]: cache {} expired {expired} entries", inner.name);
            }
            Ok(expired)
        })
    }

    /// Run one eviction pass on the calling thread. Returns the count of evicted entries.
    pub fn evict_now(&self) -> Result<usize> {
        self.with_op(|inner, states, ctx| Ok(inner.evict_pass(Some(states), ctx)))
    }

    /// Drop every entry, index and log. Transferring buckets fall back to owned.
    pub fn clear(&self) -> Result<()> {
        self.with_transition(|inner, states, ctx| {
            inner.store.clear();
            inner.buckets.clear();
            inner.indexing.clear();
            if let Some(policy) = &inner.policy {
                policy.lock().clear();
            }
            inner.expiration.clear();
            inner.logs.clear();
            for state in states.iter_mut().filter(|state| state.log_mode().is_some()) {
                *state = BucketState::Owned;
            }
            if let Some(notifications) = &inner.notifications {
                notifications.clear_cache(true);
            }
            inner.cache_full.store(false, Ordering::Relaxed);
            ctx.notices.push(Notice::Cleared);
            tracing::info!("[cache]: cache {} cleared", inner.name);
            Ok(())
        })
    }

    /// Stop background threads and drop everything. Later operations fail with [`ErrorKind::Closed`].
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether the cache has been disposed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Take ownership of the buckets. Already owned buckets keep their state.
    pub fn update_owned_buckets(&self, buckets: &[BucketId]) -> Result<()> {
        self.with_transition(|inner, states, _| {
            for bucket in buckets.iter() {
                inner.check_range(*bucket)?;
            }
            let mut assigned = 0;
            for bucket in buckets.iter() {
                let state = &mut states[*bucket as usize];
                if !state.is_owned() {
                    *state = BucketState::Owned;
                    assigned += 1;
                }
            }
            tracing::debug!("[bucket]: cache {} assigned {assigned} buckets", inner.name);
            Ok(())
        })
    }

    /// Start logging operations of an owned bucket that is being handed over.
    pub fn start_bucket_transfer(&self, bucket: BucketId, mode: LogMode) -> Result<()> {
        self.with_transition(|inner, states, _| {
            inner.check_range(bucket)?;
            inner.check_owned(states, bucket)?;
            inner.logs.start_logging(bucket, mode);
            states[bucket as usize] = BucketState::Transferring(mode);
            tracing::debug!("[bucket]: cache {} started {mode:?} transfer of bucket {bucket}", inner.name);
            Ok(())
        })
    }

    /// Keys of an owned bucket.
    ///
    /// With `start_logging`, mirrored logging starts under the same exclusive section, so every later change of
    /// the bucket is either in the returned list or in the log.
    pub fn get_key_list(&self, bucket: BucketId, start_logging: bool) -> Result<Vec<K>> {
        if !start_logging {
            return self.with_op(|inner, states, _| {
                inner.check_range(bucket)?;
                inner.check_owned(states, bucket)?;
                Ok(inner.buckets.keys(bucket))
            });
        }
        self.with_transition(|inner, states, _| {
            inner.check_range(bucket)?;
            let state = inner.check_owned(states, bucket)?;
            let keys = inner.buckets.keys(bucket);
            if state == BucketState::Owned {
                inner.logs.start_logging(bucket, LogMode::Mirrored);
                states[bucket as usize] = BucketState::Transferring(LogMode::Mirrored);
            }
            Ok(keys)
        })
    }

    /// Drain the mirrored logs of the buckets.
    ///
    /// If the drained backlog is below the stop-logging threshold, logging stops and the buckets settle.
    pub fn get_log_table(&self, buckets: &[BucketId]) -> Result<LogTable<K>> {
        self.with_transition(|inner, states, _| {
            for bucket in buckets.iter() {
                inner.check_range(*bucket)?;
            }
            let mirrored = buckets
                .iter()
                .copied()
                .filter(|bucket| states[*bucket as usize].log_mode() == Some(LogMode::Mirrored))
                .collect_vec();
            let table = inner.logs.get_log_table(&mirrored);
            if table.logging_stopped {
                for bucket in mirrored.iter() {
                    states[*bucket as usize] = BucketState::Owned;
                }
                tracing::debug!("[oplog]: cache {} stopped logging of buckets {mirrored:?}", inner.name);
            }
            Ok(table)
        })
    }

    /// Replay the deferred logs of the buckets into the store and settle them.
    pub fn add_logged_data(&self, buckets: &[BucketId]) -> Result<ReplayStats> {
        self.with_transition(|inner, states, ctx| {
            for bucket in buckets.iter() {
                inner.check_range(*bucket)?;
            }
            let mut stats = ReplayStats::default();
            for bucket in buckets.iter().copied() {
                if states[bucket as usize].log_mode() != Some(LogMode::Deferred) {
                    continue;
                }
                let changes = inner.logs.drain(bucket).unwrap_or_default();
                let replayed = changes.len();
                inner.replay(states, bucket, changes, &mut stats, ctx);
                inner.logs.remove_logger(bucket);
                states[bucket as usize] = BucketState::Owned;
                inner.metrics.cache_replayed.increase(replayed as u64);
                tracing::debug!("[oplog]: cache {} replayed {replayed} changes of bucket {bucket}", inner.name);
            }
            Ok(stats)
        })
    }

    /// Stop logging for the buckets, returning whatever was still logged. The buckets settle.
    pub fn stop_logging(&self, buckets: &[BucketId]) -> Result<ChangeSet<K>> {
        self.with_transition(|inner, states, _| {
            for bucket in buckets.iter() {
                inner.check_range(*bucket)?;
            }
            let mut changes = ChangeSet::default();
            for bucket in buckets.iter().copied() {
                if let Some(drained) = inner.logs.stop_logging(bucket) {
                    changes.merge(drained);
                }
                let state = &mut states[bucket as usize];
                if state.log_mode().is_some() {
                    *state = BucketState::Owned;
                }
            }
            Ok(changes)
        })
    }

    /// Whether the bucket logs in the given mode.
    pub fn is_logging_enabled(&self, bucket: BucketId, mode: LogMode) -> bool {
        self.inner.logs.is_logging_enabled(bucket, mode)
    }

    /// Mark state transfer of the bucket into this node as prepared.
    pub fn prepare_bucket_for_state_transfer(&self, bucket: BucketId) -> Result<()> {
        self.with_transition(|inner, _, _| {
            inner.check_range(bucket)?;
            inner.buckets.set_transfer_started(bucket, true);
            Ok(())
        })
    }

    /// Drop every key of the bucket and disown it. Returns the count of removed keys.
    pub fn remove_bucket(&self, bucket: BucketId) -> Result<usize> {
        self.with_transition(|inner, states, ctx| {
            inner.check_range(bucket)?;
            Ok(inner.remove_bucket(states, bucket, ctx))
        })
    }

    /// Remove every owned bucket not in `my_buckets`. Returns the removed buckets.
    pub fn remove_extra_buckets(&self, my_buckets: &[BucketId]) -> Result<Vec<BucketId>> {
        let keep: HashSet<BucketId> = my_buckets.iter().copied().collect();
        self.with_transition(|inner, states, ctx| {
            let extra = (0..inner.buckets.bucket_count())
                .filter(|bucket| states[*bucket as usize].is_owned() && !keep.contains(bucket))
                .collect_vec();
            for bucket in extra.iter() {
                inner.remove_bucket(states, *bucket, ctx);
            }
            Ok(extra)
        })
    }

    /// State of the bucket. Out of range buckets are reported not owned.
    pub fn bucket_state(&self, bucket: BucketId) -> BucketState {
        self.inner.buckets.state(bucket)
    }

    /// Accounting of the bucket.
    pub fn bucket_stats(&self, bucket: BucketId) -> BucketStatsSnapshot {
        if bucket >= self.inner.buckets.bucket_count() {
            return BucketStatsSnapshot::default();
        }
        self.inner.buckets.snapshot(bucket)
    }

    /// Owned buckets, ascending.
    pub fn owned_buckets(&self) -> Vec<BucketId> {
        let states = self.inner.buckets.read();
        states
            .iter()
            .enumerate()
            .filter(|(_, state)| state.is_owned())
            .map(|(bucket, _)| bucket as BucketId)
            .collect()
    }

    /// Bucket of the key.
    pub fn bucket_of(&self, key: &K) -> BucketId {
        self.inner.bucket(key)
    }

    /// Count of buckets.
    pub fn bucket_count(&self) -> u32 {
        self.inner.buckets.bucket_count()
    }

    /// Account a message of the topic in the bucket of its id.
    pub fn track_message(&self, topic: &str, message_id: &str, size: usize) -> Result<()> {
        self.with_op(|inner, states, _| {
            let bucket = inner.partitioning.message_bucket(message_id);
            inner.check_owned(states, bucket)?;
            inner.buckets.track_message(bucket, topic, size);
            Ok(())
        })
    }

    /// Undo [`Self::track_message`].
    pub fn untrack_message(&self, topic: &str, message_id: &str, size: usize) -> Result<()> {
        self.with_op(|inner, states, _| {
            let bucket = inner.partitioning.message_bucket(message_id);
            inner.check_owned(states, bucket)?;
            inner.buckets.untrack_message(bucket, topic, size);
            Ok(())
        })
    }

    /// Drop the counters of the topic from every bucket.
    pub fn remove_topic(&self, topic: &str) {
        self.inner.buckets.remove_topic(topic);
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.store.capacity()
    }

    /// Bytes held.
    pub fn usage(&self) -> usize {
        self.inner.store.usage()
    }

    /// Entries held.
    pub fn count(&self) -> usize {
        self.inner.store.count()
    }

    /// Estimated bytes held by the per-bucket key lists.
    pub fn key_list_size(&self) -> usize {
        self.inner.buckets.key_list_size()
    }

    /// Client notifications, if enabled.
    pub fn notifications(&self) -> Option<&PollNotificationManager<K>> {
        self.inner.notifications.as_ref()
    }

    /// Metrics of the cache.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use bucketcache_common::event::NoopEventListener;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::{
        entry::Priority,
        eviction::PolicyConfig,
        notification::Interest,
        test_utils::{keys_in_bucket, RecordedEvent, RecordingListener},
    };

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<PartitionedCache<String>>();
        is_send_sync_static::<PartitionedCache<u64>>();
    }

    fn standalone(capacity: usize) -> PartitionedCache<String> {
        PartitionedCacheBuilder::new(capacity)
            .with_bucket_count(0)
            .with_eviction_config(EvictionConfig {
                mode: EvictionMode::Sync,
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    fn partitioned(capacity: usize, buckets: u32) -> PartitionedCache<String> {
        PartitionedCacheBuilder::new(capacity)
            .with_bucket_count(buckets)
            .with_eviction_config(EvictionConfig {
                mode: EvictionMode::Sync,
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    fn payload(size: usize) -> Entry<String> {
        Entry::new(vec![0u8; size])
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test_log::test]
    fn test_not_owned_rejected() {
        let cache = partitioned(1 << 20, 16);
        let k = key("k");
        let err = cache.insert(k.clone(), payload(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BucketNotOwned);
        assert_eq!(cache.get(&k).unwrap_err().kind(), ErrorKind::BucketNotOwned);
        assert_eq!(cache.remove(&k).unwrap_err().kind(), ErrorKind::BucketNotOwned);

        cache.update_owned_buckets(&[cache.bucket_of(&k)]).unwrap();
        assert_eq!(cache.insert(k.clone(), payload(1)).unwrap(), InsertResult::Success);
        assert_eq!(cache.owned_buckets(), vec![cache.bucket_of(&k)]);
    }

    #[test]
    fn test_update_owned_buckets_out_of_range() {
        let cache = partitioned(1 << 20, 16);
        let err = cache.update_owned_buckets(&[1, 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
        // Validation runs before any change.
        assert!(cache.owned_buckets().is_empty());
    }

    #[test_log::test]
    fn test_add_insert_remove() {
        let cache = standalone(1 << 20);
        let k = key("k");
        assert_eq!(cache.add(k.clone(), payload(10)).unwrap(), AddResult::Success);
        assert_eq!(cache.add(k.clone(), payload(10)).unwrap_err().kind(), ErrorKind::KeyExists);
        assert_eq!(cache.insert(k.clone(), payload(20)).unwrap(), InsertResult::SuccessOverwrite);

        let entry = cache.get(&k).unwrap().unwrap();
        assert_eq!(entry.size(), 20);
        assert_eq!(entry.version(), 2);
        assert_eq!(cache.usage(), 20);
        assert_eq!(cache.bucket_stats(0).size, 20);

        assert_eq!(cache.remove(&k).unwrap().unwrap().size(), 20);
        assert_eq!(cache.remove(&k).unwrap(), None);
        assert_eq!(cache.usage(), 0);
        assert_eq!(cache.bucket_stats(0), BucketStatsSnapshot::default());
    }

    #[test]
    fn test_versions() {
        let cache = standalone(1 << 20);
        let k = key("k");
        cache.insert(k.clone(), payload(1)).unwrap();

        let err = cache
            .insert_with(k.clone(), payload(1), &WriteOptions::default().with_expected_version(5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        cache
            .insert_with(k.clone(), payload(1), &WriteOptions::default().with_expected_version(1))
            .unwrap();
        assert_eq!(cache.get(&k).unwrap().unwrap().version(), 2);

        cache
            .insert_with(k.clone(), payload(1), &WriteOptions::preserve_version(42))
            .unwrap();
        assert_eq!(cache.get(&k).unwrap().unwrap().version(), 42);

        let missing = key("missing");
        let err = cache
            .insert_with(missing, payload(1), &WriteOptions::default().with_expected_version(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }

    #[test]
    fn test_locks() {
        let cache = standalone(1 << 20);
        let k = key("k");
        assert_eq!(cache.lock(&k, "a", None).unwrap(), LockOutcome::Missing);
        cache.insert(k.clone(), payload(1)).unwrap();

        assert!(matches!(cache.lock(&k, "a", None).unwrap(), LockOutcome::Acquired(_)));
        assert!(matches!(cache.lock(&k, "b", None).unwrap(), LockOutcome::HeldBy(lock) if lock.lock_id == "a"));

        let err = cache
            .insert_with(k.clone(), payload(2), &WriteOptions::release("b"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ItemLocked);

        cache.insert_with(k.clone(), payload(2), &WriteOptions::keep("a")).unwrap();
        assert!(cache.get(&k).unwrap().unwrap().compare_lock("a", Instant::now()));
        assert!(!cache.get(&k).unwrap().unwrap().compare_lock("b", Instant::now()));

        assert_eq!(cache.unlock(&k, "b").unwrap_err().kind(), ErrorKind::ItemLocked);
        assert!(cache.unlock(&k, "a").unwrap());
        assert!(!cache.unlock(&k, "a").unwrap());

        cache.lock(&k, "a", None).unwrap();
        assert_eq!(
            cache.remove_with(&k, &WriteOptions::release("b")).unwrap_err().kind(),
            ErrorKind::ItemLocked
        );
        assert!(cache.remove_with(&k, &WriteOptions::release("a")).unwrap().is_some());
    }

    #[test]
    fn test_lock_lapses() {
        let cache = standalone(1 << 20);
        let k = key("k");
        cache.insert(k.clone(), payload(1)).unwrap();
        cache.lock(&k, "a", Some(Duration::ZERO)).unwrap();
        assert!(matches!(cache.lock(&k, "b", None).unwrap(), LockOutcome::Acquired(_)));
    }

    #[test]
    fn test_groups() {
        let cache = standalone(1 << 20);
        cache
            .insert(key("a1"), payload(1).with_group("a", Some("x")))
            .unwrap();
        cache
            .insert(key("a2"), payload(1).with_group("a", Some("y")))
            .unwrap();
        cache.insert(key("b1"), payload(1).with_group("b", None)).unwrap();

        assert_eq!(cache.get_group_keys("a", None).into_iter().sorted().collect_vec(), vec![
            key("a1"),
            key("a2")
        ]);
        assert_eq!(cache.get_group_data("a", Some("x")).unwrap().len(), 1);
        assert!(cache.key_exists_in_group(&key("a1"), "a", None));
        assert!(cache.key_exists_in_group(&key("a1"), " a ", Some("x")));
        assert!(!cache.key_exists_in_group(&key("a1"), "a", Some("y")));
        assert!(!cache.key_exists_in_group(&key("b1"), "a", None));

        let err = cache
            .insert(key("a1"), payload(1).with_group("b", None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleGroup);
        // A different sub-group of the same group is fine.
        cache
            .insert(key("a1"), payload(1).with_group("a", Some("y")))
            .unwrap();
        assert_eq!(cache.get_group_keys("a", Some("y")).len(), 2);

        assert_eq!(cache.remove_group("a", None).unwrap(), 2);
        assert!(!cache.group_exists("a"));
        assert!(cache.group_exists("b"));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_group_membership_without_indexing() {
        let cache = PartitionedCacheBuilder::<String>::new(1 << 20)
            .with_bucket_count(0)
            .with_indexing(false)
            .build()
            .unwrap();
        cache.insert(key("a1"), payload(1).with_group("a", None)).unwrap();
        assert!(cache.get(&key("a1")).unwrap().is_some());
        assert!(!cache.key_exists_in_group(&key("a1"), "a", None));
    }

    #[test]
    fn test_dependencies_cascade() {
        let listener = Arc::new(RecordingListener::default());
        let cache = PartitionedCacheBuilder::<String>::new(1 << 20)
            .with_bucket_count(0)
            .with_event_listener(listener.clone())
            .build()
            .unwrap();
        cache.insert(key("parent"), payload(1)).unwrap();
        cache
            .insert(key("child"), payload(1).with_dependencies([key("parent")]))
            .unwrap();
        cache
            .insert(key("grandchild"), payload(1).with_dependencies([key("child")]))
            .unwrap();
        assert_eq!(cache.get(&key("parent")).unwrap().unwrap().dependents(), &[key("child")]);

        // Overwriting the parent keeps its dependents.
        cache.insert(key("parent"), payload(2)).unwrap();
        listener.take();

        cache.remove(&key("parent")).unwrap();
        assert_eq!(cache.count(), 0);
        assert_eq!(listener.take(), vec![
            RecordedEvent::Removed(key("parent"), RemoveReason::Removed),
            RecordedEvent::Removed(key("child"), RemoveReason::DependencyChanged),
            RecordedEvent::Removed(key("grandchild"), RemoveReason::DependencyChanged),
        ]);
    }

    #[test]
    fn test_events() {
        let listener = Arc::new(RecordingListener::default());
        let cache = PartitionedCacheBuilder::<String>::new(1 << 20)
            .with_bucket_count(0)
            .with_event_listener(listener.clone())
            .build()
            .unwrap();
        cache.insert(key("k"), payload(1)).unwrap();
        cache.insert(key("k"), payload(1)).unwrap();
        cache.remove(&key("k")).unwrap();
        cache.clear().unwrap();
        assert_eq!(listener.take(), vec![
            RecordedEvent::Added(key("k")),
            RecordedEvent::Updated(key("k")),
            RecordedEvent::Removed(key("k"), RemoveReason::Removed),
            RecordedEvent::Cleared,
        ]);
    }

    #[test]
    fn test_expiration() {
        let cache = standalone(1 << 20);
        cache
            .insert(key("gone"), payload(1).with_ttl(Duration::ZERO))
            .unwrap();
        cache
            .insert(key("later"), payload(1).with_ttl(Duration::from_secs(3600)))
            .unwrap();
        cache
            .insert(key("idle"), payload(1).with_sliding_expiration(Duration::ZERO))
            .unwrap();

        assert_eq!(cache.get(&key("gone")).unwrap(), None);
        assert_eq!(cache.count(), 2);
        assert_eq!(cache.expire_now().unwrap(), 1);
        assert_eq!(cache.count(), 1);
        assert!(cache.get(&key("later")).unwrap().is_some());
    }

    #[test]
    fn test_search_and_bulk() {
        let cache = partitioned(1 << 20, 8);
        cache.update_owned_buckets(&[0, 1, 2, 3]).unwrap();
        let owned = (0..4).flat_map(|bucket| keys_in_bucket(8, bucket, 2)).collect_vec();
        for k in owned.iter() {
            cache.insert(k.clone(), payload(4)).unwrap();
        }
        let foreign = keys_in_bucket(8, 5, 1).remove(0);

        let mut request = owned.clone();
        request.push(foreign);
        assert_eq!(cache.get_bulk(&request).unwrap().len(), owned.len());

        let found = cache.search(|_, entry| entry.size() == 4).unwrap();
        assert_eq!(found.len(), owned.len());
    }

    #[test_log::test]
    fn test_sync_eviction() {
        let cache = standalone(1000);
        for i in 0..20 {
            cache.insert(format!("k{i}"), payload(100)).unwrap();
        }
        assert!(cache.usage() <= cache.capacity() + cache.capacity() / 5);
        assert!(cache.count() < 20);
    }

    #[test]
    fn test_not_removable_fills_up() {
        let cache = standalone(1000);
        let mut res = Ok(InsertResult::Success);
        for i in 0..20 {
            res = cache.insert(format!("k{i}"), payload(100).with_priority(Priority::NotRemovable));
            if res.is_err() {
                break;
            }
        }
        assert_eq!(res.unwrap_err().kind(), ErrorKind::NotEnoughSpace);
        // Removal clears the full flag and frees space.
        cache.remove(&key("k0")).unwrap();
        cache.insert(key("k0"), payload(100).with_priority(Priority::NotRemovable)).unwrap();
    }

    #[test]
    fn test_async_eviction() {
        let cache = PartitionedCacheBuilder::<String>::new(1000)
            .with_bucket_count(0)
            .with_eviction_config(EvictionConfig {
                mode: EvictionMode::Async,
                policy: PolicyConfig::Lru,
                ..Default::default()
            })
            .build()
            .unwrap();
        for i in 0..30 {
            let _ = cache.insert(format!("k{i}"), payload(100));
            // Give the background pass a chance.
            while cache.inner.evictor.is_scheduled() {
                thread::yield_now();
            }
        }
        assert!(cache.usage() <= cache.capacity() + cache.capacity() / 5);
        assert!(cache.count() < 30);
        cache.inner.evictor.join();
    }

    #[test]
    fn test_deferred_transfer() {
        let cache = partitioned(1 << 20, 16);
        let k = keys_in_bucket(16, 5, 1).remove(0);
        cache.update_owned_buckets(&[5]).unwrap();
        cache.insert(k.clone(), payload(100)).unwrap();
        assert_eq!(cache.bucket_stats(5).size, 100);

        cache.start_bucket_transfer(5, LogMode::Deferred).unwrap();
        assert!(cache.is_logging_enabled(5, LogMode::Deferred));
        assert_eq!(cache.insert(k.clone(), payload(120)).unwrap(), InsertResult::SuccessOverwrite);
        // The write is only logged.
        assert_eq!(cache.get(&k).unwrap().unwrap().size(), 100);
        assert_eq!(cache.bucket_stats(5).size, 100);

        let stats = cache.add_logged_data(&[5]).unwrap();
        assert_eq!(stats, ReplayStats {
            removed: 0,
            updated: 1,
            failed: 0
        });
        assert_eq!(cache.bucket_state(5), BucketState::Owned);
        assert!(!cache.is_logging_enabled(5, LogMode::Deferred));
        let entry = cache.get(&k).unwrap().unwrap();
        assert_eq!(entry.size(), 120);
        assert_eq!(entry.version(), 2);
        assert_eq!(cache.bucket_stats(5).size, 120);
    }

    #[test]
    fn test_deferred_remove_returns_current() {
        let cache = partitioned(1 << 20, 16);
        let k = keys_in_bucket(16, 3, 1).remove(0);
        cache.update_owned_buckets(&[3]).unwrap();
        cache.insert(k.clone(), payload(10)).unwrap();
        cache.start_bucket_transfer(3, LogMode::Deferred).unwrap();

        assert_eq!(cache.remove(&k).unwrap().unwrap().size(), 10);
        assert!(cache.contains(&k).unwrap());
        // Already removed in the log.
        assert_eq!(cache.remove(&k).unwrap(), None);
        assert_eq!(cache.inner.logs.backlog(3), 1);
        let stats = cache.add_logged_data(&[3]).unwrap();
        assert_eq!(stats.removed, 1);
        assert!(!cache.contains(&k).unwrap());
    }

    #[test_log::test]
    fn test_deferred_writes_see_logged_state() {
        let cache = partitioned(1 << 20, 16);
        let keys = keys_in_bucket(16, 5, 3);
        let (readd, regroup, versioned) = (keys[0].clone(), keys[1].clone(), keys[2].clone());
        cache.update_owned_buckets(&[5]).unwrap();
        cache.insert(readd.clone(), payload(10)).unwrap();
        cache.insert(regroup.clone(), payload(10).with_group("a", None)).unwrap();
        cache.insert(versioned.clone(), payload(10)).unwrap();
        cache.start_bucket_transfer(5, LogMode::Deferred).unwrap();

        // Removed in the log, so the key is free to add again.
        cache.remove(&readd).unwrap();
        assert_eq!(cache.add(readd.clone(), payload(20)).unwrap(), AddResult::Success);
        assert_eq!(cache.add(readd.clone(), payload(30)).unwrap_err().kind(), ErrorKind::KeyExists);

        // Removed in the log, so the group may change.
        cache.remove(&regroup).unwrap();
        assert_eq!(
            cache.insert(regroup.clone(), payload(20).with_group("b", None)).unwrap(),
            InsertResult::Success
        );
        let err = cache
            .insert(regroup.clone(), payload(20).with_group("a", None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleGroup);

        // Versions continue from the logged write.
        cache.insert(versioned.clone(), payload(20)).unwrap();
        let err = cache
            .insert_with(versioned.clone(), payload(30), &WriteOptions::default().with_expected_version(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        cache
            .insert_with(versioned.clone(), payload(30), &WriteOptions::default().with_expected_version(2))
            .unwrap();

        let stats = cache.add_logged_data(&[5]).unwrap();
        assert_eq!(stats.failed, 0);
        let readd = cache.get(&readd).unwrap().unwrap();
        assert_eq!((readd.size(), readd.version()), (20, 1));
        let regroup_entry = cache.get(&regroup).unwrap().unwrap();
        assert_eq!(regroup_entry.group().map(|info| info.group.as_str()), Some("b"));
        assert!(cache.key_exists_in_group(&regroup, "b", None));
        assert!(!cache.key_exists_in_group(&regroup, "a", None));
        let versioned = cache.get(&versioned).unwrap().unwrap();
        assert_eq!((versioned.size(), versioned.version()), (30, 3));
    }

    #[test]
    fn test_mirrored_transfer() {
        let cache = partitioned(1 << 20, 16);
        let keys = keys_in_bucket(16, 7, 3);
        cache.update_owned_buckets(&[7]).unwrap();
        cache.insert(keys[0].clone(), payload(1)).unwrap();

        let listed = cache.get_key_list(7, true).unwrap();
        assert_eq!(listed, vec![keys[0].clone()]);
        assert_eq!(cache.bucket_state(7), BucketState::Transferring(LogMode::Mirrored));

        cache.insert(keys[1].clone(), payload(1)).unwrap();
        cache.insert(keys[2].clone(), payload(1)).unwrap();
        cache.remove(&keys[2]).unwrap();
        // Applied as well as logged.
        assert!(cache.contains(&keys[1]).unwrap());

        let table = cache.get_log_table(&[7]).unwrap();
        assert!(table.logging_stopped);
        assert_eq!(table.change_set.updated.len(), 1);
        assert_eq!(table.change_set.updated[0].0, keys[1]);
        assert_eq!(table.change_set.removed, vec![keys[2].clone()]);
        assert_eq!(cache.bucket_state(7), BucketState::Owned);
    }

    #[test]
    fn test_mirrored_backlog_keeps_logging() {
        let cache = PartitionedCacheBuilder::<String>::new(1 << 20)
            .with_bucket_count(16)
            .with_stop_logging_threshold(2)
            .build()
            .unwrap();
        let keys = keys_in_bucket(16, 2, 4);
        cache.update_owned_buckets(&[2]).unwrap();
        cache.get_key_list(2, true).unwrap();
        for k in keys.iter() {
            cache.insert(k.clone(), payload(1)).unwrap();
        }
        let table = cache.get_log_table(&[2]).unwrap();
        assert!(!table.logging_stopped);
        assert_eq!(table.change_set.len(), 4);
        assert!(cache.is_logging_enabled(2, LogMode::Mirrored));

        let rest = cache.stop_logging(&[2]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(cache.bucket_state(2), BucketState::Owned);
    }

    #[test]
    fn test_remove_bucket() {
        let listener = Arc::new(RecordingListener::default());
        let cache = PartitionedCacheBuilder::<String>::new(1 << 20)
            .with_bucket_count(16)
            .with_event_listener(listener.clone())
            .build()
            .unwrap();
        cache.update_owned_buckets(&[1, 2]).unwrap();
        let parent = keys_in_bucket(16, 1, 1).remove(0);
        let child = keys_in_bucket(16, 2, 1).remove(0);
        cache.insert(parent.clone(), payload(5)).unwrap();
        cache
            .insert(child.clone(), payload(5).with_dependencies([parent.clone()]))
            .unwrap();
        listener.take();

        assert_eq!(cache.remove_bucket(1).unwrap(), 1);
        assert_eq!(cache.bucket_state(1), BucketState::NotOwned);
        assert_eq!(cache.bucket_stats(1), BucketStatsSnapshot::default());
        // No cascade for handed over buckets.
        assert!(cache.contains(&child).unwrap());
        assert_eq!(listener.take(), vec![RecordedEvent::Removed(parent, RemoveReason::BucketRemoved)]);

        assert_eq!(cache.remove_extra_buckets(&[]).unwrap(), vec![2]);
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn test_topics() {
        let cache = partitioned(1 << 20, 4);
        cache.update_owned_buckets(&[0, 1, 2, 3]).unwrap();
        cache.track_message("orders", "m1", 10).unwrap();
        cache.track_message("orders", "m2", 10).unwrap();
        let total: usize = (0..4)
            .flat_map(|bucket| cache.bucket_stats(bucket).topics)
            .map(|(_, stats)| stats.size)
            .sum();
        assert_eq!(total, 20);

        cache.remove_topic("orders");
        assert!((0..4).all(|bucket| cache.bucket_stats(bucket).topics.is_empty()));
    }

    #[test]
    fn test_prepare_state_transfer() {
        let cache = partitioned(1 << 20, 4);
        cache.prepare_bucket_for_state_transfer(2).unwrap();
        assert!(cache.bucket_stats(2).state_transfer_started);
        assert_eq!(
            cache.prepare_bucket_for_state_transfer(4).unwrap_err().kind(),
            ErrorKind::Invariant
        );
    }

    #[test]
    fn test_notifications() {
        let cache = PartitionedCacheBuilder::<String>::new(1 << 20)
            .with_bucket_count(0)
            .with_notification_config(NotificationConfig {
                poll_interval_ms: 10,
                ..Default::default()
            })
            .build()
            .unwrap();
        let notifications = cache.notifications().unwrap();
        cache.insert(key("k"), payload(1)).unwrap();
        notifications.register_key("c1", key("k"), Interest::all());

        cache
            .insert_with(key("k"), payload(1), &WriteOptions::default().with_client_id("c2"))
            .unwrap();
        let polled = notifications.poll("c1");
        assert_eq!(polled.updated, vec![key("k")]);

        cache.remove(&key("k")).unwrap();
        let polled = notifications.poll("c1");
        assert_eq!(polled.removed, vec![key("k")]);
    }

    #[test]
    fn test_dispose() {
        let cache = standalone(1 << 20);
        cache.insert(key("k"), payload(1)).unwrap();
        let clone = cache.clone();
        cache.dispose();
        assert!(clone.is_closed());
        assert_eq!(clone.get(&key("k")).unwrap_err().kind(), ErrorKind::Closed);
        assert_eq!(clone.usage(), 0);
        // Idempotent.
        clone.dispose();
    }

    #[test]
    fn test_noop_listener() {
        let cache = PartitionedCacheBuilder::<u64>::new(1 << 20)
            .with_bucket_count(0)
            .with_event_listener(Arc::new(NoopEventListener::default()))
            .build()
            .unwrap();
        cache.insert(1, Entry::new(vec![0u8; 1])).unwrap();
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_concurrent_accounting() {
        const THREADS: usize = 4;
        const OPS: usize = 2000;

        let cache = PartitionedCacheBuilder::<String>::new(64 * 1024)
            .with_bucket_count(8)
            .with_eviction_config(EvictionConfig {
                mode: EvictionMode::Sync,
                ..Default::default()
            })
            .build()
            .unwrap();
        cache.update_owned_buckets(&(0..8).collect_vec()).unwrap();

        let handles = (0..THREADS)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(t as u64);
                    for _ in 0..OPS {
                        let k = format!("k{}", rng.random_range(0..500));
                        match rng.random_range(0..10) {
                            0..5 => {
                                let _ = cache.insert(k, Entry::new(vec![0u8; rng.random_range(1..512)]));
                            }
                            5..7 => {
                                let _ = cache.remove(&k);
                            }
                            _ => {
                                let _ = cache.get(&k);
                            }
                        }
                    }
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().unwrap();
        }

        let (size, count) = (0..8)
            .map(|bucket| cache.bucket_stats(bucket))
            .fold((0, 0), |(size, count), stats| (size + stats.size, count + stats.count));
        assert_eq!(size, cache.usage());
        assert_eq!(count, cache.count());
    }
}
