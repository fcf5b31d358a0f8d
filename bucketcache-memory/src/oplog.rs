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

//! Per-bucket operation logs kept while a bucket is mid-transfer.

use std::time::Instant;

use bucketcache_common::{bucket::BucketId, code::Key, strict_assert};
use hashbrown::HashMap;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};

use crate::entry::Entry;

/// Default backlog below which draining a log finalizes the transfer.
pub const DEFAULT_STOP_LOGGING_THRESHOLD: usize = 50;

/// How mutating operations on a transferring bucket are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogMode {
    /// Log before the actual operation: user writes are only recorded and the store is held static until the log is
    /// replayed.
    Deferred,
    /// Log before and after the actual operation: writes are applied to the store and mirrored into the log.
    Mirrored,
}

/// Kind of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Add of a new key.
    Add,
    /// Insert or overwrite.
    Insert,
    /// Remove.
    Delete,
}

/// One logged operation.
#[derive(Debug, Clone)]
pub struct OperationLogEntry<K> {
    /// Nanoseconds since the manager was created. Strictly increasing within a log.
    pub timestamp: u64,
    /// The key.
    pub key: K,
    /// Snapshot of the written entry, none for deletes.
    pub entry: Option<Entry<K>>,
    /// The operation.
    pub kind: OpKind,
}

/// Append-only log of one bucket.
#[derive(Debug)]
pub struct OperationLog<K> {
    mode: LogMode,
    entries: Vec<OperationLogEntry<K>>,
    /// Index of the last operation of every logged key.
    latest: HashMap<K, usize>,
    last_timestamp: u64,
}

impl<K> OperationLog<K>
where
    K: Key,
{
    fn new(mode: LogMode) -> Self {
        Self {
            mode,
            entries: vec![],
            latest: HashMap::new(),
            last_timestamp: 0,
        }
    }

    /// The log mode.
    pub fn mode(&self) -> LogMode {
        self.mode
    }

    /// Count of logged operations, including superseded ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Logged operations in program order.
    pub fn entries(&self) -> &[OperationLogEntry<K>] {
        &self.entries
    }

    /// The last logged operation on the key: `Some(None)` for a delete, `None` if the key is not logged.
    pub fn latest(&self, key: &K) -> Option<Option<&Entry<K>>> {
        self.latest
            .get(key)
            .map(|index| self.entries[*index].entry.as_ref())
    }

    fn append(&mut self, timestamp: u64, key: K, entry: Option<Entry<K>>, kind: OpKind) {
        let timestamp = timestamp.max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        self.latest.insert(key.clone(), self.entries.len());
        self.entries.push(OperationLogEntry {
            timestamp,
            key,
            entry,
            kind,
        });
    }

    fn drain(&mut self) -> ChangeSet<K> {
        self.latest.clear();
        ChangeSet::collapse(std::mem::take(&mut self.entries))
    }
}

/// The net effect of a log: the last operation of every key, split into removals and upserts.
///
/// Each key appears at most once, in the order of its last operation.
#[derive(Debug, Clone)]
pub struct ChangeSet<K> {
    /// Keys whose last operation was a delete.
    pub removed: Vec<K>,
    /// Keys whose last operation was an add or insert, with the written entry.
    pub updated: Vec<(K, Entry<K>)>,
}

impl<K> Default for ChangeSet<K> {
    fn default() -> Self {
        Self {
            removed: vec![],
            updated: vec![],
        }
    }
}

impl<K> ChangeSet<K>
where
    K: Key,
{
    fn collapse(entries: Vec<OperationLogEntry<K>>) -> Self {
        let mut last: HashMap<K, (usize, OperationLogEntry<K>)> = HashMap::with_capacity(entries.len());
        for (seq, entry) in entries.into_iter().enumerate() {
            last.insert(entry.key.clone(), (seq, entry));
        }

        let mut set = Self::default();
        for (_, op) in last.into_values().sorted_by_key(|(seq, _)| *seq) {
            match (op.kind, op.entry) {
                (OpKind::Delete, _) => set.removed.push(op.key),
                (OpKind::Add | OpKind::Insert, Some(entry)) => set.updated.push((op.key, entry)),
                (OpKind::Add | OpKind::Insert, None) => {
                    strict_assert!(false, "write logged without an entry snapshot");
                }
            }
        }
        set
    }

    /// Count of changed keys.
    pub fn len(&self) -> usize {
        self.removed.len() + self.updated.len()
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append another change set over disjoint keys.
    pub fn merge(&mut self, other: ChangeSet<K>) {
        self.removed.extend(other.removed);
        self.updated.extend(other.updated);
    }
}

/// Result of [`OperationLogManager::get_log_table`].
#[derive(Debug, Clone)]
pub struct LogTable<K> {
    /// Merged changes drained from the requested buckets.
    pub change_set: ChangeSet<K>,
    /// Whether the backlog was small enough that logging stopped for the requested buckets.
    pub logging_stopped: bool,
}

/// Owns the operation logs of all transferring buckets.
///
/// The map lock is taken exclusively only to create or drop a log. Appends take it shared plus the mutex of their
/// bucket log, so buckets log concurrently while each log keeps program order.
#[derive(Debug)]
pub struct OperationLogManager<K> {
    epoch: Instant,
    stop_logging_threshold: usize,
    loggers: RwLock<HashMap<BucketId, Mutex<OperationLog<K>>>>,
}

impl<K> OperationLogManager<K>
where
    K: Key,
{
    /// Create a manager.
    pub fn new(stop_logging_threshold: usize) -> Self {
        Self {
            epoch: Instant::now(),
            stop_logging_threshold,
            loggers: RwLock::new(HashMap::new()),
        }
    }

    /// Backlog below which [`Self::get_log_table`] stops logging.
    pub fn stop_logging_threshold(&self) -> usize {
        self.stop_logging_threshold
    }

    /// Start logging the bucket, or switch the mode of a running log keeping what it holds.
    pub fn start_logging(&self, bucket: BucketId, mode: LogMode) {
        let mut loggers = self.loggers.write();
        match loggers.get_mut(&bucket) {
            Some(log) => log.get_mut().mode = mode,
            None => {
                loggers.insert(bucket, Mutex::new(OperationLog::new(mode)));
            }
        }
        tracing::debug!("[oplog]: start logging bucket {bucket} in {mode:?} mode");
    }

    /// Mode of the log of the bucket, if logging.
    pub fn mode(&self, bucket: BucketId) -> Option<LogMode> {
        self.loggers.read().get(&bucket).map(|log| log.lock().mode)
    }

    /// Whether the bucket is logged in the given mode.
    pub fn is_logging_enabled(&self, bucket: BucketId, mode: LogMode) -> bool {
        self.mode(bucket) == Some(mode)
    }

    /// Buckets being logged.
    pub fn buckets(&self) -> Vec<BucketId> {
        self.loggers.read().keys().copied().sorted().collect()
    }

    /// Count of raw logged operations of the bucket.
    pub fn backlog(&self, bucket: BucketId) -> usize {
        self.loggers.read().get(&bucket).map_or(0, |log| log.lock().len())
    }

    /// Append an operation. Returns false if the bucket is not being logged.
    pub fn log_operation(&self, bucket: BucketId, key: K, entry: Option<Entry<K>>, kind: OpKind) -> bool {
        let timestamp = self.epoch.elapsed().as_nanos() as u64;
        let loggers = self.loggers.read();
        let Some(log) = loggers.get(&bucket) else {
            return false;
        };
        tracing::trace!("[oplog]: log {kind:?} on {key:?} in bucket {bucket}");
        log.lock().append(timestamp, key, entry, kind);
        true
    }

    /// Append an operation decided against the current state of the key.
    ///
    /// `f` sees the entry of the last logged operation on the key, or `stored` if the key is not logged. A logged
    /// delete shows as absent. `f` returns the operation to append, if any, and runs under the log mutex so
    /// concurrent writers of the bucket decide in log order. Returns `None` if the bucket is not being logged.
    pub fn log_checked<F, R, E>(&self, bucket: BucketId, key: K, stored: Option<Entry<K>>, f: F) -> Option<Result<R, E>>
    where
        F: FnOnce(Option<&Entry<K>>) -> Result<(Option<(Option<Entry<K>>, OpKind)>, R), E>,
    {
        let timestamp = self.epoch.elapsed().as_nanos() as u64;
        let loggers = self.loggers.read();
        let mut log = loggers.get(&bucket)?.lock();
        let current = match log.latest(&key) {
            Some(logged) => logged,
            None => stored.as_ref(),
        };
        let (op, res) = match f(current) {
            Ok(decided) => decided,
            Err(e) => return Some(Err(e)),
        };
        if let Some((entry, kind)) = op {
            tracing::trace!("[oplog]: log {kind:?} on {key:?} in bucket {bucket}");
            log.append(timestamp, key, entry, kind);
        }
        Some(Ok(res))
    }

    /// Drain the log of the bucket into a change set. Logging continues.
    pub fn drain(&self, bucket: BucketId) -> Option<ChangeSet<K>> {
        self.loggers.read().get(&bucket).map(|log| log.lock().drain())
    }

    /// Drain the logs of the buckets and merge their change sets.
    ///
    /// If the merged change set is smaller than the stop-logging threshold, logging stops for all the buckets and the
    /// caller is expected to finalize their ownership.
    pub fn get_log_table(&self, buckets: &[BucketId]) -> LogTable<K> {
        let mut change_set = ChangeSet::default();
        for bucket in buckets {
            if let Some(set) = self.drain(*bucket) {
                change_set.merge(set);
            }
        }
        let logging_stopped = change_set.len() < self.stop_logging_threshold;
        if logging_stopped {
            for bucket in buckets {
                self.remove_logger(*bucket);
            }
        }
        tracing::debug!(
            "[oplog]: drained {} changes from buckets {buckets:?}, logging stopped: {logging_stopped}",
            change_set.len()
        );
        LogTable {
            change_set,
            logging_stopped,
        }
    }

    /// Stop logging the bucket, returning what was not drained yet.
    pub fn stop_logging(&self, bucket: BucketId) -> Option<ChangeSet<K>> {
        let log = self.loggers.write().remove(&bucket)?;
        tracing::debug!("[oplog]: stop logging bucket {bucket}");
        Some(log.into_inner().drain())
    }

    /// Drop the log of the bucket without draining it.
    pub fn remove_logger(&self, bucket: BucketId) -> bool {
        self.loggers.write().remove(&bucket).is_some()
    }

    /// Drop every log.
    pub fn clear(&self) {
        let loggers = std::mem::take(&mut *self.loggers.write());
        if !loggers.is_empty() {
            tracing::debug!("[oplog]: dropped logs of {} buckets", loggers.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn entry(size: usize) -> Entry<u64> {
        Entry::new(vec![0u8; size])
    }

    #[test_log::test]
    fn test_last_operation_wins() {
        let manager = OperationLogManager::<u64>::new(DEFAULT_STOP_LOGGING_THRESHOLD);
        manager.start_logging(1, LogMode::Deferred);

        assert!(manager.log_operation(1, 10, Some(entry(1)), OpKind::Add));
        assert!(manager.log_operation(1, 10, None, OpKind::Delete));
        assert!(manager.log_operation(1, 20, None, OpKind::Delete));
        assert!(manager.log_operation(1, 20, Some(entry(2)), OpKind::Insert));
        assert!(manager.log_operation(1, 30, Some(entry(3)), OpKind::Insert));
        assert!(manager.log_operation(1, 30, Some(entry(4)), OpKind::Insert));
        assert_eq!(manager.backlog(1), 6);

        let set = manager.drain(1).unwrap();
        assert_eq!(set.removed, vec![10]);
        assert_eq!(
            set.updated.iter().map(|(k, e)| (*k, e.size())).collect_vec(),
            vec![(20, 2), (30, 4)]
        );
        // Draining keeps logging.
        assert_eq!(manager.backlog(1), 0);
        assert!(manager.is_logging_enabled(1, LogMode::Deferred));
    }

    #[test]
    fn test_log_checked_sees_logged_state() {
        let manager = OperationLogManager::<u64>::new(DEFAULT_STOP_LOGGING_THRESHOLD);
        manager.start_logging(1, LogMode::Deferred);

        let seen = |manager: &OperationLogManager<u64>, stored: Option<Entry<u64>>| {
            manager
                .log_checked(1, 10, stored, |current| Ok::<_, ()>((None, current.map(Entry::size))))
                .unwrap()
                .unwrap()
        };

        // Not logged yet: the stored entry shows through.
        assert_eq!(seen(&manager, Some(entry(5))), Some(5));
        assert_eq!(seen(&manager, None), None);

        manager.log_operation(1, 10, None, OpKind::Delete);
        assert_eq!(seen(&manager, Some(entry(5))), None);

        manager.log_operation(1, 10, Some(entry(7)), OpKind::Add);
        assert_eq!(seen(&manager, Some(entry(5))), Some(7));

        // A rejected decision appends nothing.
        let res = manager.log_checked(1, 10, None, |_| Err::<(Option<(Option<Entry<u64>>, OpKind)>, ()), _>("rejected"));
        assert_eq!(res, Some(Err("rejected")));
        assert_eq!(manager.backlog(1), 2);

        // Draining forgets the logged state.
        manager.drain(1).unwrap();
        assert_eq!(seen(&manager, Some(entry(5))), Some(5));
        assert!(manager.log_checked(2, 10, None, |_| Ok::<_, ()>((None, ()))).is_none());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let manager = OperationLogManager::<u64>::new(DEFAULT_STOP_LOGGING_THRESHOLD);
        manager.start_logging(3, LogMode::Mirrored);
        for i in 0..100 {
            manager.log_operation(3, i, None, OpKind::Delete);
        }
        let loggers = manager.loggers.read();
        let log = loggers.get(&3).unwrap().lock();
        assert!(log.entries().windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_not_logging() {
        let manager = OperationLogManager::<u64>::new(DEFAULT_STOP_LOGGING_THRESHOLD);
        assert!(!manager.log_operation(7, 1, None, OpKind::Delete));
        assert!(manager.drain(7).is_none());
        assert!(manager.stop_logging(7).is_none());
        assert_eq!(manager.mode(7), None);
    }

    #[test_log::test]
    fn test_get_log_table_threshold() {
        let manager = OperationLogManager::<u64>::new(5);
        manager.start_logging(1, LogMode::Mirrored);
        manager.start_logging(2, LogMode::Mirrored);
        for i in 0..3 {
            manager.log_operation(1, i, Some(entry(1)), OpKind::Insert);
            manager.log_operation(2, 100 + i, None, OpKind::Delete);
        }

        // 6 changes, not below 5.
        let table = manager.get_log_table(&[1, 2]);
        assert_eq!(table.change_set.len(), 6);
        assert!(!table.logging_stopped);
        assert!(manager.is_logging_enabled(1, LogMode::Mirrored));

        // The same key written many times collapses to one change.
        for _ in 0..10 {
            manager.log_operation(1, 0, Some(entry(1)), OpKind::Insert);
        }
        let table = manager.get_log_table(&[1, 2]);
        assert_eq!(table.change_set.len(), 1);
        assert!(table.logging_stopped);
        assert_eq!(manager.mode(1), None);
        assert_eq!(manager.mode(2), None);
    }

    #[test]
    fn test_switch_mode_keeps_log() {
        let manager = OperationLogManager::<u64>::new(DEFAULT_STOP_LOGGING_THRESHOLD);
        manager.start_logging(1, LogMode::Deferred);
        manager.log_operation(1, 1, Some(entry(1)), OpKind::Add);
        manager.start_logging(1, LogMode::Mirrored);
        assert!(manager.is_logging_enabled(1, LogMode::Mirrored));
        assert_eq!(manager.stop_logging(1).unwrap().updated.len(), 1);
    }

    #[test]
    fn test_concurrent_buckets() {
        let manager = std::sync::Arc::new(OperationLogManager::<u64>::new(DEFAULT_STOP_LOGGING_THRESHOLD));
        for bucket in 0..4 {
            manager.start_logging(bucket, LogMode::Mirrored);
        }
        let handles = (0..4u32)
            .map(|bucket| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        manager.log_operation(bucket, i, None, OpKind::Delete);
                    }
                })
            })
            .collect_vec();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(manager.buckets(), vec![0, 1, 2, 3]);
        for bucket in 0..4 {
            assert_eq!(manager.backlog(bucket), 1000);
        }
        manager.clear();
        assert!(manager.buckets().is_empty());
    }
}
