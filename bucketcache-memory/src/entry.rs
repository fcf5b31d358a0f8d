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

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Eviction priority requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Evicted first.
    Low,
    /// Evicted after [`Priority::Low`].
    BelowNormal,
    /// The usual priority.
    Normal,
    /// Evicted after [`Priority::Normal`].
    AboveNormal,
    /// Evicted last.
    High,
    /// Never evicted.
    NotRemovable,
    /// Use the priority configured on the eviction policy.
    #[default]
    Default,
}

/// Per-entry eviction metadata, normalized by [`crate::eviction::EvictionPolicy::compatible_hint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hint {
    /// Ranked by priority tier.
    Priority(Priority),
    /// Ranked by recency.
    Recency,
    /// Ranked by access frequency.
    Frequency,
}

/// Time-based expiration of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Expires at a fixed instant.
    Absolute(Instant),
    /// Expires after being idle for the duration.
    Sliding(Duration),
}

/// Lock held on an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Lock handle presented by the holder.
    pub lock_id: String,
    /// When the lock was taken.
    pub acquired_at: Instant,
    /// When the lock lapses, if ever.
    pub expires_at: Option<Instant>,
}

impl LockInfo {
    /// Create a lock taken now.
    pub fn new(lock_id: impl Into<String>, timeout: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            lock_id: lock_id.into(),
            acquired_at: now,
            expires_at: timeout.map(|timeout| now + timeout),
        }
    }

    /// Whether the lock lapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Data group tag of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupInfo {
    /// Group name.
    pub group: String,
    /// Optional sub-group name.
    pub sub_group: Option<String>,
}

impl GroupInfo {
    /// Create a group tag. Names are trimmed and an empty sub-group is treated as none.
    pub fn new(group: impl AsRef<str>, sub_group: Option<&str>) -> Self {
        Self {
            group: group.as_ref().trim().to_string(),
            sub_group: sub_group.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    /// Two tags are compatible if they name the same group. Sub-groups may differ.
    pub fn is_compatible(old: Option<&GroupInfo>, new: Option<&GroupInfo>) -> bool {
        match (old, new) {
            (None, None) => true,
            (Some(old), Some(new)) => old.group == new.group,
            _ => false,
        }
    }
}

/// A stored value plus its metadata.
///
/// The payload is opaque and reference counted, so cloning an entry for the operation log or for a reader never
/// copies bytes, and later writes to the live entry never show through a clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<K> {
    payload: Bytes,
    expiration: Option<Expiration>,
    eviction_hint: Option<Hint>,
    lock: Option<LockInfo>,
    version: u64,
    group: Option<GroupInfo>,
    depends_on: Vec<K>,
    dependents: Vec<K>,
}

impl<K> Entry<K> {
    /// Create an entry with the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            expiration: None,
            eviction_hint: None,
            lock: None,
            version: 0,
            group: None,
            depends_on: vec![],
            dependents: vec![],
        }
    }

    /// Set the eviction priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.eviction_hint = Some(Hint::Priority(priority));
        self
    }

    /// Set an absolute time-to-live from now.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expiration = Some(Expiration::Absolute(Instant::now() + ttl));
        self
    }

    /// Set a sliding idle timeout.
    pub fn with_sliding_expiration(mut self, idle: Duration) -> Self {
        self.expiration = Some(Expiration::Sliding(idle));
        self
    }

    /// Tag the entry with a data group.
    pub fn with_group(mut self, group: impl AsRef<str>, sub_group: Option<&str>) -> Self {
        self.group = Some(GroupInfo::new(group, sub_group));
        self
    }

    /// Make the entry depend on other keys. Removing any of them removes this entry.
    pub fn with_dependencies(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.depends_on.extend(keys);
        self
    }

    /// Set the version. Only honored by version-preserving writes.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// The payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size in bytes accounted for the entry.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The expiration hint.
    pub fn expiration(&self) -> Option<&Expiration> {
        self.expiration.as_ref()
    }

    /// The eviction hint.
    pub fn eviction_hint(&self) -> Option<&Hint> {
        self.eviction_hint.as_ref()
    }

    /// The lock, if any and not lapsed at `now`.
    pub fn lock(&self, now: Instant) -> Option<&LockInfo> {
        self.lock.as_ref().filter(|lock| !lock.is_expired(now))
    }

    /// Whether the entry is locked at `now`.
    pub fn is_locked(&self, now: Instant) -> bool {
        self.lock(now).is_some()
    }

    /// Whether the entry can be written with `lock_id` at `now`.
    pub fn compare_lock(&self, lock_id: &str, now: Instant) -> bool {
        self.lock(now).is_none_or(|lock| lock.lock_id == lock_id)
    }

    /// The version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The data group tag.
    pub fn group(&self) -> Option<&GroupInfo> {
        self.group.as_ref()
    }

    /// Keys this entry depends on.
    pub fn depends_on(&self) -> &[K] {
        &self.depends_on
    }

    /// Keys depending on this entry.
    pub fn dependents(&self) -> &[K] {
        &self.dependents
    }

    pub(crate) fn set_eviction_hint(&mut self, hint: Hint) {
        self.eviction_hint = Some(hint);
    }

    pub(crate) fn set_lock(&mut self, lock: Option<LockInfo>) {
        self.lock = lock;
    }

    pub(crate) fn take_lock(&mut self) -> Option<LockInfo> {
        self.lock.take()
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Continue the version sequence of the entry being replaced.
    pub(crate) fn update_version(&mut self, old: Option<&Entry<K>>) {
        self.version = old.map_or(1, |old| old.version + 1);
    }

    pub(crate) fn dependents_mut(&mut self) -> &mut Vec<K> {
        &mut self.dependents
    }
}

/// How a write treats the lock on the entry it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockAccess {
    /// Write regardless of any lock.
    #[default]
    Ignore,
    /// The lock must match; the written entry is unlocked.
    Release(String),
    /// The lock must match; the lock carries over to the written entry.
    Keep(String),
    /// Write with the given version, bypassing version bookkeeping. Used for replication.
    PreserveVersion(u64),
}

/// Preconditions of an insert or remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Lock handling.
    pub lock: LockAccess,
    /// Version the stored entry must have.
    pub expected_version: Option<u64>,
    /// Client issuing the write. Its own changes are not reported back to it by polling.
    pub client_id: Option<String>,
}

impl WriteOptions {
    /// Require the lock held with `lock_id` and release it with the write.
    pub fn release(lock_id: impl Into<String>) -> Self {
        Self {
            lock: LockAccess::Release(lock_id.into()),
            ..Default::default()
        }
    }

    /// Require the lock held with `lock_id` and keep it after the write.
    pub fn keep(lock_id: impl Into<String>) -> Self {
        Self {
            lock: LockAccess::Keep(lock_id.into()),
            ..Default::default()
        }
    }

    /// Write with a fixed version.
    pub fn preserve_version(version: u64) -> Self {
        Self {
            lock: LockAccess::PreserveVersion(version),
            ..Default::default()
        }
    }

    /// Require the stored entry to have `version`.
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Attribute the write to a client.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock has been taken.
    Acquired(LockInfo),
    /// Another holder has the lock.
    HeldBy(LockInfo),
    /// No such key.
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_names_trimmed() {
        let info = GroupInfo::new("  orders ", Some(" 2025 "));
        assert_eq!(info.group, "orders");
        assert_eq!(info.sub_group.as_deref(), Some("2025"));
        assert_eq!(GroupInfo::new("g", Some("   ")).sub_group, None);
    }

    #[test]
    fn test_group_compatibility() {
        let a = GroupInfo::new("a", Some("x"));
        let a2 = GroupInfo::new("a", Some("y"));
        let b = GroupInfo::new("b", None);
        assert!(GroupInfo::is_compatible(None, None));
        assert!(GroupInfo::is_compatible(Some(&a), Some(&a2)));
        assert!(!GroupInfo::is_compatible(Some(&a), Some(&b)));
        assert!(!GroupInfo::is_compatible(None, Some(&a)));
        assert!(!GroupInfo::is_compatible(Some(&a), None));
    }

    #[test]
    fn test_lock_compare() {
        let now = Instant::now();
        let mut entry = Entry::<u64>::new(vec![0u8; 4]);
        assert!(entry.compare_lock("anyone", now));

        entry.set_lock(Some(LockInfo::new("l1", None)));
        assert!(entry.compare_lock("l1", now));
        assert!(!entry.compare_lock("l2", now));

        entry.set_lock(Some(LockInfo::new("l1", Some(Duration::ZERO))));
        assert!(!entry.is_locked(Instant::now()));
        assert!(entry.compare_lock("l2", Instant::now()));
    }

    #[test]
    fn test_version_sequence() {
        let mut first = Entry::<u64>::new(vec![1u8]);
        first.update_version(None);
        assert_eq!(first.version(), 1);

        let mut second = Entry::<u64>::new(vec![2u8]);
        second.update_version(Some(&first));
        assert_eq!(second.version(), 2);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut live = Entry::<u64>::new(vec![1u8, 2, 3]);
        let snapshot = live.clone();
        live.set_version(9);
        live.set_lock(Some(LockInfo::new("l", None)));
        assert_eq!(snapshot.version(), 0);
        assert!(!snapshot.is_locked(Instant::now()));
        assert_eq!(snapshot.size(), 3);
    }
}
