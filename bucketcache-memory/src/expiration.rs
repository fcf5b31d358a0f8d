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

use std::{marker::PhantomData, time::Instant};

use bucketcache_common::code::Key;
use hashbrown::HashMap;
use itertools::Itertools;
use parking_lot::Mutex;

use crate::entry::{Entry, Expiration};

/// Tracks time-based expiry of entries.
///
/// The cache calls [`ExpirationIndex::update_index`] on every successful add, insert and get, and
/// [`ExpirationIndex::remove_from_index`] on every removal.
pub trait ExpirationIndex<K>: Send + Sync + 'static
where
    K: Key,
{
    /// Whether the entry has expired at `now`.
    fn check_expired(&self, key: &K, entry: &Entry<K>, now: Instant) -> bool;

    /// Start or refresh tracking of the entry. Sliding deadlines restart here.
    fn update_index(&self, key: &K, entry: &Entry<K>, now: Instant);

    /// Stop tracking the key.
    fn remove_from_index(&self, key: &K);

    /// Keys whose deadline passed at `now`.
    fn expired_keys(&self, now: Instant) -> Vec<K>;

    /// Stop tracking everything.
    fn clear(&self);
}

/// Never expires anything.
#[derive(Debug)]
pub struct NoopExpiration<K>(PhantomData<K>);

impl<K> Default for NoopExpiration<K> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K> ExpirationIndex<K> for NoopExpiration<K>
where
    K: Key,
{
    fn check_expired(&self, _: &K, _: &Entry<K>, _: Instant) -> bool {
        false
    }

    fn update_index(&self, _: &K, _: &Entry<K>, _: Instant) {}

    fn remove_from_index(&self, _: &K) {}

    fn expired_keys(&self, _: Instant) -> Vec<K> {
        vec![]
    }

    fn clear(&self) {}
}

/// Deadline based expiration.
///
/// Absolute entries keep their deadline. Sliding entries get `now + idle` every time they are indexed, so a get
/// pushes the deadline out.
#[derive(Debug)]
pub struct TtlExpiration<K> {
    deadlines: Mutex<HashMap<K, Instant>>,
}

impl<K> Default for TtlExpiration<K> {
    fn default() -> Self {
        Self {
            deadlines: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> TtlExpiration<K>
where
    K: Key,
{
    /// Count of tracked keys.
    pub fn len(&self) -> usize {
        self.deadlines.lock().len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deadline of the key.
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.deadlines.lock().get(key).copied()
    }
}

impl<K> ExpirationIndex<K> for TtlExpiration<K>
where
    K: Key,
{
    fn check_expired(&self, key: &K, entry: &Entry<K>, now: Instant) -> bool {
        match entry.expiration() {
            None => false,
            Some(Expiration::Absolute(at)) => *at <= now,
            Some(Expiration::Sliding(_)) => self.deadline(key).is_some_and(|at| at <= now),
        }
    }

    fn update_index(&self, key: &K, entry: &Entry<K>, now: Instant) {
        let deadline = match entry.expiration() {
            None => {
                self.remove_from_index(key);
                return;
            }
            Some(Expiration::Absolute(at)) => *at,
            Some(Expiration::Sliding(idle)) => now + *idle,
        };
        self.deadlines.lock().insert(key.clone(), deadline);
    }

    fn remove_from_index(&self, key: &K) {
        self.deadlines.lock().remove(key);
    }

    fn expired_keys(&self, now: Instant) -> Vec<K> {
        self.deadlines
            .lock()
            .iter()
            .filter(|(_, at)| **at <= now)
            .sorted_by_key(|(_, at)| **at)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn clear(&self) {
        self.deadlines.lock().clear();
    }
}
