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

use bucketcache_common::code::Key;

use super::{EvictionPolicy, RankedIndex};
use crate::entry::Hint;

/// Least recently used eviction. Both writes and reads refresh a key.
#[derive(Debug)]
pub struct LruPolicy<K> {
    evict_ratio: f64,
    index: RankedIndex<K, u64>,
    tick: u64,
}

impl<K> LruPolicy<K>
where
    K: Key,
{
    /// Create an LRU policy.
    pub fn new(evict_ratio: f64) -> Self {
        Self {
            evict_ratio,
            index: RankedIndex::default(),
            tick: 0,
        }
    }

    fn touch(&mut self, key: &K) {
        self.tick += 1;
        self.index.insert(key.clone(), self.tick);
    }
}

impl<K> EvictionPolicy<K> for LruPolicy<K>
where
    K: Key,
{
    fn compatible_hint(&self, _: Option<&Hint>) -> Hint {
        Hint::Recency
    }

    fn notify(&mut self, key: &K, _old: Option<&Hint>, new: Option<&Hint>) {
        match new {
            Some(_) => self.touch(key),
            None => {
                self.index.remove(key);
            }
        }
    }

    fn access(&mut self, key: &K) {
        if self.index.rank(key).is_some() {
            self.touch(key);
        }
    }

    fn candidates(&mut self, size_to_free: usize, weigh: &mut dyn FnMut(&K) -> Option<usize>) -> Vec<K> {
        self.index.select(size_to_free, weigh)
    }

    fn evict_ratio(&self) -> f64 {
        self.evict_ratio
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn clear(&mut self) {
        self.index.clear();
    }
}
