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

/// Least frequently used eviction.
///
/// Ranked by `(frequency, last use)`, so among keys used equally often the stalest goes first. An overwrite counts as
/// a use and keeps the accumulated frequency.
#[derive(Debug)]
pub struct LfuPolicy<K> {
    evict_ratio: f64,
    index: RankedIndex<K, (u64, u64)>,
    tick: u64,
}

impl<K> LfuPolicy<K>
where
    K: Key,
{
    /// Create an LFU policy.
    pub fn new(evict_ratio: f64) -> Self {
        Self {
            evict_ratio,
            index: RankedIndex::default(),
            tick: 0,
        }
    }

    fn bump(&mut self, key: &K, freq: u64) {
        self.tick += 1;
        self.index.insert(key.clone(), (freq.saturating_add(1), self.tick));
    }
}

impl<K> EvictionPolicy<K> for LfuPolicy<K>
where
    K: Key,
{
    fn compatible_hint(&self, _: Option<&Hint>) -> Hint {
        Hint::Frequency
    }

    fn notify(&mut self, key: &K, _old: Option<&Hint>, new: Option<&Hint>) {
        match new {
            Some(_) => {
                let freq = self.index.rank(key).map_or(0, |(freq, _)| freq);
                self.bump(key, freq);
            }
            None => {
                self.index.remove(key);
            }
        }
    }

    fn access(&mut self, key: &K) {
        if let Some((freq, _)) = self.index.rank(key) {
            self.bump(key, freq);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lfu() {
        let mut policy = LfuPolicy::<u64>::new(0.25);
        for i in 1..=4 {
            policy.notify(&i, None, Some(&Hint::Frequency));
        }
        policy.access(&1);
        policy.access(&1);
        policy.access(&3);
        // 2 and 4 are used once, 2 is older.
        assert_eq!(policy.index.keys(), vec![2, 4, 3, 1]);

        policy.notify(&2, Some(&Hint::Frequency), Some(&Hint::Frequency));
        assert_eq!(policy.index.keys(), vec![4, 3, 2, 1]);

        assert_eq!(policy.candidates(1, &mut |_| Some(1)), vec![4]);
        policy.clear();
        assert!(policy.is_empty());
    }
}
