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

use std::collections::BTreeMap;

use bucketcache_common::{
    code::Key,
    error::{Error, Result},
};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::entry::{Hint, Priority};

/// Eviction policy abstraction.
///
/// The policy only ranks keys. Victims it selects are removed by the cache through the same bucket-aware path user
/// removes take, which in turn calls [`EvictionPolicy::notify`] with no new hint.
pub trait EvictionPolicy<K>: Send + Sync + 'static
where
    K: Key,
{
    /// Normalize a caller-supplied hint into the representation of the policy.
    fn compatible_hint(&self, requested: Option<&Hint>) -> Hint;

    /// Keep the ranking current.
    ///
    /// Called with `old = None` on a new key, with both on an overwrite and with `new = None` on removal.
    fn notify(&mut self, key: &K, old: Option<&Hint>, new: Option<&Hint>);

    /// Record a read of the key.
    fn access(&mut self, key: &K) {
        let _ = key;
    }

    /// Select victims until their sizes add up to at least `size_to_free`.
    ///
    /// `weigh` returns the size of an evictable key, or `None` to skip it.
    fn candidates(&mut self, size_to_free: usize, weigh: &mut dyn FnMut(&K) -> Option<usize>) -> Vec<K>;

    /// Fraction of the current usage one pass frees.
    fn evict_ratio(&self) -> f64;

    /// Count of ranked keys.
    fn len(&self) -> usize;

    /// Whether no key is ranked.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all keys.
    fn clear(&mut self);
}

/// Policy selection and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Priority tiers.
    Priority {
        /// Priority of entries that do not carry one.
        #[serde(default = "PolicyConfig::default_priority")]
        default_priority: Priority,
    },
    /// Least recently used.
    Lru,
    /// Least frequently used.
    Lfu,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::Priority {
            default_priority: Priority::Normal,
        }
    }
}

impl PolicyConfig {
    fn default_priority() -> Priority {
        Priority::Normal
    }

    /// Build the configured policy.
    pub fn build<K>(&self, evict_ratio: f64) -> Result<Box<dyn EvictionPolicy<K>>>
    where
        K: Key,
    {
        if !(evict_ratio > 0.0 && evict_ratio <= 1.0) {
            return Err(Error::config("evict ratio must be in (0, 1]").with_context("evict_ratio", evict_ratio));
        }
        let policy: Box<dyn EvictionPolicy<K>> = match self {
            PolicyConfig::Priority { default_priority } => {
                Box::new(priority::PriorityPolicy::new(*default_priority, evict_ratio)?)
            }
            PolicyConfig::Lru => Box::new(lru::LruPolicy::new(evict_ratio)),
            PolicyConfig::Lfu => Box::new(lfu::LfuPolicy::new(evict_ratio)),
        };
        Ok(policy)
    }
}

/// Keys ordered by a unique rank, lowest first.
#[derive(Debug)]
pub(crate) struct RankedIndex<K, R> {
    ranks: HashMap<K, R>,
    order: BTreeMap<R, K>,
}

impl<K, R> Default for RankedIndex<K, R> {
    fn default() -> Self {
        Self {
            ranks: HashMap::new(),
            order: BTreeMap::new(),
        }
    }
}

impl<K, R> RankedIndex<K, R>
where
    K: Key,
    R: Ord + Copy,
{
    /// Rank the key, replacing its previous rank.
    pub fn insert(&mut self, key: K, rank: R) {
        if let Some(old) = self.ranks.insert(key.clone(), rank) {
            self.order.remove(&old);
        }
        self.order.insert(rank, key);
    }

    pub fn remove(&mut self, key: &K) -> Option<R> {
        let rank = self.ranks.remove(key)?;
        self.order.remove(&rank);
        Some(rank)
    }

    pub fn rank(&self, key: &K) -> Option<R> {
        self.ranks.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn clear(&mut self) {
        self.ranks.clear();
        self.order.clear();
    }

    /// Walk keys lowest rank first, picking evictable ones until `size_to_free` is covered.
    pub fn select(&self, size_to_free: usize, weigh: &mut dyn FnMut(&K) -> Option<usize>) -> Vec<K> {
        let mut picked = vec![];
        let mut freed = 0;
        for key in self.order.values() {
            if freed >= size_to_free {
                break;
            }
            if let Some(size) = weigh(key) {
                freed += size;
                picked.push(key.clone());
            }
        }
        picked
    }

    #[cfg(test)]
    pub fn keys(&self) -> Vec<K> {
        self.order.values().cloned().collect()
    }
}

/// Least frequently used.
pub mod lfu;
/// Least recently used.
pub mod lru;
/// Priority tiers, oldest first within a tier.
pub mod priority;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranked_index() {
        let mut index = RankedIndex::<u64, u64>::default();
        index.insert(1, 30);
        index.insert(2, 10);
        index.insert(3, 20);
        assert_eq!(index.keys(), vec![2, 3, 1]);

        index.insert(2, 40);
        assert_eq!(index.keys(), vec![3, 1, 2]);
        assert_eq!(index.remove(&1), Some(30));
        assert_eq!(index.remove(&1), None);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_select_skips_unevictable() {
        let mut index = RankedIndex::<u64, u64>::default();
        for i in 0..10 {
            index.insert(i, i);
        }
        let picked = index.select(25, &mut |k| if k % 2 == 0 { None } else { Some(10) });
        assert_eq!(picked, vec![1, 3, 5]);
        assert!(index.select(0, &mut |_| Some(10)).is_empty());
    }

    #[test]
    fn test_config_build() {
        assert!(PolicyConfig::Lru.build::<u64>(0.0).is_err());
        assert!(PolicyConfig::Lru.build::<u64>(1.5).is_err());
        let policy = PolicyConfig::default().build::<u64>(0.25).unwrap();
        assert_eq!(policy.evict_ratio(), 0.25);

        let config: PolicyConfig = serde_json::from_str(r#"{"type":"priority"}"#).unwrap();
        assert_eq!(config, PolicyConfig::default());
        let config: PolicyConfig = serde_json::from_str(r#"{"type":"priority","default_priority":"low"}"#).unwrap();
        assert_eq!(
            config,
            PolicyConfig::Priority {
                default_priority: Priority::Low
            }
        );
    }
}
