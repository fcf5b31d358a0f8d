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

use bucketcache_common::{
    code::Key,
    error::{Error, Result},
};

use super::{EvictionPolicy, RankedIndex};
use crate::entry::{Hint, Priority};

fn tier(priority: Priority) -> Option<u8> {
    match priority {
        Priority::Low => Some(0),
        Priority::BelowNormal => Some(1),
        Priority::Normal => Some(2),
        Priority::AboveNormal => Some(3),
        Priority::High => Some(4),
        Priority::NotRemovable | Priority::Default => None,
    }
}

/// Priority tier eviction.
///
/// Keys are evicted from the lowest tier up, oldest first inside a tier. [`Priority::NotRemovable`] keys are never
/// ranked, so they are never selected.
#[derive(Debug)]
pub struct PriorityPolicy<K> {
    default_priority: Priority,
    evict_ratio: f64,
    index: RankedIndex<K, (u8, u64)>,
    seq: u64,
}

impl<K> PriorityPolicy<K>
where
    K: Key,
{
    /// Create a priority policy.
    pub fn new(default_priority: Priority, evict_ratio: f64) -> Result<Self> {
        if default_priority == Priority::Default {
            return Err(Error::config("default priority must name a concrete priority"));
        }
        Ok(Self {
            default_priority,
            evict_ratio,
            index: RankedIndex::default(),
            seq: 0,
        })
    }

    fn resolve(&self, priority: Priority) -> Priority {
        match priority {
            Priority::Default => self.default_priority,
            p => p,
        }
    }
}

impl<K> EvictionPolicy<K> for PriorityPolicy<K>
where
    K: Key,
{
    fn compatible_hint(&self, requested: Option<&Hint>) -> Hint {
        match requested {
            Some(Hint::Priority(p)) => Hint::Priority(self.resolve(*p)),
            _ => Hint::Priority(self.default_priority),
        }
    }

    fn notify(&mut self, key: &K, _old: Option<&Hint>, new: Option<&Hint>) {
        let priority = match new {
            Some(Hint::Priority(p)) => self.resolve(*p),
            Some(_) => self.default_priority,
            None => {
                self.index.remove(key);
                return;
            }
        };
        match tier(priority) {
            Some(tier) => {
                self.seq += 1;
                self.index.insert(key.clone(), (tier, self.seq));
            }
            None => {
                self.index.remove(key);
            }
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
