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
use hashbrown::{HashMap, HashSet};

use crate::entry::GroupInfo;

const GROUP_OVERHEAD: usize = 64;
const SUB_GROUP_OVERHEAD: usize = 48;
const MEMBER_OVERHEAD: usize = 32;

/// Secondary index from group and sub-group to member keys.
///
/// Each key belongs to at most one `(group, sub-group)` pair. Empty sub-groups and groups are dropped as soon as
/// their last member leaves.
#[derive(Debug)]
pub struct GroupIndex<K> {
    groups: HashMap<String, HashMap<Option<String>, HashSet<K>>>,
    memberships: HashMap<K, GroupInfo>,
    in_memory_size: usize,
}

impl<K> Default for GroupIndex<K> {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            memberships: HashMap::new(),
            in_memory_size: 0,
        }
    }
}

fn normalize(info: &GroupInfo) -> GroupInfo {
    GroupInfo::new(&info.group, info.sub_group.as_deref())
}

impl<K> GroupIndex<K>
where
    K: Key,
{
    fn member_size() -> usize {
        MEMBER_OVERHEAD + std::mem::size_of::<K>()
    }

    fn sub_group_size(sub_group: &Option<String>) -> usize {
        SUB_GROUP_OVERHEAD + sub_group.as_ref().map_or(0, String::len)
    }

    /// Add the key to the pair, moving it out of any other pair it was in.
    pub fn add_to_group(&mut self, key: &K, info: &GroupInfo) {
        let info = normalize(info);
        if info.group.is_empty() {
            return;
        }
        if let Some(current) = self.memberships.get(key) {
            if *current == info {
                return;
            }
            let current = current.clone();
            self.remove_from_group(key, &current);
        }

        let mut grown = Self::member_size();
        if !self.groups.contains_key(info.group.as_str()) {
            grown += GROUP_OVERHEAD + info.group.len();
        }
        let group = self.groups.entry_ref(info.group.as_str()).or_default();
        if !group.contains_key(&info.sub_group) {
            grown += Self::sub_group_size(&info.sub_group);
        }
        group.entry(info.sub_group.clone()).or_default().insert(key.clone());
        self.in_memory_size += grown;
        self.memberships.insert(key.clone(), info);
    }

    /// Remove the key from the pair. A key that is not a member of the pair is left alone.
    pub fn remove_from_group(&mut self, key: &K, info: &GroupInfo) -> bool {
        let info = normalize(info);
        if self.memberships.get(key) != Some(&info) {
            return false;
        }
        self.memberships.remove(key);

        let Some(group) = self.groups.get_mut(info.group.as_str()) else {
            return false;
        };
        if let Some(members) = group.get_mut(&info.sub_group) {
            members.remove(key);
            self.in_memory_size -= Self::member_size();
            if members.is_empty() {
                group.remove(&info.sub_group);
                self.in_memory_size -= Self::sub_group_size(&info.sub_group);
            }
        }
        if group.is_empty() {
            self.groups.remove(info.group.as_str());
            self.in_memory_size -= GROUP_OVERHEAD + info.group.len();
        }
        true
    }

    /// Remove the key from whichever pair holds it.
    pub fn remove_key(&mut self, key: &K) -> bool {
        match self.memberships.get(key).cloned() {
            Some(info) => self.remove_from_group(key, &info),
            None => false,
        }
    }

    /// Members of the group, or only of the sub-group if one is named.
    pub fn get_group_keys(&self, group: &str, sub_group: Option<&str>) -> Vec<K> {
        let Some(entry) = self.groups.get(group.trim()) else {
            return vec![];
        };
        match sub_group.map(str::trim) {
            Some(sub_group) => entry
                .get(&Some(sub_group.to_string()))
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default(),
            None => entry.values().flatten().cloned().collect(),
        }
    }

    /// Whether the group has members.
    pub fn group_exists(&self, group: &str) -> bool {
        self.groups.contains_key(group.trim())
    }

    /// Whether the key is a member of the group, and of the sub-group if one is named.
    pub fn key_exists(&self, key: &K, group: &str, sub_group: Option<&str>) -> bool {
        self.memberships.get(key).is_some_and(|info| {
            info.group == group.trim() && sub_group.is_none_or(|sub| info.sub_group.as_deref() == Some(sub.trim()))
        })
    }

    /// Names of groups with members.
    pub fn groups(&self) -> Vec<String> {
        let mut groups = self.groups.keys().cloned().collect::<Vec<_>>();
        groups.sort();
        groups
    }

    /// Estimated bytes held by the index.
    pub fn in_memory_size(&self) -> usize {
        self.in_memory_size
    }

    /// Count of indexed keys.
    pub fn len(&self) -> usize {
        self.memberships.len()
    }

    /// Whether no key is indexed.
    pub fn is_empty(&self) -> bool {
        self.memberships.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.memberships.clear();
        self.in_memory_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn info(group: &str, sub_group: Option<&str>) -> GroupInfo {
        GroupInfo::new(group, sub_group)
    }

    #[test]
    fn test_add_and_query() {
        let mut index = GroupIndex::<u64>::default();
        index.add_to_group(&1, &info("orders", Some("eu")));
        index.add_to_group(&2, &info("orders", Some("us")));
        index.add_to_group(&3, &info("orders", None));
        index.add_to_group(&4, &info("users", None));

        assert_eq!(index.get_group_keys("orders", None).into_iter().sorted().collect_vec(), vec![1, 2, 3]);
        assert_eq!(index.get_group_keys(" orders ", Some(" eu")), vec![1]);
        assert!(index.get_group_keys("orders", Some("asia")).is_empty());
        assert!(index.get_group_keys("missing", None).is_empty());

        assert!(index.group_exists("users"));
        assert!(index.key_exists(&1, "orders", None));
        assert!(index.key_exists(&1, "orders", Some("eu")));
        assert!(!index.key_exists(&1, "orders", Some("us")));
        assert_eq!(index.groups(), vec!["orders".to_string(), "users".to_string()]);
    }

    #[test]
    fn test_move_between_pairs() {
        let mut index = GroupIndex::<u64>::default();
        index.add_to_group(&1, &info("a", Some("x")));
        index.add_to_group(&1, &info("b", None));
        assert!(!index.group_exists("a"));
        assert_eq!(index.get_group_keys("b", None), vec![1]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_only_from_own_pair() {
        let mut index = GroupIndex::<u64>::default();
        index.add_to_group(&1, &info("a", Some("x")));
        assert!(!index.remove_from_group(&1, &info("a", Some("y"))));
        assert!(index.key_exists(&1, "a", Some("x")));
        assert!(index.remove_from_group(&1, &info("a", Some("x"))));
        assert!(!index.group_exists("a"));
        assert!(!index.remove_key(&1));
    }

    #[test]
    fn test_in_memory_size_returns_to_zero() {
        let mut index = GroupIndex::<u64>::default();
        for i in 0..100 {
            index.add_to_group(&i, &info(&format!("g{}", i % 7), Some(&format!("s{}", i % 3))));
        }
        assert!(index.in_memory_size() > 0);
        for i in 0..100 {
            assert!(index.remove_key(&i));
        }
        assert_eq!(index.in_memory_size(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_empty_group_ignored() {
        let mut index = GroupIndex::<u64>::default();
        index.add_to_group(&1, &info("   ", None));
        assert!(index.is_empty());
        assert_eq!(index.in_memory_size(), 0);
    }
}
