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

use std::hash::{BuildHasher, Hash, Hasher};

use twox_hash::XxHash64;

/// Identifier of a hash bucket, in `[0, bucket_count)`.
pub type BucketId = u32;

/// Canonical bucket count of a cluster.
pub const DEFAULT_BUCKET_COUNT: u32 = 1000;

/// Seeded xxHash64 hash builder.
///
/// Unlike [`std::collections::hash_map::RandomState`], the seed is fixed so every node computes the same hash for
/// the same key.
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketHashBuilder {
    seed: u64,
}

impl BucketHashBuilder {
    /// Create a hash builder with the given seed. All nodes of a cluster must share the seed.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl BuildHasher for BucketHashBuilder {
    type Hasher = XxHash64;

    fn build_hasher(&self) -> Self::Hasher {
        XxHash64::with_seed(self.seed)
    }
}

/// Maps keys to buckets.
///
/// A key lands in bucket `|hash(key)| / (MAX_HASH / bucket_count)`, so each bucket owns a contiguous range of the
/// hash space.
#[derive(Debug, Clone, Copy)]
pub struct BucketRouter {
    bucket_count: u32,
    bucket_range: u64,
    hash_builder: BucketHashBuilder,
}

impl BucketRouter {
    /// Create a router over `bucket_count` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `bucket_count` is 0.
    pub fn new(bucket_count: u32) -> Self {
        Self::with_hash_builder(bucket_count, BucketHashBuilder::default())
    }

    /// Create a router over `bucket_count` buckets with a custom hash builder.
    ///
    /// # Panics
    ///
    /// Panics if `bucket_count` is 0.
    pub fn with_hash_builder(bucket_count: u32, hash_builder: BucketHashBuilder) -> Self {
        assert!(bucket_count > 0, "bucket count must be positive");
        Self {
            bucket_count,
            bucket_range: i64::MAX as u64 / bucket_count as u64,
            hash_builder,
        }
    }

    /// Bucket count.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Hash the key with the cluster-wide hasher.
    pub fn hash<K>(&self, key: &K) -> u64
    where
        K: Hash + ?Sized,
    {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Bucket the key routes to.
    pub fn bucket<K>(&self, key: &K) -> BucketId
    where
        K: Hash + ?Sized,
    {
        self.bucket_of_hash(self.hash(key))
    }

    /// Bucket a precomputed hash routes to.
    pub fn bucket_of_hash(&self, hash: u64) -> BucketId {
        // The hash is interpreted as signed and folded to its magnitude.
        let magnitude = (hash as i64).unsigned_abs();
        let bucket = magnitude / self.bucket_range;
        // `i64::MIN` and the tail of the last range fold into the last bucket.
        bucket.min(self.bucket_count as u64 - 1) as BucketId
    }
}

impl Default for BucketRouter {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_in_range_and_stable() {
        let router = BucketRouter::default();
        for i in 0..10_000u64 {
            let key = format!("key-{i}");
            let bucket = router.bucket(&key);
            assert!(bucket < DEFAULT_BUCKET_COUNT);
            assert_eq!(bucket, router.bucket(&key));
        }
    }

    #[test]
    fn test_bucket_edges() {
        let router = BucketRouter::new(1000);
        assert_eq!(router.bucket_of_hash(0), 0);
        assert_eq!(router.bucket_of_hash(i64::MAX as u64), 999);
        assert_eq!(router.bucket_of_hash(i64::MIN as u64), 999);
        assert_eq!(router.bucket_of_hash(-1i64 as u64), 0);
        assert_eq!(router.bucket_of_hash(router.bucket_range * 5), 5);
        assert_eq!(router.bucket_of_hash(router.bucket_range * 5 - 1), 4);
    }

    #[test]
    fn test_routers_agree() {
        let a = BucketRouter::new(1000);
        let b = BucketRouter::new(1000);
        for i in 0..1000u64 {
            assert_eq!(a.bucket(&i), b.bucket(&i));
        }
    }

    #[test]
    fn test_single_bucket() {
        let router = BucketRouter::new(1);
        for i in 0..100u64 {
            assert_eq!(router.bucket(&i), 0);
        }
    }

    #[test]
    fn test_spread() {
        let router = BucketRouter::new(16);
        let mut hits = [0usize; 16];
        for i in 0..16_000u64 {
            hits[router.bucket(&i) as usize] += 1;
        }
        assert!(hits.iter().all(|&h| h > 0));
    }
}
