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

//! bucketcache - partitioned in-process cache for Rust.
//!
//! Keys are partitioned into buckets by a stable hash. A cluster rebalancer assigns buckets to nodes and moves them
//! between nodes, while the cache keeps serving the keys it owns. See [`PartitionedCache`].

pub use bucketcache_common as common;
pub use bucketcache_memory as memory;

mod prelude;
pub use prelude::*;
