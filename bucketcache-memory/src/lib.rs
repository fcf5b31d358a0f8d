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

//! The bucket-partitioned memory cache of bucketcache.

/// Ownership states and per-bucket accounting.
pub mod bucket;
/// The partitioned cache and its builder.
pub mod cache;
/// Serde-friendly cache config.
pub mod config;
/// Entries and their metadata.
pub mod entry;
/// Eviction policies.
pub mod eviction;
mod evictor;
/// Time-based expiry.
pub mod expiration;
/// The data group index.
pub mod group;
/// Pull-based client notifications.
pub mod notification;
/// Operation logs of transferring buckets.
pub mod oplog;
/// The physical entry table.
pub mod store;
pub mod strategy;

/// Utilities for testing.
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

mod prelude;
pub use prelude::*;
