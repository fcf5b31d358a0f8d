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

//! Shared components and utils for bucketcache.

/// Allow enable debug assertions in release profile with feature "strict_assertion".
pub mod assert;
/// Stable key hashing and bucket routing.
pub mod bucket;
/// Key trait and blanket implementation.
pub mod code;
/// The error type and result alias shared by all bucketcache crates.
pub mod error;
/// Cache events and the listener trait.
pub mod event;
/// Metrics abstraction and provisioned registries.
pub mod metrics;
/// Scoped functional programming extensions.
pub mod scope;
