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

use std::marker::PhantomData;

use crate::code::Key;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoveReason {
    /// Removed by an explicit remove call.
    Removed,
    /// The expiration hint fired.
    Expired,
    /// Removed by an eviction pass.
    Evicted,
    /// An entry it depends on was removed.
    DependencyChanged,
    /// The bucket holding it was handed over to another node.
    BucketRemoved,
}

/// Events raised by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent<'a, K> {
    /// A new key was stored.
    ItemAdded {
        /// The added key.
        key: &'a K,
    },
    /// An existing key was overwritten.
    ItemUpdated {
        /// The updated key.
        key: &'a K,
    },
    /// A key left the cache.
    ItemRemoved {
        /// The removed key.
        key: &'a K,
        /// Why it left.
        reason: RemoveReason,
    },
    /// The whole cache was cleared.
    CacheCleared,
    /// A polling client has pending changes and should poll.
    PollRequired {
        /// The client id.
        client: &'a str,
    },
}

/// Trait for the customized cache event listener.
///
/// Events are dispatched after all cache locks are released, so the listener may call back into the cache.
pub trait EventListener: Send + Sync + 'static {
    /// Associated key type.
    type Key: Key;

    /// Called for every raised event.
    fn on_event(&self, event: CacheEvent<'_, Self::Key>);
}

/// A listener that ignores every event.
#[derive(Debug)]
pub struct NoopEventListener<K>(PhantomData<K>);

impl<K> Default for NoopEventListener<K> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K> EventListener for NoopEventListener<K>
where
    K: Key,
{
    type Key = K;

    fn on_event(&self, _: CacheEvent<'_, Self::Key>) {}
}
