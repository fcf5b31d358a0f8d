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

//! Pull-based change notifications.
//!
//! Clients register interest in keys, the cache reports changes, and clients poll for what changed since their last
//! poll. A background poller tells clients with pending changes to poll and reaps idle clients.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bitflags::bitflags;
use bucketcache_common::{
    code::Key,
    event::{CacheEvent, EventListener},
};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::config::NotificationConfig;

bitflags! {
    /// Kinds of changes a client wants to hear about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        /// Overwrites.
        const UPDATE = 0b01;
        /// Removals.
        const REMOVE = 0b10;
    }
}

/// Changes pending for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult<K> {
    /// Updated keys.
    pub updated: Vec<K>,
    /// Removed keys. Interest in them is dropped by the poll.
    pub removed: Vec<K>,
    /// Whether the cache was cleared.
    pub cleared: bool,
}

impl<K> Default for PollResult<K> {
    fn default() -> Self {
        Self {
            updated: vec![],
            removed: vec![],
            cleared: false,
        }
    }
}

impl<K> PollResult<K> {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty() && !self.cleared
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Subject<K> {
    Key(K),
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Updated,
    Removed,
    Cleared,
}

#[derive(Debug)]
struct Change {
    kind: ChangeKind,
    at: u64,
    by: Option<String>,
}

impl Change {
    fn visible_to(&self, client: &str, since: u64) -> bool {
        self.at > since && self.by.as_deref() != Some(client)
    }
}

#[derive(Debug, Default)]
struct KeyInfo {
    refs: AtomicUsize,
}

impl KeyInfo {
    fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the last reference is released.
    fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    interest: Interest,
    registered_at: u64,
}

#[derive(Debug)]
struct Client<K> {
    id: String,
    keys: HashMap<K, Registration>,
    registered_at: u64,
    last_poll: u64,
    last_seen: Instant,
}

#[derive(Debug)]
struct State<K> {
    clock: u64,
    last_change_time: u64,
    keys: HashMap<K, KeyInfo>,
    clients: HashMap<String, Client<K>>,
    changes: HashMap<Subject<K>, Change>,
}

fn normalize(client: &str) -> String {
    client.to_lowercase()
}

impl<K> State<K>
where
    K: Key,
{
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn record(&mut self, subject: Subject<K>, kind: ChangeKind, by: Option<&str>) {
        let at = self.tick();
        self.last_change_time = at;
        self.changes.insert(
            subject,
            Change {
                kind,
                at,
                by: by.map(normalize),
            },
        );
    }

    fn release_key(&mut self, key: &K) {
        let drop = self.keys.get(key).is_some_and(KeyInfo::release);
        if drop {
            self.keys.remove(key);
            self.changes.remove(&Subject::Key(key.clone()));
        }
    }

    fn pending(&self, client: &Client<K>, norm: &str) -> PollResult<K> {
        let mut result = PollResult::default();
        for (key, registration) in client.keys.iter() {
            let Some(change) = self.changes.get(&Subject::Key(key.clone())) else {
                continue;
            };
            if !change.visible_to(norm, client.last_poll.max(registration.registered_at)) {
                continue;
            }
            match change.kind {
                ChangeKind::Updated if registration.interest.contains(Interest::UPDATE) => {
                    result.updated.push(key.clone())
                }
                ChangeKind::Removed if registration.interest.contains(Interest::REMOVE) => {
                    result.removed.push(key.clone())
                }
                _ => {}
            }
        }
        result.cleared = self
            .changes
            .get(&Subject::Cleared)
            .is_some_and(|change| change.visible_to(norm, client.last_poll.max(client.registered_at)));
        result
    }

    fn remove_client(&mut self, norm: &str) -> bool {
        let Some(client) = self.clients.remove(norm) else {
            return false;
        };
        for key in client.keys.keys() {
            self.release_key(key);
        }
        true
    }

    /// Forget changes every client has already polled past.
    fn prune(&mut self) {
        match self.clients.values().map(|client| client.last_poll).min() {
            Some(horizon) => self.changes.retain(|_, change| change.at > horizon),
            None => self.changes.clear(),
        }
    }
}

struct Shared<K>
where
    K: Key,
{
    state: Mutex<State<K>>,
    stopped: Mutex<bool>,
    wake: Condvar,
    poll_interval: Duration,
    dead_client_timeout: Duration,
    listener: Option<Arc<dyn EventListener<Key = K>>>,
}

impl<K> Shared<K>
where
    K: Key,
{
    fn run(&self) {
        loop {
            {
                let mut stopped = self.stopped.lock();
                if !*stopped {
                    self.wake.wait_for(&mut stopped, self.poll_interval);
                }
                if *stopped {
                    break;
                }
            }
            self.poll_round(Instant::now());
        }
        tracing::debug!("[notification]: poller stopped");
    }

    fn poll_round(&self, now: Instant) {
        let pending = {
            let mut state = self.state.lock();
            let pending = state
                .clients
                .iter()
                .filter(|(norm, client)| !state.pending(client, norm).is_empty())
                .map(|(_, client)| client.id.clone())
                .collect::<Vec<_>>();
            let dead = state
                .clients
                .iter()
                .filter(|(_, client)| now.saturating_duration_since(client.last_seen) >= self.dead_client_timeout)
                .map(|(norm, _)| norm.clone())
                .collect::<Vec<_>>();
            for norm in dead {
                tracing::debug!("[notification]: reap dead client {norm}");
                state.remove_client(&norm);
            }
            state.prune();
            pending
        };
        if let Some(listener) = self.listener.as_ref() {
            for client in pending.iter() {
                listener.on_event(CacheEvent::PollRequired { client });
            }
        }
    }
}

/// Tracks client interest in keys and the changes to report to them.
///
/// Time is a logical clock advanced by every registration and change, so ordering between a registration, a change
/// and a poll is exact.
pub struct PollNotificationManager<K>
where
    K: Key,
{
    shared: Arc<Shared<K>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<K> std::fmt::Debug for PollNotificationManager<K>
where
    K: Key,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollNotificationManager")
            .field("poll_interval", &self.shared.poll_interval)
            .field("dead_client_timeout", &self.shared.dead_client_timeout)
            .finish()
    }
}

impl<K> PollNotificationManager<K>
where
    K: Key,
{
    /// Create a manager. The poller is not running until [`Self::start`].
    pub fn new(config: &NotificationConfig, listener: Option<Arc<dyn EventListener<Key = K>>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    clock: 0,
                    last_change_time: 0,
                    keys: HashMap::new(),
                    clients: HashMap::new(),
                    changes: HashMap::new(),
                }),
                stopped: Mutex::new(false),
                wake: Condvar::new(),
                poll_interval: config.poll_interval(),
                dead_client_timeout: config.dead_client_timeout(),
                listener,
            }),
            poller: Mutex::new(None),
        }
    }

    /// Spawn the background poller.
    pub fn start(&self, name: &str) -> std::io::Result<()> {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-poller"))
            .spawn(move || shared.run())?;
        *poller = Some(handle);
        Ok(())
    }

    /// Stop and join the background poller.
    pub fn stop(&self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.poller.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("[notification]: poller panicked");
            }
        }
    }

    /// Register interest of the client in the key. Registering again replaces the interest.
    pub fn register_key(&self, client: &str, key: K, interest: Interest) {
        let norm = normalize(client);
        let mut state = self.shared.state.lock();
        let at = state.tick();
        let state = &mut *state;
        let entry = state.clients.entry(norm).or_insert_with(|| Client {
            id: client.to_string(),
            keys: HashMap::new(),
            registered_at: at,
            last_poll: at,
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        match entry.keys.get_mut(&key) {
            Some(registration) => registration.interest = interest,
            None => {
                entry.keys.insert(
                    key.clone(),
                    Registration {
                        interest,
                        registered_at: at,
                    },
                );
                state.keys.entry(key).or_default().acquire();
            }
        }
    }

    /// Drop interest of the client in the key.
    pub fn unregister_key(&self, client: &str, key: &K) -> bool {
        let norm = normalize(client);
        let mut state = self.shared.state.lock();
        let removed = state
            .clients
            .get_mut(&norm)
            .is_some_and(|client| client.keys.remove(key).is_some());
        if removed {
            state.release_key(key);
        }
        removed
    }

    /// Drop the client and all its interest.
    pub fn unregister_client(&self, client: &str) -> bool {
        self.shared.state.lock().remove_client(&normalize(client))
    }

    /// Report an overwrite.
    pub fn key_updated(&self, key: &K, by_client: Option<&str>) {
        let mut state = self.shared.state.lock();
        if state.keys.contains_key(key) {
            state.record(Subject::Key(key.clone()), ChangeKind::Updated, by_client);
        }
    }

    /// Report a removal. Removals not issued by a user drop the interest of every client in the key.
    pub fn key_removed(&self, key: &K, by_client: Option<&str>, is_user_op: bool) {
        let mut state = self.shared.state.lock();
        if !state.keys.contains_key(key) {
            return;
        }
        if is_user_op {
            state.record(Subject::Key(key.clone()), ChangeKind::Removed, by_client);
            return;
        }
        for client in state.clients.values_mut() {
            client.keys.remove(key);
        }
        state.keys.remove(key);
        state.changes.remove(&Subject::Key(key.clone()));
    }

    /// Report a clear of the whole cache, if `raise`.
    pub fn clear_cache(&self, raise: bool) {
        let mut state = self.shared.state.lock();
        if raise && !state.clients.is_empty() {
            state.record(Subject::Cleared, ChangeKind::Cleared, None);
        }
    }

    /// Collect the changes pending for the client.
    pub fn poll(&self, client: &str) -> PollResult<K> {
        let norm = normalize(client);
        let mut state = self.shared.state.lock();
        let Some(entry) = state.clients.get(&norm) else {
            return PollResult::default();
        };
        let result = state.pending(entry, &norm);
        let at = state.tick();
        if let Some(entry) = state.clients.get_mut(&norm) {
            entry.last_poll = at;
            entry.last_seen = Instant::now();
            for key in result.removed.iter() {
                entry.keys.remove(key);
            }
        }
        for key in result.removed.iter() {
            state.release_key(key);
        }
        result
    }

    /// Whether the client has pending changes.
    pub fn are_keys_modified(&self, client: &str) -> bool {
        let norm = normalize(client);
        let state = self.shared.state.lock();
        state
            .clients
            .get(&norm)
            .is_some_and(|entry| !state.pending(entry, &norm).is_empty())
    }

    /// Drop clients idle for longer than the dead client timeout. Returns their ids.
    pub fn clean_dead_clients(&self, now: Instant) -> Vec<String> {
        let mut state = self.shared.state.lock();
        let dead = state
            .clients
            .iter()
            .filter(|(_, client)| now.saturating_duration_since(client.last_seen) >= self.shared.dead_client_timeout)
            .map(|(norm, client)| (norm.clone(), client.id.clone()))
            .collect::<Vec<_>>();
        dead.into_iter()
            .map(|(norm, id)| {
                state.remove_client(&norm);
                id
            })
            .collect()
    }

    /// Logical time of the last reported change.
    pub fn last_change_time(&self) -> u64 {
        self.shared.state.lock().last_change_time
    }

    /// Count of keys with interest.
    pub fn interested_keys(&self) -> usize {
        self.shared.state.lock().keys.len()
    }

    /// Count of known clients.
    pub fn clients(&self) -> usize {
        self.shared.state.lock().clients.len()
    }

    /// Run one poller round on the calling thread.
    pub fn poll_round(&self) {
        self.shared.poll_round(Instant::now());
    }
}

impl<K> Drop for PollNotificationManager<K>
where
    K: Key,
{
    fn drop(&mut self) {
        self.stop();
    }
}
