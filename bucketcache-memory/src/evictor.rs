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

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
    thread::JoinHandle,
};

use parking_lot::{Mutex, MutexGuard};

/// Serializes eviction passes and coalesces background triggers.
#[derive(Debug, Default)]
pub struct Evictor {
    pass: Mutex<()>,
    scheduled: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Held while a pass runs.
pub type PassGuard<'a> = MutexGuard<'a, ()>;

impl Evictor {
    /// Begin a pass, or `None` if one is already running.
    pub fn try_begin_pass(&self) -> Option<PassGuard<'_>> {
        self.pass.try_lock()
    }

    /// Claim the right to spawn a background pass. False if one is already scheduled.
    pub fn try_schedule(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the claim taken by [`Self::try_schedule`].
    ///
    /// Blocks until the thread that claimed the schedule has stored the handle of its pass.
    pub fn finish_schedule(&self) {
        let _handles = self.handles.lock();
        self.scheduled.store(false, Ordering::Release);
    }

    /// Whether a background pass is scheduled or running.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Spawn a background pass and keep its handle.
    ///
    /// The handle is stored before the pass can release the schedule, so a later pass never races to store its handle
    /// first. Handles of finished passes are reaped here.
    pub fn spawn<F>(&self, name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handles = self.handles.lock();
        let handle = std::thread::Builder::new().name(name).spawn(f)?;
        let (finished, running): (Vec<_>, Vec<_>) = handles.drain(..).partition(|handle| handle.is_finished());
        *handles = running;
        handles.push(handle);
        drop(handles);
        finished.into_iter().for_each(Self::join_handle);
        Ok(())
    }

    /// Join every background thread, except the calling one.
    pub fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        handles.into_iter().for_each(Self::join_handle);
    }

    fn join_handle(handle: JoinHandle<()>) {
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::warn!("[evictor]: background pass panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc},
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_pass_exclusive() {
        let evictor = Evictor::default();
        let guard = evictor.try_begin_pass().unwrap();
        assert!(evictor.try_begin_pass().is_none());
        drop(guard);
        assert!(evictor.try_begin_pass().is_some());
    }

    #[test]
    fn test_schedule_coalesces() {
        let evictor = Evictor::default();
        assert!(evictor.try_schedule());
        assert!(!evictor.try_schedule());
        assert!(evictor.is_scheduled());
        evictor.finish_schedule();
        assert!(evictor.try_schedule());
    }

    #[test]
    fn test_join() {
        let evictor = Evictor::default();
        evictor.join();
        evictor.spawn("test-evictor".to_string(), || {}).unwrap();
        evictor.join();
        assert!(evictor.handles.lock().is_empty());
    }

    #[test]
    fn test_spawn_keeps_every_running_pass() {
        let evictor = Arc::new(Evictor::default());
        let (tx, rx) = mpsc::channel::<()>();

        // A pass that releases the schedule at once and then lingers.
        assert!(evictor.try_schedule());
        let e = evictor.clone();
        evictor
            .spawn("test-evictor".to_string(), move || {
                e.finish_schedule();
                let _ = rx.recv();
            })
            .unwrap();
        while evictor.is_scheduled() {
            std::thread::yield_now();
        }

        // The schedule is free again while the first pass still runs.
        assert!(evictor.try_schedule());
        let e = evictor.clone();
        evictor.spawn("test-evictor".to_string(), move || e.finish_schedule()).unwrap();
        assert_eq!(evictor.handles.lock().len(), 2);

        drop(tx);
        evictor.join();
        assert!(evictor.handles.lock().is_empty());
        assert!(!evictor.is_scheduled());
    }

    #[test]
    fn test_finish_waits_for_handle() {
        let evictor = Arc::new(Evictor::default());
        assert!(evictor.try_schedule());
        let handles = evictor.handles.lock();
        let e = evictor.clone();
        let pass = std::thread::spawn(move || e.finish_schedule());
        std::thread::sleep(Duration::from_millis(50));
        // Still held back by the spawner.
        assert!(evictor.is_scheduled());
        drop(handles);
        pass.join().unwrap();
        assert!(!evictor.is_scheduled());
    }
}
