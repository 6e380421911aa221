// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cancellation support for the blocking points: pacing sleeps and status
//! waits.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

/// Wakes a blocked operation when the token it registered with is cancelled.
///
/// Implementations must take whatever lock their blocked side waits under
/// before signaling, so that wakeups are never missed.
pub(crate) trait Notify: Send + Sync {
    fn notify(&self);
}

/// A cloneable token used to interrupt blocking null modem operations.
///
/// Cancelling any clone interrupts every pacing sleep and status wait the
/// token was handed to. Cancellation is sticky: a cancelled token never
/// blocks again.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    sleep_lock: Mutex<()>,
    sleepers: Condvar,
    next_watch: AtomicU64,
    watchers: Mutex<Vec<(u64, Weak<dyn Notify>)>>,
}

impl CancelToken {
    /// Creates a token in the uncancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the token, waking every blocked operation registered with it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        {
            let _guard = self.inner.sleep_lock.lock();
            self.inner.sleepers.notify_all();
        }
        let watchers: Vec<_> = self
            .inner
            .watchers
            .lock()
            .iter()
            .filter_map(|(_, watcher)| watcher.upgrade())
            .collect();
        for watcher in watchers {
            watcher.notify();
        }
    }

    /// Sleeps for `duration`, returning false if the token was cancelled
    /// before the time elapsed.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.sleep_lock.lock();
        while !self.is_cancelled() {
            if self
                .inner
                .sleepers
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return true;
            }
        }
        false
    }

    /// Registers `target` to be woken on cancellation for the lifetime of
    /// the returned guard.
    pub(crate) fn watch(&self, target: Arc<dyn Notify>) -> WatchGuard<'_> {
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers
            .lock()
            .push((id, Arc::downgrade(&target)));
        WatchGuard { token: self, id }
    }
}

/// Deregisters a watcher when dropped.
pub(crate) struct WatchGuard<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.token
            .inner
            .watchers
            .lock()
            .retain(|(id, _)| *id != self.id);
    }
}
