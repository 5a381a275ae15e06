// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Moments, TTLs and periodics.

use super::sync::KCondvar;
use super::sync::KMutex;
use core::fmt;
use core::ops::Add;
use core::time::Duration;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A point in time, in milliseconds since the origin of the clock
/// that produced it. Moments from different clocks are not
/// comparable.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment(u64);

impl Moment {
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * MILLIS)
    }

    pub fn raw_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / MILLIS
    }

    /// Milliseconds from `earlier` to `self`, zero if `earlier` is in
    /// the future.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Add<Ttl> for Moment {
    type Output = Self;

    fn add(self, rhs: Ttl) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for Moment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}", self.0 / MILLIS, self.0 % MILLIS)
    }
}

/// A lifetime, in milliseconds.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Ttl(u64);

impl Ttl {
    pub const fn new_seconds(seconds: u64) -> Self {
        Ttl(seconds * MILLIS)
    }

    pub fn as_seconds(&self) -> u64 {
        self.0 / MILLIS
    }

    pub fn as_milliseconds(&self) -> u64 {
        self.0
    }

    /// Is something last refreshed at `since` expired at `now`?
    pub fn is_expired(&self, since: Moment, now: Moment) -> bool {
        now.delta_as_millis(since) >= self.0
    }
}

impl From<Ttl> for Duration {
    fn from(ttl: Ttl) -> Self {
        Duration::from_millis(ttl.0)
    }
}

struct PeriodicState {
    stop: KMutex<bool>,
    cv: KCondvar,
}

/// Run a callback on a background thread every `interval` until the
/// handle is dropped. Dropping the handle waits for an in-progress
/// callback to finish.
pub struct Periodic {
    state: Arc<PeriodicState>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    pub fn new<F>(name: &str, interval: Duration, mut cb: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let state = Arc::new(PeriodicState {
            stop: KMutex::new(false),
            cv: KCondvar::new(),
        });
        let thread_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    let stop = thread_state.stop.lock();
                    let stop = thread_state.cv.wait_timeout(stop, interval);
                    if *stop {
                        break;
                    }
                    drop(stop);
                    cb();
                }
            })
            .ok();

        Self { state, handle }
    }

    /// Did the background thread start?
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        *self.state.stop.lock() = true;
        self.state.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
