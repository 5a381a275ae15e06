// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Synchronization primitives.
//!
//! The engine only ever names these wrappers, never `std::sync`
//! directly, so that the lock flavor used by the rule chain, the
//! dynamic state table and the timers can be changed in one place.
//!
//! A poisoned lock means another thread panicked while mutating the
//! protected data; every wrapper treats that as fatal.

use core::ops::Deref;
use core::ops::DerefMut;
use core::time::Duration;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::RwLock;

/// The kind of lock being created. Only a hint for diagnostics.
#[derive(Clone, Copy, Debug)]
pub enum KRwLockType {
    Driver,
    Default,
}

/// A mutual exclusion lock.
pub struct KMutex<T> {
    inner: Mutex<T>,
}

pub struct KMutexGuard<'a, T: 'a> {
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KMutex<T> {
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap()
    }

    pub fn new(val: T) -> Self {
        KMutex { inner: Mutex::new(val) }
    }

    pub fn lock(&self) -> KMutexGuard<'_, T> {
        let guard = self.inner.lock().unwrap();
        KMutexGuard { guard }
    }
}

impl<T: Default> Default for KMutex<T> {
    fn default() -> Self {
        KMutex::new(T::default())
    }
}

/// A reader/writer lock.
pub struct KRwLock<T> {
    inner: RwLock<T>,
}

pub struct KRwLockReadGuard<'a, T: 'a> {
    guard: std::sync::RwLockReadGuard<'a, T>,
}

pub struct KRwLockWriteGuard<'a, T: 'a> {
    guard: std::sync::RwLockWriteGuard<'a, T>,
}

impl<T> Deref for KRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> Deref for KRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for KRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<T> KRwLock<T> {
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap()
    }

    pub fn new(val: T) -> Self {
        KRwLock { inner: RwLock::new(val) }
    }

    pub fn init(&mut self, _typ: KRwLockType) {}

    pub fn read(&self) -> KRwLockReadGuard<'_, T> {
        let guard = self.inner.read().unwrap();
        KRwLockReadGuard { guard }
    }

    pub fn write(&self) -> KRwLockWriteGuard<'_, T> {
        let guard = self.inner.write().unwrap();
        KRwLockWriteGuard { guard }
    }
}

/// A condition variable paired with a [`KMutex`].
pub struct KCondvar {
    cv: Condvar,
}

impl Default for KCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl KCondvar {
    pub fn new() -> Self {
        Self { cv: Condvar::new() }
    }

    pub fn notify_one(&self) {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) {
        self.cv.notify_all()
    }

    pub fn wait<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
    ) -> KMutexGuard<'a, T> {
        KMutexGuard { guard: self.cv.wait(lock.guard).unwrap() }
    }

    /// Wait until notified or until `timeout` elapses, whichever is
    /// first. Spurious wakeups are possible.
    pub fn wait_timeout<'a, T: 'a>(
        &self,
        lock: KMutexGuard<'a, T>,
        timeout: Duration,
    ) -> KMutexGuard<'a, T> {
        let (guard, _) = self.cv.wait_timeout(lock.guard, timeout).unwrap();
        KMutexGuard { guard }
    }
}
