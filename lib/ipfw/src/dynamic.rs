// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! A cell holding an immutable, atomically replaceable value.
//!
//! Readers take a [`Snapshot`] (an `Arc` to the current value plus the
//! epoch it was published at) and then work lock-free on it for as
//! long as they like. Writers build a complete replacement and
//! publish it with [`Dynamic::store`]; every load that starts after
//! `store` returns sees the new value. Values being read by in-flight
//! readers stay alive until the last snapshot is dropped.

use crate::ddi::sync::KRwLock;
use crate::ddi::sync::KRwLockType;
use core::fmt::Debug;
use core::ops::Deref;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::sync::Arc;

pub struct Dynamic<T> {
    inner: KRwLock<Arc<T>>,
    epoch: AtomicU64,
}

#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Arc<T>,
    pub epoch: u64,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self { value: Arc::clone(&self.value), epoch: self.epoch }
    }
}

impl<T> From<T> for Dynamic<T> {
    fn from(value: T) -> Self {
        let mut inner = KRwLock::new(value.into());
        inner.init(KRwLockType::Driver);

        Self { inner, epoch: AtomicU64::default() }
    }
}

impl<T> Dynamic<T> {
    /// Publish a new value, returning its epoch.
    pub fn store(&self, value: T) -> u64 {
        let mut inner = self.inner.write();
        *inner = value.into();
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn load(&self) -> Snapshot<T> {
        let value_locked = self.inner.read();
        let value = Arc::clone(&*value_locked);
        let epoch = self.epoch.load(Ordering::SeqCst);

        Snapshot { epoch, value }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

impl<T: Debug> Debug for Dynamic<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let current_val = self.load();
        write!(f, "{current_val:?}")
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn old_snapshot_survives_store() {
        let d = Dynamic::from(vec![1, 2, 3]);
        let before = d.load();
        assert_eq!(before.epoch, 0);

        assert_eq!(d.store(vec![4]), 1);
        let after = d.load();

        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*after, vec![4]);
        assert_eq!(after.epoch, 1);
        assert_eq!(d.epoch(), 1);
    }
}
