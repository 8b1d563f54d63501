// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-key concurrent index.
//!
//! Values are stored under a primary key and reachable through a secondary
//! key as well. A secondary key belongs to at most one primary key.
//!
//! # Design
//! - Every write updates the primary map first with one atomic per-key
//!   operation, then moves the secondary map over with compare-and-set style
//!   transitions retried until they land.
//! - No lock spans both maps. Each single-key step is a `DashMap` entry
//!   operation (shard-local).
//! - Each failed transition checks whether another live primary owns the
//!   wanted secondary key. If so the primary change is undone and the call
//!   fails with [`Error::InvariantViolation`].

use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::error::{Error, Result};

const PENDING: u8 = 0;
const INSTALLED: u8 = 1;
/// Never reached the secondary map and never will
const ABANDONED: u8 = 2;

struct DualKeyEntry<P, S, V> {
    primary: P,
    secondary: S,
    value: V,
    state: AtomicU8,
}

impl<P, S, V> DualKeyEntry<P, S, V> {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }
}

type Shared<P, S, V> = Arc<DualKeyEntry<P, S, V>>;

/// Concurrent map with a primary and a secondary key per value.
///
/// # Example
/// ```
/// use nerve::DualKeyIndex;
///
/// let index = DualKeyIndex::new();
/// index.put(1u64, "alpha", 10).unwrap();
/// assert_eq!(index.get(&1), Some(10));
/// assert_eq!(index.get_secondary(&"alpha"), Some(10));
///
/// // "alpha" already belongs to primary 1
/// assert!(index.put(2u64, "alpha", 20).is_err());
/// assert_eq!(index.get(&2), None);
/// ```
pub struct DualKeyIndex<P, S, V> {
    primary: DashMap<P, Shared<P, S, V>>,
    secondary: DashMap<S, Shared<P, S, V>>,
}

impl<P, S, V> DualKeyIndex<P, S, V>
where
    P: Eq + Hash + Clone,
    S: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            primary: DashMap::new(),
            secondary: DashMap::new(),
        }
    }

    /// Map `primary` and `secondary` to `value`, returning the value the
    /// primary key held before.
    pub fn put(&self, primary: P, secondary: S, value: V) -> Result<Option<V>> {
        let entry = Arc::new(DualKeyEntry {
            primary: primary.clone(),
            secondary,
            value,
            state: AtomicU8::new(PENDING),
        });
        let old = self.primary.insert(primary, Arc::clone(&entry));

        match &old {
            None => self.claim(&entry, None, None)?,
            Some(prev) if prev.secondary == entry.secondary => {
                self.claim(&entry, Some(prev), Some(prev))?;
            }
            Some(prev) => {
                self.claim(&entry, None, Some(prev))?;
                self.release(prev);
            }
        }
        Ok(old.map(|prev| prev.value.clone()))
    }

    /// Map the keys to `value` only if `primary` is unmapped.
    ///
    /// Returns the existing value when the primary key is already present.
    pub fn put_if_absent(&self, primary: P, secondary: S, value: V) -> Result<Option<V>> {
        let entry = Arc::new(DualKeyEntry {
            primary: primary.clone(),
            secondary,
            value,
            state: AtomicU8::new(PENDING),
        });
        match self.primary.entry(primary) {
            MapEntry::Occupied(existing) => return Ok(Some(existing.get().value.clone())),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
            }
        }
        self.claim(&entry, None, None)?;
        Ok(None)
    }

    /// Remove the value under `primary` and its secondary key.
    pub fn remove(&self, primary: &P) -> Option<V> {
        let (_, old) = self.primary.remove(primary)?;
        self.release(&old);
        Some(old.value.clone())
    }

    /// Value under a primary key.
    pub fn get(&self, primary: &P) -> Option<V> {
        self.primary.get(primary).map(|e| e.value.clone())
    }

    /// Value under a secondary key.
    pub fn get_secondary(&self, secondary: &S) -> Option<V> {
        self.secondary.get(secondary).map(|e| e.value.clone())
    }

    /// Snapshot of the primary keys.
    pub fn primary_keys(&self) -> Vec<P> {
        self.primary.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of the values.
    pub fn values(&self) -> Vec<V> {
        self.primary.iter().map(|e| e.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    // ========================================================================
    // Secondary map transitions
    // ========================================================================

    /// Install `entry` under its secondary key, replacing `from` if given.
    ///
    /// On conflict the primary map is reverted to `revert_to` (or cleared).
    fn claim(
        &self,
        entry: &Shared<P, S, V>,
        from: Option<&Shared<P, S, V>>,
        revert_to: Option<&Shared<P, S, V>>,
    ) -> Result<()> {
        loop {
            let from = from.filter(|f| f.state() != ABANDONED);
            let landed = match from {
                None => match self.secondary.entry(entry.secondary.clone()) {
                    MapEntry::Vacant(vacant) => {
                        vacant.insert(Arc::clone(entry));
                        true
                    }
                    MapEntry::Occupied(_) => false,
                },
                Some(from) => match self.secondary.entry(entry.secondary.clone()) {
                    MapEntry::Occupied(mut slot) if Arc::ptr_eq(slot.get(), from) => {
                        slot.insert(Arc::clone(entry));
                        true
                    }
                    _ => false,
                },
            };
            if landed {
                entry.set_state(INSTALLED);
                return Ok(());
            }

            if self.owned_elsewhere(entry) {
                self.rollback(entry, revert_to);
                return Err(Error::InvariantViolation(
                    "secondary key already belongs to another primary key".into(),
                ));
            }
            thread::yield_now();
        }
    }

    /// Remove `old` from the secondary map once it is (or will never be) there.
    fn release(&self, old: &Shared<P, S, V>) {
        loop {
            if old.state() == ABANDONED {
                return;
            }
            if self
                .secondary
                .remove_if(&old.secondary, |_, cur| Arc::ptr_eq(cur, old))
                .is_some()
            {
                return;
            }
            thread::yield_now();
        }
    }

    /// Whether the secondary key of `entry` is held by a different, live primary.
    fn owned_elsewhere(&self, entry: &Shared<P, S, V>) -> bool {
        let holder = match self.secondary.get(&entry.secondary) {
            Some(holder) => Arc::clone(holder.value()),
            None => return false,
        };
        if Arc::ptr_eq(&holder, entry) || holder.primary == entry.primary {
            return false;
        }
        self.primary
            .get(&holder.primary)
            .is_some_and(|cur| Arc::ptr_eq(cur.value(), &holder))
    }

    fn rollback(&self, entry: &Shared<P, S, V>, revert_to: Option<&Shared<P, S, V>>) {
        let revert_to = revert_to.filter(|prev| prev.state() != ABANDONED);
        let reverted = match revert_to {
            None => self
                .primary
                .remove_if(&entry.primary, |_, cur| Arc::ptr_eq(cur, entry))
                .is_some(),
            Some(prev) => match self.primary.entry(entry.primary.clone()) {
                MapEntry::Occupied(mut slot) if Arc::ptr_eq(slot.get(), entry) => {
                    slot.insert(Arc::clone(prev));
                    true
                }
                _ => false,
            },
        };
        entry.set_state(ABANDONED);
        if !reverted {
            log::debug!("[dual-key] primary key changed concurrently, nothing to revert");
        }
    }
}

impl<P, S, V> Default for DualKeyIndex<P, S, V>
where
    P: Eq + Hash + Clone,
    S: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl<P, S, V> DualKeyIndex<P, S, V>
    where
        P: Eq + Hash + Clone,
        S: Eq + Hash + Clone,
        V: Clone,
    {
        fn is_consistent(&self) -> bool {
            if self.primary.len() != self.secondary.len() {
                return false;
            }
            self.primary.iter().all(|e| {
                self.secondary
                    .get(&e.value().secondary)
                    .is_some_and(|s| Arc::ptr_eq(s.value(), e.value()))
            })
        }
    }

    #[test]
    fn test_put_get() {
        let index = DualKeyIndex::new();
        assert_eq!(index.put(1, 'a', "one").unwrap(), None);
        assert_eq!(index.put(2, 'b', "two").unwrap(), None);

        assert_eq!(index.get(&1), Some("one"));
        assert_eq!(index.get_secondary(&'b'), Some("two"));
        assert_eq!(index.len(), 2);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_put_replaces_value_same_secondary() {
        let index = DualKeyIndex::new();
        index.put(1, 'a', 10).unwrap();
        assert_eq!(index.put(1, 'a', 11).unwrap(), Some(10));
        assert_eq!(index.get_secondary(&'a'), Some(11));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_put_moves_secondary() {
        let index = DualKeyIndex::new();
        index.put(1, 'a', 10).unwrap();
        assert_eq!(index.put(1, 'b', 11).unwrap(), Some(10));
        assert_eq!(index.get_secondary(&'a'), None);
        assert_eq!(index.get_secondary(&'b'), Some(11));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_put_if_absent() {
        let index = DualKeyIndex::new();
        assert_eq!(index.put_if_absent(1, 'a', 10).unwrap(), None);
        assert_eq!(index.put_if_absent(1, 'b', 20).unwrap(), Some(10));
        assert_eq!(index.get_secondary(&'b'), None);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_remove() {
        let index = DualKeyIndex::new();
        index.put(1, 'a', 10).unwrap();
        assert_eq!(index.remove(&1), Some(10));
        assert_eq!(index.remove(&1), None);
        assert_eq!(index.get_secondary(&'a'), None);
        assert!(index.is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_conflict_rolls_back_new_primary() {
        let index = DualKeyIndex::new();
        index.put(1, 'a', 10).unwrap();

        let err = index.put(2, 'a', 20).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(index.get(&2), None);
        assert_eq!(index.get_secondary(&'a'), Some(10));
        assert!(index.is_consistent());

        assert!(index.put_if_absent(3, 'a', 30).is_err());
        assert_eq!(index.get(&3), None);
    }

    #[test]
    fn test_conflict_restores_previous_mapping() {
        let index = DualKeyIndex::new();
        index.put(1, 'a', 10).unwrap();
        index.put(2, 'b', 20).unwrap();

        assert!(index.put(2, 'a', 21).is_err());
        assert_eq!(index.get(&2), Some(20));
        assert_eq!(index.get_secondary(&'b'), Some(20));
        assert_eq!(index.get_secondary(&'a'), Some(10));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_concurrent_consistency() {
        const THREADS: u64 = 4;
        let index = Arc::new(DualKeyIndex::<u64, u32, u64>::new());

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(t + 1);
                    let mut conflicts = 0u32;
                    for _ in 0..5_000 {
                        let primary = t * 100 + rng.u64(0..16);
                        let secondary = rng.u32(0..48);
                        match rng.u8(0..4) {
                            0 => {
                                index.remove(&primary);
                            }
                            1 => {
                                if index.put_if_absent(primary, secondary, primary).is_err() {
                                    conflicts += 1;
                                }
                            }
                            _ => match index.put(primary, secondary, primary) {
                                Ok(_) => {}
                                Err(Error::InvariantViolation(_)) => conflicts += 1,
                                Err(e) => panic!("unexpected error {e}"),
                            },
                        }
                    }
                    conflicts
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert!(index.is_consistent());
        for key in index.primary_keys() {
            let secondary = index.primary.get(&key).map(|e| e.secondary).unwrap();
            assert_eq!(index.get_secondary(&secondary), Some(key));
        }
    }
}
