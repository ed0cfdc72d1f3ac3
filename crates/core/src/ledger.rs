// Copyright The RQD Authors
// SPDX-License-Identifier: Apache-2.0

//! Core accounting in centi-core units.
//!
//! Four counters partition the host's capacity: `locked` (withheld from
//! scheduling), `idle` (free for booking), `booked` (reserved by running
//! frames), with `total` as the invariant ceiling. The ledger also owns the
//! hyperthread pin pool: frames marked threadable get a set of logical CPU
//! indices reserved for the lifetime of their booking.
//!
//! The ledger has no lock of its own; the supervisor serializes every
//! mutation and snapshot under its single mutex. Counter corruption is
//! clamped and logged at error level, never a panic.

use crate::error::Error;
use rqd_machine::platform::CoreTopology;
use rqd_report::CoreDetail;
use std::collections::{BTreeSet, HashMap};
use tracing::error;

/// Thread-unsafe core accounting; callers serialize access.
#[derive(Debug)]
pub struct CoreLedger {
    total: u32,
    locked: u32,
    idle: u32,
    booked: u32,
    free_threads: BTreeSet<usize>,
    pinned: HashMap<String, Vec<usize>>,
}

impl CoreLedger {
    /// Creates a ledger with all probed cores idle. The pin pool is seeded
    /// only on hyperthreaded hosts.
    pub fn new(topology: &CoreTopology) -> Self {
        let free_threads = if topology.hyperthreaded() {
            topology.logical_cpus.iter().copied().collect()
        } else {
            BTreeSet::new()
        };
        Self {
            total: topology.total_cores,
            locked: 0,
            idle: topology.total_cores,
            booked: 0,
            free_threads,
            pinned: HashMap::new(),
        }
    }

    /// Books `num_cores` for `frame_id`, pinning hyperthreads when
    /// `threadable`. Returns the pin set (empty when pinning is
    /// unavailable; the reservation still succeeds).
    pub fn reserve(
        &mut self,
        frame_id: &str,
        num_cores: u32,
        threadable: bool,
    ) -> Result<Vec<usize>, Error> {
        if self.idle < num_cores {
            return Err(Error::CoreReservationFailure {
                reason: format!(
                    "insufficient idle cores: requested {num_cores}, idle {}",
                    self.idle
                ),
            });
        }
        self.idle -= num_cores;
        self.booked += num_cores;

        let mut pin_set = Vec::new();
        if threadable {
            let want = (num_cores / 100) as usize;
            if want > 0 && self.free_threads.len() >= want {
                pin_set = self.free_threads.iter().take(want).copied().collect();
                for cpu in &pin_set {
                    let _ = self.free_threads.remove(cpu);
                }
                // Extend rather than replace: two bookings can race on one
                // frame id, and the first release returns everything.
                self.pinned
                    .entry(frame_id.to_owned())
                    .or_default()
                    .extend(pin_set.iter().copied());
            }
        }
        self.assert_sane();
        Ok(pin_set)
    }

    /// Returns `num_cores` booked by `frame_id`, together with any pinned
    /// hyperthreads. Cores locked away while the frame ran are absorbed
    /// rather than credited back to idle.
    pub fn release(&mut self, frame_id: &str, num_cores: u32) {
        self.booked = self.booked.saturating_sub(num_cores);
        let slack = self
            .total
            .saturating_sub(self.locked)
            .saturating_sub(self.idle)
            .saturating_sub(self.booked);
        if slack > 0 {
            self.idle += slack.min(num_cores);
        }
        if let Some(pin_set) = self.pinned.remove(frame_id) {
            self.free_threads.extend(pin_set);
        }
        self.assert_sane();
    }

    /// Withholds up to `num_cores` from scheduling. Returns whether the
    /// counters changed.
    pub fn lock(&mut self, num_cores: u32) -> bool {
        let num_lock = (self.total - self.locked).min(num_cores);
        if num_lock == 0 {
            return false;
        }
        self.locked += num_lock;
        self.idle -= num_lock.min(self.idle);
        self.assert_sane();
        true
    }

    /// Withholds every core. Returns whether the counters changed.
    pub fn lock_all(&mut self) -> bool {
        if self.locked >= self.total {
            return false;
        }
        self.locked = self.total;
        self.idle = 0;
        true
    }

    /// Releases up to `num_cores` from the locked pool. The freed amount is
    /// credited back to idle unless the idle lock holds the host.
    pub fn unlock(&mut self, num_cores: u32, idle_locked: bool) -> bool {
        let num_unlock = self.locked.min(num_cores);
        if num_unlock == 0 {
            return false;
        }
        self.locked -= num_unlock;
        if !idle_locked {
            self.idle += num_unlock;
        }
        self.assert_sane();
        true
    }

    /// Releases every locked core; credits idle unless the idle lock holds
    /// the host.
    pub fn unlock_all(&mut self, idle_locked: bool) -> bool {
        let locked = self.locked;
        self.unlock(locked, idle_locked)
    }

    /// Current counters by value.
    pub fn snapshot(&self) -> CoreDetail {
        CoreDetail {
            total_cores: self.total,
            locked_cores: self.locked,
            idle_cores: self.idle,
            booked_cores: self.booked,
        }
    }

    /// Logical CPUs currently free for pinning.
    pub fn free_thread_count(&self) -> usize {
        self.free_threads.len()
    }

    fn assert_sane(&mut self) {
        if self.idle > self.total {
            error!(
                idle = self.idle,
                total = self.total,
                "idle cores have become greater than total cores"
            );
            self.idle = self.total;
        }
        if self.locked + self.idle + self.booked > self.total {
            error!(
                locked = self.locked,
                idle = self.idle,
                booked = self.booked,
                total = self.total,
                "core counters exceed host capacity"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn four_core_ledger() -> CoreLedger {
        CoreLedger::new(&CoreTopology::new(4, 4))
    }

    fn smt_ledger() -> CoreLedger {
        CoreLedger::new(&CoreTopology::new(4, 8))
    }

    fn counts(ledger: &CoreLedger) -> (u32, u32, u32, u32) {
        let s = ledger.snapshot();
        (s.total_cores, s.locked_cores, s.idle_cores, s.booked_cores)
    }

    #[test]
    fn reserve_and_release_round_trip() {
        let mut ledger = four_core_ledger();
        let pin = ledger.reserve("f1", 100, false).expect("reserve");
        assert!(pin.is_empty());
        assert_eq!(counts(&ledger), (400, 0, 300, 100));
        ledger.release("f1", 100);
        assert_eq!(counts(&ledger), (400, 0, 400, 0));
    }

    #[test]
    fn reserve_fails_when_idle_is_short() {
        let mut ledger = four_core_ledger();
        assert!(ledger.lock(350));
        match ledger.reserve("f1", 100, false) {
            Err(Error::CoreReservationFailure { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(counts(&ledger), (400, 350, 50, 0));
    }

    #[test]
    fn threadable_reserve_pins_hyperthreads() {
        let mut ledger = smt_ledger();
        let pin = ledger.reserve("f1", 200, true).expect("reserve");
        assert_eq!(pin.len(), 2);
        assert_eq!(ledger.free_thread_count(), 6);
        ledger.release("f1", 200);
        assert_eq!(ledger.free_thread_count(), 8);
        assert_eq!(counts(&ledger), (400, 0, 400, 0));
    }

    #[test]
    fn pinning_unavailable_without_smt() {
        let mut ledger = four_core_ledger();
        let pin = ledger.reserve("f1", 200, true).expect("reserve");
        assert!(pin.is_empty());
        assert_eq!(counts(&ledger), (400, 0, 200, 200));
    }

    #[test]
    fn sub_core_reservation_never_pins() {
        let mut ledger = smt_ledger();
        let pin = ledger.reserve("f1", 50, true).expect("reserve");
        assert!(pin.is_empty());
        assert_eq!(counts(&ledger), (400, 0, 350, 50));
    }

    #[test]
    fn release_absorbs_cores_locked_mid_flight() {
        let mut ledger = four_core_ledger();
        let _ = ledger.reserve("f1", 200, false).expect("reserve");
        assert!(ledger.lock_all());
        assert_eq!(counts(&ledger), (400, 400, 0, 200));
        // The freed cores are absorbed by the lock rather than credited.
        ledger.release("f1", 200);
        assert_eq!(counts(&ledger), (400, 400, 0, 0));
    }

    #[test]
    fn lock_saturates_and_drains_idle_first() {
        let mut ledger = four_core_ledger();
        assert!(ledger.lock(300));
        assert_eq!(counts(&ledger), (400, 300, 100, 0));
        assert!(ledger.lock(500));
        assert_eq!(counts(&ledger), (400, 400, 0, 0));
        assert!(!ledger.lock(1));
    }

    #[test]
    fn unlock_respects_the_idle_lock() {
        let mut ledger = four_core_ledger();
        assert!(ledger.lock_all());
        assert!(ledger.unlock(100, true));
        assert_eq!(counts(&ledger), (400, 300, 0, 0));
        assert!(ledger.unlock_all(false));
        assert_eq!(counts(&ledger), (400, 0, 300, 0));
    }

    #[test]
    fn unlock_all_while_idle_locked_keeps_cores_out() {
        let mut ledger = four_core_ledger();
        assert!(ledger.lock_all());
        assert!(ledger.unlock_all(true));
        assert_eq!(counts(&ledger), (400, 0, 0, 0));
    }

    #[test]
    fn conservation_over_a_mixed_sequence() {
        let mut ledger = smt_ledger();
        let _ = ledger.reserve("a", 100, true).expect("reserve a");
        let _ = ledger.reserve("b", 150, false).expect("reserve b");
        assert!(ledger.lock(100));
        ledger.release("a", 100);
        ledger.release("b", 150);
        assert!(ledger.unlock_all(false));
        let (total, locked, idle, booked) = counts(&ledger);
        assert_eq!(total, 400);
        assert_eq!(locked, 0);
        assert_eq!(booked, 0);
        assert_eq!(idle, 400);
        assert_eq!(ledger.free_thread_count(), 8);
    }

    #[test]
    fn release_of_unknown_booking_clamps() {
        let mut ledger = four_core_ledger();
        // A stray release must not push counters negative or above total.
        ledger.release("ghost", 500);
        let (total, locked, idle, booked) = counts(&ledger);
        assert_eq!((total, locked, booked), (400, 0, 0));
        assert!(idle <= total);
    }
}
