//! Deterministic cache model.
//!
//! Tracks residency per 64-byte line and advances a virtual clock on every
//! access: [`SimulatedCache::HIT_COST`] ticks for a resident line,
//! [`SimulatedCache::MISS_COST`] for a cold one. Flushes and barriers cost
//! nothing but are counted. There is no capacity limit and no speculation, so a simulated
//! leakage campaign never shows the speculative signal.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;

use super::ProbeOps;

const LINE: usize = 64;

#[derive(Debug)]
pub struct SimulatedCache {
    resident: RefCell<HashSet<usize>>,
    now: Cell<u64>,
    hit_cost: u64,
    miss_cost: u64,
    flushes: Cell<u64>,
    barriers: Cell<u64>,
}

impl Default for SimulatedCache {
    fn default() -> Self {
        Self::with_costs(Self::HIT_COST, Self::MISS_COST)
    }
}

impl SimulatedCache {
    pub const HIT_COST: u64 = 40;
    pub const MISS_COST: u64 = 300;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_costs(hit_cost: u64, miss_cost: u64) -> Self {
        Self {
            resident: RefCell::new(HashSet::new()),
            now: Cell::new(0),
            hit_cost,
            miss_cost,
            flushes: Cell::new(0),
            barriers: Cell::new(0),
        }
    }

    /// Whether the line holding `addr` is currently cached.
    pub fn is_resident(&self, addr: *const u8) -> bool {
        self.resident.borrow().contains(&line_of(addr))
    }

    /// Number of lines currently cached.
    pub fn resident_lines(&self) -> usize {
        self.resident.borrow().len()
    }

    /// Total flush operations issued so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.get()
    }

    /// Total barriers issued so far, including those inside timestamps.
    pub fn barrier_count(&self) -> u64 {
        self.barriers.get()
    }

    fn touch(&self, addr: *const u8) {
        let cost = if self.resident.borrow_mut().insert(line_of(addr)) {
            self.miss_cost
        } else {
            self.hit_cost
        };
        self.now.set(self.now.get() + cost);
    }
}

fn line_of(addr: *const u8) -> usize {
    addr.addr() & !(LINE - 1)
}

impl ProbeOps for SimulatedCache {
    unsafe fn flush(&self, addr: *const u8) {
        self.resident.borrow_mut().remove(&line_of(addr));
        self.flushes.set(self.flushes.get() + 1);
    }

    unsafe fn load(&self, addr: *const u8) {
        self.touch(addr);
    }

    unsafe fn store(&self, addr: *mut u8) {
        self.touch(addr);
    }

    fn barrier(&self) {
        self.barriers.set(self.barriers.get() + 1);
    }

    fn clock(&self) -> u64 {
        self.now.get()
    }
}
