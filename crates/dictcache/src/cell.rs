//! Direct-mapped cell table
//!
//! One cell per slot, slot chosen by a mixing 64-bit hash of the key
//! masked down to the table's power-of-two capacity. No chaining: a
//! colliding key simply replaces whatever lived in the slot.

use std::hash::BuildHasher;
use std::time::Instant;

use ahash::RandomState;

/// Metadata for one slot: the resident key and its expiration deadline
///
/// A key of 0 marks a slot that was never populated.
#[derive(Debug, Clone, Copy)]
pub struct Cell {
    /// Resident key, 0 when empty
    pub key: u64,

    /// Deadline after which the resident value is stale
    pub expires_at: Instant,
}

/// Outcome of probing a slot for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// Slot holds the key and the value is fresh
    Hit,
    /// Slot holds the key but the deadline has passed
    Stale,
    /// Slot holds a different key, or was never populated
    Miss,
}

/// Fixed-size array of cells plus the slot hasher
///
/// Cells are allocated once and stay resident for the table's lifetime.
pub struct CellTable {
    cells: Box<[Cell]>,
    mask: u64,
    hasher: RandomState,
}

impl CellTable {
    /// Create a table with `capacity` slots
    ///
    /// `capacity` must be a power of two; the caller rounds up before
    /// construction.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());

        let empty = Cell {
            key: 0,
            expires_at: Instant::now(),
        };

        Self {
            cells: vec![empty; capacity].into_boxed_slice(),
            mask: capacity as u64 - 1,
            hasher: RandomState::new(),
        }
    }

    /// The only slot this table will ever use for `key`
    pub fn slot_of(&self, key: u64) -> usize {
        (self.hasher.hash_one(key) & self.mask) as usize
    }

    /// Classify `key` against its slot at instant `now`
    pub fn probe(&self, key: u64, now: Instant) -> (usize, CellState) {
        let slot = self.slot_of(key);
        let cell = &self.cells[slot];

        let state = if cell.key != key {
            CellState::Miss
        } else if now >= cell.expires_at {
            CellState::Stale
        } else {
            CellState::Hit
        };

        (slot, state)
    }

    /// Install `key` at `slot` with the given deadline, replacing any
    /// previous resident unconditionally
    pub fn install(&mut self, slot: usize, key: u64, expires_at: Instant) {
        self.cells[slot] = Cell { key, expires_at };
    }

    /// The cell at `slot`
    pub fn cell(&self, slot: usize) -> &Cell {
        &self.cells[slot]
    }
}
