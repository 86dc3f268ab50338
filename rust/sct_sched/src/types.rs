//! Newtype wrappers for the identifiers that flow between the event
//! stream, the tracker and the strategies.
//!
//! Thread indices are signed so that the "no thread" sentinel of the
//! instrumentation layer (-1) survives a round trip through the wire
//! records unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Thread identifier, assigned in creation order starting at 0 and never
/// reused within a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThreadIndex(pub i32);

impl ThreadIndex {
    /// Sentinel for "no thread" (e.g. the parent of the main thread).
    pub const NONE: ThreadIndex = ThreadIndex(-1);

    pub fn is_none(self) -> bool {
        self.0 < 0
    }

    /// Position of this thread in per-thread tables.
    ///
    /// Only meaningful for real threads; callers check `is_none` first.
    pub fn slot(self) -> usize {
        self.0 as usize
    }

    pub fn from_slot(slot: usize) -> Self {
        ThreadIndex(slot as i32)
    }
}

impl fmt::Display for ThreadIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "T-")
        } else {
            write!(f, "T{}", self.0)
        }
    }
}

/// A synchronisation object (mutex, condition variable, barrier) as seen
/// by the instrumentation layer. Usually the object's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{:#x}", self.0)
    }
}

/// Identifier of a loaded image in the static-info registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub u64);

/// Identifier of an instruction in the static-info registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstId(pub u64);

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Runtime virtual address.
pub type Address = u64;

/// 64-bit FNV-1a. Unlike the std hashers its output is fixed across
/// toolchains, so values derived from it may be persisted.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Fnv1a(0xcbf2_9ce4_8422_2325)
    }
}

impl Fnv1a {
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}
