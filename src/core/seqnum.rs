//! Wrap-aware 16-bit sequence numbers for update conflict resolution.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-entry version counter carried on assign/update messages.
///
/// Ordering is circular: `a < b` when `b` is ahead of `a` by less than half
/// the 16-bit space. A pair exactly 32768 apart has no defined order, so
/// `partial_cmp` returns `None` for it. Equality means the incoming message
/// is a duplicate and is dropped.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(u16);

impl SequenceNumber {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(self) -> u16 {
        self.0
    }

    /// Advance to the next sequence number, wrapping at 2^16.
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    fn precedes(self, other: SequenceNumber) -> bool {
        if self.0 == other.0 {
            return false;
        }
        if self.0 < other.0 {
            other.0 - self.0 < 32768
        } else {
            self.0 - other.0 > 32768
        }
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.0 == other.0 {
            Some(Ordering::Equal)
        } else if self.precedes(*other) {
            Some(Ordering::Less)
        } else if other.precedes(*self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl From<u16> for SequenceNumber {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceNumber({})", self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
