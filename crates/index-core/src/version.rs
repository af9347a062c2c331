//! Version vectors: per-file causal history.
//!
//! A vector holds one counter per device that ever changed the file. Vectors
//! are never mutated in place; every operation returns a new vector so a
//! record handed to a peer can't change underneath it.

use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// One device's counter within a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: DeviceId,
    pub value: u64,
}

/// Result of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    Equal,
    /// Self has seen everything other has, and more.
    Greater,
    /// Other has seen everything self has, and more.
    Lesser,
    /// Neither includes the other. Also returned when exactly one side is
    /// empty: an empty vector carries no history to order against.
    Concurrent,
}

/// Causal-history token for a file.
///
/// Counters are kept sorted by device ID with no duplicates and no zero
/// values, so derived equality is structural equality. Deserialized vectors
/// are normalized into that form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Counter>", into = "Vec<Counter>")]
pub struct VersionVector {
    counters: Vec<Counter>,
}

impl VersionVector {
    /// The empty vector: "never meaningfully synchronized".
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    /// Counter value for `device`, zero if absent.
    pub fn counter(&self, device: DeviceId) -> u64 {
        self.position(device)
            .map(|i| self.counters[i].value)
            .unwrap_or(0)
    }

    /// Copy of this vector with `device` advanced by one.
    pub fn update(&self, device: DeviceId) -> Self {
        let mut counters = self.counters.clone();
        match self.position(device) {
            Ok(i) => counters[i].value += 1,
            Err(i) => counters.insert(i, Counter { id: device, value: 1 }),
        }
        Self { counters }
    }

    /// Element-wise maximum of both vectors.
    pub fn merge(&self, other: &VersionVector) -> Self {
        let mut merged = self.clone();
        for theirs in &other.counters {
            match merged.position(theirs.id) {
                Ok(i) => merged.counters[i].value = merged.counters[i].value.max(theirs.value),
                Err(i) => merged.counters.insert(i, *theirs),
            }
        }
        merged
    }

    pub fn compare(&self, other: &VersionVector) -> VectorOrdering {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => return VectorOrdering::Equal,
            (true, false) | (false, true) => return VectorOrdering::Concurrent,
            (false, false) => {}
        }

        let mut self_ahead = false;
        let mut other_ahead = false;
        for id in self.counters.iter().chain(other.counters.iter()).map(|c| c.id) {
            let (mine, theirs) = (self.counter(id), other.counter(id));
            if mine > theirs {
                self_ahead = true;
            } else if theirs > mine {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Greater,
            (false, true) => VectorOrdering::Lesser,
            (true, true) => VectorOrdering::Concurrent,
        }
    }

    pub fn greater_equal(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            VectorOrdering::Greater | VectorOrdering::Equal
        )
    }

    pub fn lesser_equal(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            VectorOrdering::Lesser | VectorOrdering::Equal
        )
    }

    pub fn concurrent(&self, other: &VersionVector) -> bool {
        self.compare(other) == VectorOrdering::Concurrent
    }

    fn position(&self, device: DeviceId) -> Result<usize, usize> {
        self.counters.binary_search_by(|c| c.id.cmp(&device))
    }
}

impl From<Vec<Counter>> for VersionVector {
    /// Sort by device, keep the highest value per device, drop zeros.
    fn from(mut counters: Vec<Counter>) -> Self {
        counters.retain(|c| c.value > 0);
        counters.sort_by(|a, b| a.id.cmp(&b.id).then(b.value.cmp(&a.value)));
        counters.dedup_by_key(|c| c.id);
        Self { counters }
    }
}

impl From<VersionVector> for Vec<Counter> {
    fn from(vector: VersionVector) -> Self {
        vector.counters
    }
}

impl Display for VersionVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", c.id.short(), c.value)?;
        }
        write!(f, "}}")
    }
}
