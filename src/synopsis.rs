//! Per-column synopses for partition pruning.
//!
//! A synopsis is a compact summary of one column across a partition. Its
//! lookup answers "could any row match?": `Some(false)` definitely rules
//! the partition out, `Some(true)` and `None` (inconclusive) keep it.
//! False positives are fine, false negatives are forbidden.
//!
//! Kinds: min/max bounds for time and duration columns, a seen-flags
//! summary for bools, and a bloom filter over hashed wire bytes for
//! strings and addresses.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::schema::{Type, TypeKind};
use crate::value::{wire, RelOp, ValueView};

// -- MinMax ---------------------------------------------------------------

/// Which scalar a min/max synopsis summarizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinMaxKind {
    Time,
    Duration,
}

/// Running min/max bounds over a signed scalar column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinMaxSynopsis {
    kind: MinMaxKind,
    min: i64,
    max: i64,
    seen: bool,
}

impl MinMaxSynopsis {
    pub fn new(kind: MinMaxKind) -> Self {
        Self {
            kind,
            min: i64::MAX,
            max: i64::MIN,
            seen: false,
        }
    }

    fn extract(&self, value: ValueView<'_>) -> Option<i64> {
        match (self.kind, value) {
            (MinMaxKind::Time, ValueView::Time(x)) => Some(x),
            (MinMaxKind::Duration, ValueView::Duration(x)) => Some(x),
            _ => None,
        }
    }

    fn add(&mut self, value: ValueView<'_>) {
        if let Some(x) = self.extract(value) {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
            self.seen = true;
        }
    }

    fn lookup(&self, op: RelOp, rhs: ValueView<'_>) -> Option<bool> {
        let x = self.extract(rhs)?;
        if !self.seen {
            return Some(false);
        }
        match op {
            RelOp::Equal => Some(self.min <= x && x <= self.max),
            RelOp::NotEqual => {
                if self.min == x && self.max == x {
                    Some(false)
                } else {
                    Some(true)
                }
            }
            RelOp::Less => Some(self.min < x),
            RelOp::LessEqual => Some(self.min <= x),
            RelOp::Greater => Some(self.max > x),
            RelOp::GreaterEqual => Some(self.max >= x),
            _ => None,
        }
    }
}

// -- Bool -----------------------------------------------------------------

/// Tracks which of the two boolean values appeared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoolSynopsis {
    seen_true: bool,
    seen_false: bool,
}

impl BoolSynopsis {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, value: ValueView<'_>) {
        match value {
            ValueView::Bool(true) => self.seen_true = true,
            ValueView::Bool(false) => self.seen_false = true,
            _ => {}
        }
    }

    fn lookup(&self, op: RelOp, rhs: ValueView<'_>) -> Option<bool> {
        let b = match rhs {
            ValueView::Bool(b) => b,
            _ => return None,
        };
        match op {
            RelOp::Equal => Some(if b { self.seen_true } else { self.seen_false }),
            RelOp::NotEqual => Some(if b { self.seen_false } else { self.seen_true }),
            _ => None,
        }
    }
}

// -- Bloom ----------------------------------------------------------------

/// Bits per expected key; ~1% false-positive rate with seven probes.
const BLOOM_BITS_PER_KEY: usize = 10;
const BLOOM_NUM_HASHES: usize = 7;
/// Expected distinct values per column. Overfull filters only raise the
/// false-positive rate, never produce false negatives.
const BLOOM_EXPECTED_KEYS: usize = 1 << 16;

/// Bloom filter over equality probes. Keys are 128-bit hashes of the
/// value's wire bytes, split into two halves for double hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomSynopsis {
    bits: Vec<u64>,
    num_bits: u64,
}

fn probe_positions(key: u128, num_bits: u64) -> impl Iterator<Item = u64> {
    let bytes = key.to_le_bytes();
    let h1 = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let h2 = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) | 1;
    (0..BLOOM_NUM_HASHES as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
}

impl BloomSynopsis {
    pub fn new() -> Self {
        Self::with_capacity(BLOOM_EXPECTED_KEYS)
    }

    pub fn with_capacity(expected_keys: usize) -> Self {
        let raw_bits = expected_keys.saturating_mul(BLOOM_BITS_PER_KEY).max(64);
        let num_bits = (raw_bits + 63) & !63;
        Self {
            bits: vec![0u64; num_bits / 64],
            num_bits: num_bits as u64,
        }
    }

    fn key(value: ValueView<'_>) -> u128 {
        let hash = blake3::hash(&wire::encode(value));
        u128::from_le_bytes(hash.as_bytes()[0..16].try_into().unwrap())
    }

    fn add(&mut self, value: ValueView<'_>) {
        for pos in probe_positions(Self::key(value), self.num_bits) {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    fn maybe_contains(&self, value: ValueView<'_>) -> bool {
        probe_positions(Self::key(value), self.num_bits)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }

    fn lookup(&self, op: RelOp, rhs: ValueView<'_>) -> Option<bool> {
        match op {
            RelOp::Equal => Some(self.maybe_contains(rhs)),
            _ => None,
        }
    }
}

impl Default for BloomSynopsis {
    fn default() -> Self {
        Self::new()
    }
}

// -- Synopsis -------------------------------------------------------------

/// The closed set of synopsis implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Synopsis {
    MinMax(MinMaxSynopsis),
    Bool(BoolSynopsis),
    Bloom(BloomSynopsis),
}

impl Synopsis {
    /// Feed one non-nil cell.
    pub fn add(&mut self, value: ValueView<'_>) {
        match self {
            Synopsis::MinMax(s) => s.add(value),
            Synopsis::Bool(s) => s.add(value),
            Synopsis::Bloom(s) => s.add(value),
        }
    }

    /// Could any summarized row satisfy `op rhs`? `None` means the
    /// synopsis cannot tell.
    pub fn lookup(&self, op: RelOp, rhs: ValueView<'_>) -> Option<bool> {
        match self {
            Synopsis::MinMax(s) => s.lookup(op, rhs),
            Synopsis::Bool(s) => s.lookup(op, rhs),
            Synopsis::Bloom(s) => s.lookup(op, rhs),
        }
    }
}

// -- Factory --------------------------------------------------------------

type Constructor = fn(&Type) -> Option<Synopsis>;

/// Injected registry from column type to synopsis constructor. Types
/// without an entry get no synopsis.
#[derive(Clone)]
pub struct SynopsisFactory {
    constructors: Arc<HashMap<TypeKind, Constructor>>,
}

impl std::fmt::Debug for SynopsisFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynopsisFactory")
            .field("types", &self.constructors.len())
            .finish()
    }
}

impl SynopsisFactory {
    pub fn standard() -> Self {
        let mut constructors: HashMap<TypeKind, Constructor> = HashMap::new();
        constructors.insert(TypeKind::Time, |_| {
            Some(Synopsis::MinMax(MinMaxSynopsis::new(MinMaxKind::Time)))
        });
        constructors.insert(TypeKind::Duration, |_| {
            Some(Synopsis::MinMax(MinMaxSynopsis::new(MinMaxKind::Duration)))
        });
        constructors.insert(TypeKind::Bool, |_| Some(Synopsis::Bool(BoolSynopsis::new())));
        constructors.insert(TypeKind::String, |_| {
            Some(Synopsis::Bloom(BloomSynopsis::new()))
        });
        constructors.insert(TypeKind::Address, |_| {
            Some(Synopsis::Bloom(BloomSynopsis::new()))
        });
        Self {
            constructors: Arc::new(constructors),
        }
    }

    /// Registry with overrides, for tests that swap implementations.
    pub fn with_overrides(overrides: HashMap<TypeKind, Constructor>) -> Self {
        let mut constructors = (*Self::standard().constructors).clone();
        constructors.extend(overrides);
        Self {
            constructors: Arc::new(constructors),
        }
    }

    pub fn make(&self, ty: &Type) -> Option<Synopsis> {
        self.constructors.get(&ty.kind()).and_then(|make| make(ty))
    }
}

impl Default for SynopsisFactory {
    fn default() -> Self {
        Self::standard()
    }
}

// -- Tests ----------------------------------------------------------------
