//! Bitmap coders and digit decomposition.
//!
//! A coder stores one column of scalar values as a family of [`Bitmap`]s
//! and answers point or range probes over them. Positions are appended in
//! order; `skip` advances the position cursor without storing anything, so
//! gaps stay compressed.
//!
//! Coder kinds:
//! - [`SingletonCoder`]: a single bitmap for boolean flags.
//! - [`EqualityCoder`]: one bitmap per distinct key, for small key spaces
//!   (bytes, protocol numbers, prefix lengths).
//! - [`RangeCoder`]: range-encoded bitmaps (`bitmaps[k]` holds positions
//!   with value <= k), one digit of a multi-component index.
//! - [`BitSliceCoder`]: range-encoded binary digits of a byte; slice `b`
//!   holds positions where bit `b` is zero, which gives prefix probes for
//!   address bytes.
//!
//! [`BitmapIndex`] composes range coders over a [`Base`] digit
//! decomposition and evaluates the six relational operators with the
//! RangeEval-Opt recurrence.

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::value::RelOp;

// -- Base -----------------------------------------------------------------

/// Digit decomposition of an unsigned value, least significant digit
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base {
    radices: Vec<u64>,
}

impl Base {
    /// A fixed number of digits with the same radix.
    pub fn uniform(radix: u64, digits: usize) -> Self {
        assert!(radix >= 2, "radix must be at least 2");
        Self {
            radices: vec![radix; digits],
        }
    }

    /// Enough uniform digits to represent any `u64`.
    pub fn uniform64(radix: u64) -> Self {
        assert!(radix >= 2);
        let mut digits = 0;
        let mut covered: u128 = 1;
        while covered <= u64::MAX as u128 {
            covered *= radix as u128;
            digits += 1;
        }
        Self::uniform(radix, digits)
    }

    /// Enough uniform digits to represent values up to `max` inclusive.
    pub fn for_max(radix: u64, max: u64) -> Self {
        assert!(radix >= 2);
        let mut digits = 1;
        let mut covered: u128 = radix as u128;
        while covered <= max as u128 {
            covered *= radix as u128;
            digits += 1;
        }
        Self::uniform(radix, digits)
    }

    /// Parse a `base` attribute value: either a single radix applied
    /// uniformly over 64 bits ("8") or an explicit digit list ("10,10,10").
    pub fn parse(spec: &str) -> Result<Self> {
        let radices: Vec<u64> = spec
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidArgument(format!("bad base spec: {spec}")))
            })
            .collect::<Result<_>>()?;
        match radices.as_slice() {
            [] => Err(Error::InvalidArgument("empty base spec".into())),
            [r] => Ok(Self::uniform64(*r)),
            _ => {
                if radices.iter().any(|&r| r < 2) {
                    return Err(Error::InvalidArgument(format!("bad base spec: {spec}")));
                }
                Ok(Self { radices })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.radices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.radices.is_empty()
    }

    pub fn radix(&self, digit: usize) -> u64 {
        self.radices[digit]
    }

    /// Decompose `x` into digits. Values outside the representable range
    /// saturate to the maximum digit vector.
    pub fn decompose(&self, mut x: u64) -> Vec<u64> {
        let mut digits = Vec::with_capacity(self.radices.len());
        for &r in &self.radices {
            digits.push(x % r);
            x /= r;
        }
        if x > 0 {
            for (d, &r) in digits.iter_mut().zip(&self.radices) {
                *d = r - 1;
            }
        }
        digits
    }
}

// -- SingletonCoder -------------------------------------------------------

/// One bitmap of positions where a boolean flag is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SingletonCoder {
    bits: Bitmap,
    len: u64,
}

impl SingletonCoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, value: bool) {
        if value {
            self.bits.pad_to(self.len);
            self.bits.append_bit(true);
        }
        self.len += 1;
    }

    pub fn skip(&mut self, n: u64) {
        self.len += n;
    }

    /// Positions with the flag set, padded to the coder length.
    pub fn storage(&self) -> Bitmap {
        let mut bm = self.bits.clone();
        bm.pad_to(self.len);
        bm
    }

    pub fn eq(&self, value: bool) -> Bitmap {
        let bm = self.storage();
        if value {
            bm
        } else {
            !&bm
        }
    }
}

// -- EqualityCoder --------------------------------------------------------

/// One bitmap per distinct key over a small key space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EqualityCoder {
    cardinality: u64,
    bitmaps: Vec<Bitmap>,
    len: u64,
}

impl EqualityCoder {
    pub fn new(cardinality: u64) -> Self {
        assert!(cardinality >= 1);
        Self {
            cardinality,
            bitmaps: vec![Bitmap::new(); cardinality as usize],
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, key: u64) {
        let key = key.min(self.cardinality - 1) as usize;
        self.bitmaps[key].pad_to(self.len);
        self.bitmaps[key].append_bit(true);
        self.len += 1;
    }

    pub fn skip(&mut self, n: u64) {
        self.len += n;
    }

    pub fn eq(&self, key: u64) -> Bitmap {
        if key >= self.cardinality {
            return Bitmap::filled(self.len, false);
        }
        let mut bm = self.bitmaps[key as usize].clone();
        bm.pad_to(self.len);
        bm
    }

    /// Union of the bitmaps for all keys in `[lo, hi]`.
    fn union_range(&self, lo: u64, hi: u64) -> Bitmap {
        let hi = hi.min(self.cardinality - 1);
        let mut result = Bitmap::filled(self.len, false);
        for key in lo..=hi {
            if self.bitmaps[key as usize].any() {
                result |= &self.bitmaps[key as usize];
            }
        }
        result.pad_to(self.len);
        result
    }

    pub fn lookup(&self, op: RelOp, key: u64) -> Result<Bitmap> {
        match op {
            RelOp::Equal => Ok(self.eq(key)),
            RelOp::NotEqual => {
                let mut bm = self.eq(key);
                bm.flip();
                Ok(bm)
            }
            RelOp::Less => {
                if key == 0 {
                    Ok(Bitmap::filled(self.len, false))
                } else {
                    Ok(self.union_range(0, key - 1))
                }
            }
            RelOp::LessEqual => Ok(self.union_range(0, key)),
            RelOp::Greater => {
                if key >= self.cardinality - 1 {
                    Ok(Bitmap::filled(self.len, false))
                } else {
                    Ok(self.union_range(key + 1, self.cardinality - 1))
                }
            }
            RelOp::GreaterEqual => Ok(self.union_range(key, self.cardinality - 1)),
            _ => Err(Error::UnsupportedOperator(op.to_string())),
        }
    }
}

// -- RangeCoder -----------------------------------------------------------

/// Range-encoded coder: `bitmaps[k]` holds positions whose value is <= k.
/// The all-ones bitmap for `cardinality - 1` is implicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeCoder {
    cardinality: u64,
    bitmaps: Vec<Bitmap>,
    len: u64,
}

impl RangeCoder {
    pub fn new(cardinality: u64) -> Self {
        assert!(cardinality >= 2);
        Self {
            cardinality,
            bitmaps: vec![Bitmap::new(); cardinality as usize - 1],
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, value: u64) {
        let value = value.min(self.cardinality - 1);
        for k in value..self.cardinality - 1 {
            let bm = &mut self.bitmaps[k as usize];
            bm.pad_to(self.len);
            bm.append_bit(true);
        }
        self.len += 1;
    }

    pub fn skip(&mut self, n: u64) {
        self.len += n;
    }

    /// Positions with value <= k.
    pub fn le(&self, k: u64) -> Bitmap {
        if k >= self.cardinality - 1 {
            return Bitmap::filled(self.len, true);
        }
        let mut bm = self.bitmaps[k as usize].clone();
        bm.pad_to(self.len);
        bm
    }

    /// Positions with value == k.
    pub fn eq(&self, k: u64) -> Bitmap {
        if k == 0 {
            return self.le(0);
        }
        let le_k = self.le(k);
        let mut lt_k = self.le(k - 1);
        lt_k.flip();
        &le_k & &lt_k
    }
}

// -- BitSliceCoder --------------------------------------------------------

/// Range-encoded binary digits of a byte: `slices[b]` holds positions
/// where bit `b` of the value is zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitSliceCoder {
    slices: Vec<Bitmap>,
    len: u64,
}

impl BitSliceCoder {
    pub fn new() -> Self {
        Self {
            slices: vec![Bitmap::new(); 8],
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, value: u8) {
        for b in 0..8 {
            if value & (1 << b) == 0 {
                let bm = &mut self.slices[b as usize];
                bm.pad_to(self.len);
                bm.append_bit(true);
            }
        }
        self.len += 1;
    }

    pub fn skip(&mut self, n: u64) {
        self.len += n;
    }

    /// The zero-bit bitmap for a single bit position, padded to length.
    pub fn storage(&self, bit: u8) -> Bitmap {
        let mut bm = self.slices[bit as usize].clone();
        bm.pad_to(self.len);
        bm
    }

    /// Positions whose value equals `v`.
    pub fn eq(&self, v: u8) -> Bitmap {
        let mut result = Bitmap::filled(self.len, true);
        for b in 0..8u8 {
            let zero = self.storage(b);
            if v & (1 << b) == 0 {
                result &= &zero;
            } else {
                result &= &!&zero;
            }
            if !result.any() {
                break;
            }
        }
        result
    }
}

impl Default for BitSliceCoder {
    fn default() -> Self {
        Self::new()
    }
}

// -- BitmapIndex ----------------------------------------------------------

/// Multi-digit range-encoded index over a [`Base`] decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitmapIndex {
    base: Base,
    digits: Vec<RangeCoder>,
    len: u64,
}

impl BitmapIndex {
    pub fn new(base: Base) -> Self {
        let digits = (0..base.len())
            .map(|i| RangeCoder::new(base.radix(i)))
            .collect();
        Self {
            base,
            digits,
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, value: u64) {
        for (coder, digit) in self.digits.iter_mut().zip(self.base.decompose(value)) {
            coder.append(digit);
        }
        self.len += 1;
    }

    pub fn skip(&mut self, n: u64) {
        for coder in &mut self.digits {
            coder.skip(n);
        }
        self.len += n;
    }

    /// Positions with value <= `x` (RangeEval-Opt, least significant
    /// digit first).
    pub fn le(&self, x: u64) -> Bitmap {
        if self.len == 0 {
            return Bitmap::new();
        }
        let digits = self.base.decompose(x);
        let mut result = self.digits[0].le(digits[0]);
        for j in 1..self.digits.len() {
            let d = digits[j];
            if d > 0 {
                result &= &self.digits[j].le(d);
                result |= &self.digits[j].le(d - 1);
            } else {
                result &= &self.digits[j].le(0);
            }
        }
        result
    }

    /// Positions with value == `x`.
    pub fn eq(&self, x: u64) -> Bitmap {
        if self.len == 0 {
            return Bitmap::new();
        }
        let digits = self.base.decompose(x);
        let mut result = self.digits[0].eq(digits[0]);
        for j in 1..self.digits.len() {
            if !result.any() {
                result.pad_to(self.len);
                return result;
            }
            result &= &self.digits[j].eq(digits[j]);
        }
        result.pad_to(self.len);
        result
    }

    pub fn lookup(&self, op: RelOp, x: u64) -> Result<Bitmap> {
        let mut result = match op {
            RelOp::Equal => self.eq(x),
            RelOp::NotEqual => {
                let mut bm = self.eq(x);
                bm.pad_to(self.len);
                bm.flip();
                bm
            }
            RelOp::LessEqual => self.le(x),
            RelOp::Less => {
                if x == 0 {
                    Bitmap::filled(self.len, false)
                } else {
                    self.le(x - 1)
                }
            }
            RelOp::Greater => {
                let mut bm = self.le(x);
                bm.pad_to(self.len);
                bm.flip();
                bm
            }
            RelOp::GreaterEqual => {
                if x == 0 {
                    Bitmap::filled(self.len, true)
                } else {
                    let mut bm = self.le(x - 1);
                    bm.pad_to(self.len);
                    bm.flip();
                    bm
                }
            }
            _ => return Err(Error::UnsupportedOperator(op.to_string())),
        };
        result.pad_to(self.len);
        Ok(result)
    }
}

// -- Tests ----------------------------------------------------------------
