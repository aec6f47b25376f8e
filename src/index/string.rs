//! String indices: per-character bitmap index and truncated-hash index.

use serde::{Deserialize, Serialize};

use super::{container_lookup, IndexBase, ValueIndex};
use crate::bitmap::Bitmap;
use crate::coder::{Base, BitmapIndex, EqualityCoder};
use crate::error::{Error, Result};
use crate::value::{wire, RelOp, ValueView};

// -- StringIndex ----------------------------------------------------------

/// Per-character index: one 8-bit equality coder per character slot up to
/// `max_length`, plus a length index. Strings longer than `max_length`
/// are indexed by their truncated prefix.
#[derive(Debug, Serialize, Deserialize)]
pub struct StringIndex {
    base: IndexBase,
    max_length: usize,
    length: BitmapIndex,
    chars: Vec<EqualityCoder>,
}

impl StringIndex {
    pub fn new(max_length: usize) -> Self {
        let max_length = max_length.max(1);
        Self {
            base: IndexBase::default(),
            max_length,
            length: BitmapIndex::new(Base::for_max(10, max_length as u64)),
            chars: Vec::new(),
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn truncated<'a>(&self, s: &'a str) -> &'a [u8] {
        let bytes = s.as_bytes();
        &bytes[..bytes.len().min(self.max_length)]
    }

    fn equal_lookup(&self, op: RelOp, needle: &[u8]) -> Bitmap {
        let offset = self.offset();
        let negate = op == RelOp::NotEqual;
        if needle.is_empty() {
            let mut result = self.length.eq(0);
            result.pad_to(offset);
            if negate {
                result.flip();
            }
            return result;
        }
        if needle.len() > self.chars.len() {
            return Bitmap::filled(offset, negate);
        }
        let mut result = self.length.eq(needle.len() as u64);
        for (slot, &byte) in self.chars.iter().zip(needle) {
            if !result.any() {
                return Bitmap::filled(offset, negate);
            }
            result &= &slot.eq(byte as u64);
        }
        result.pad_to(offset);
        if negate {
            result.flip();
        }
        result
    }

    /// Substring lookup. Candidate start positions range over the
    /// character slots populated so far, so only substrings up to the
    /// longest inserted string are matched.
    fn substring_lookup(&self, op: RelOp, needle: &[u8]) -> Bitmap {
        let offset = self.offset();
        let negate = op == RelOp::NotNi;
        if needle.is_empty() {
            return Bitmap::filled(offset, !negate);
        }
        if needle.len() > self.chars.len() {
            return Bitmap::filled(offset, negate);
        }
        let mut result = Bitmap::filled(offset, false);
        for start in 0..=self.chars.len() - needle.len() {
            let mut candidate = Bitmap::filled(offset, true);
            let mut dead = false;
            for (j, &byte) in needle.iter().enumerate() {
                let hits = self.chars[start + j].eq(byte as u64);
                if !hits.any() {
                    dead = true;
                    break;
                }
                candidate &= &hits;
            }
            if !dead {
                result |= &candidate;
            }
        }
        result.pad_to(offset);
        if negate {
            result.flip();
        }
        result
    }
}

impl ValueIndex for StringIndex {
    fn base(&self) -> &IndexBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut IndexBase {
        &mut self.base
    }

    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        let s = match value {
            ValueView::String(s) => s,
            other => {
                return Err(Error::TypeClash(format!(
                    "{} value in string index",
                    other.kind_name()
                )))
            }
        };
        let bytes = self.truncated(s);
        if bytes.len() > self.chars.len() {
            self.chars.resize_with(bytes.len(), || EqualityCoder::new(256));
        }
        for (slot, &byte) in self.chars.iter_mut().zip(bytes) {
            slot.skip(pos - slot.len());
            slot.append(byte as u64);
        }
        self.length.skip(pos - self.length.len());
        self.length.append(bytes.len() as u64);
        Ok(())
    }

    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        match value {
            ValueView::String(s) => {
                let needle = self.truncated(s);
                match op {
                    RelOp::Equal | RelOp::NotEqual => Ok(self.equal_lookup(op, needle)),
                    RelOp::Ni | RelOp::NotNi => Ok(self.substring_lookup(op, needle)),
                    _ => Err(Error::UnsupportedOperator(format!("{op} on string index"))),
                }
            }
            ValueView::Vector(xs) => container_lookup(self, op, xs.iter().map(|x| x.view())),
            ValueView::Set(xs) => container_lookup(self, op, xs.iter().map(|x| x.view())),
            other => Err(Error::TypeClash(format!(
                "{} query against string index",
                other.kind_name()
            ))),
        }
    }
}

// -- HashIndex ------------------------------------------------------------

/// Index storing a truncated cryptographic digest per row. Chosen for
/// fields with the `id` attribute; only supports equality.
#[derive(Debug, Serialize, Deserialize)]
pub struct HashIndex {
    base: IndexBase,
    digest_bytes: usize,
    digests: Vec<u64>,
}

impl HashIndex {
    pub fn new(digest_bytes: usize) -> Self {
        let digest_bytes = digest_bytes.clamp(1, 8);
        Self {
            base: IndexBase::default(),
            digest_bytes,
            digests: Vec::new(),
        }
    }

    fn digest(&self, value: ValueView<'_>) -> u64 {
        let hash = blake3::hash(&wire::encode(value));
        let mut bytes = [0u8; 8];
        bytes[..self.digest_bytes].copy_from_slice(&hash.as_bytes()[..self.digest_bytes]);
        u64::from_le_bytes(bytes)
    }
}

impl ValueIndex for HashIndex {
    fn base(&self) -> &IndexBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut IndexBase {
        &mut self.base
    }

    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        let digest = self.digest(value);
        self.digests.resize(pos as usize, 0);
        self.digests.push(digest);
        Ok(())
    }

    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        match op {
            RelOp::Equal | RelOp::NotEqual => {
                let digest = self.digest(value);
                let matches = Bitmap::from_ids(
                    self.digests
                        .iter()
                        .enumerate()
                        .filter(|(_, &d)| d == digest)
                        .map(|(i, _)| i as u64),
                );
                let mut result = matches;
                result.pad_to(self.offset());
                if op == RelOp::NotEqual {
                    result.flip();
                }
                Ok(result)
            }
            RelOp::In | RelOp::NotIn => match value {
                ValueView::Vector(xs) => container_lookup(self, op, xs.iter().map(|x| x.view())),
                ValueView::Set(xs) => container_lookup(self, op, xs.iter().map(|x| x.view())),
                _ => Err(Error::UnsupportedOperator(format!("{op} on hash index"))),
            },
            _ => Err(Error::UnsupportedOperator(format!("{op} on hash index"))),
        }
    }
}

// -- Tests ----------------------------------------------------------------
