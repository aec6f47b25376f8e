//! Sequence index for vector and set columns.
//!
//! Keeps up to `max_size` inner value indices of the element type plus a
//! size index. Element `i` of every appended sequence lands in inner
//! index `i`, so membership probes reduce to a union of per-position
//! equality lookups.

use serde::{Deserialize, Serialize};

use super::{AnyIndex, IndexBase, IndexFactory, IndexOptions, ValueIndex};
use crate::bitmap::Bitmap;
use crate::coder::{Base, BitmapIndex};
use crate::error::{Error, Result};
use crate::schema::Type;
use crate::value::{RelOp, Value, ValueView};

#[derive(Debug, Serialize, Deserialize)]
pub struct SequenceIndex {
    base: IndexBase,
    value_type: Type,
    max_size: usize,
    elements: Vec<AnyIndex>,
    size: BitmapIndex,
    #[serde(skip, default)]
    factory: IndexFactory,
}

impl SequenceIndex {
    pub fn new(value_type: Type, max_size: usize, factory: IndexFactory) -> Self {
        let max_size = max_size.max(1);
        Self {
            base: IndexBase::default(),
            value_type,
            max_size,
            elements: Vec::new(),
            size: BitmapIndex::new(Base::for_max(10, max_size as u64)),
            factory,
        }
    }

    fn append_elements<'a, I>(&mut self, elements: I, count: usize, pos: u64) -> Result<()>
    where
        I: Iterator<Item = ValueView<'a>>,
    {
        let seq_size = count.min(self.max_size);
        while self.elements.len() < seq_size {
            let inner = self
                .factory
                .make(&self.value_type, &IndexOptions::default())?
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "no index for sequence elements of type {:?}",
                        self.value_type.kind()
                    ))
                })?;
            self.elements.push(inner);
        }
        for (element, value) in self.elements.iter_mut().zip(elements.take(seq_size)) {
            element.append_at(value, pos)?;
        }
        self.size.skip(pos - self.size.len());
        self.size.append(seq_size as u64);
        Ok(())
    }
}

impl ValueIndex for SequenceIndex {
    fn base(&self) -> &IndexBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut IndexBase {
        &mut self.base
    }

    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        match value {
            ValueView::Vector(xs) => {
                self.append_elements(xs.iter().map(Value::view), xs.len(), pos)
            }
            ValueView::Set(xs) => self.append_elements(xs.iter().map(Value::view), xs.len(), pos),
            other => Err(Error::TypeClash(format!(
                "{} value in sequence index",
                other.kind_name()
            ))),
        }
    }

    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        match op {
            RelOp::Ni | RelOp::NotNi => {
                let mut result = Bitmap::filled(self.offset(), false);
                for element in &self.elements {
                    result |= &element.lookup(RelOp::Equal, value)?;
                }
                result.pad_to(self.offset());
                if op == RelOp::NotNi {
                    result.flip();
                }
                Ok(result)
            }
            _ => Err(Error::UnsupportedOperator(format!(
                "{op} on sequence index"
            ))),
        }
    }
}

// -- Tests ----------------------------------------------------------------
