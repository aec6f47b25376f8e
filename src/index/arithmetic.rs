//! Arithmetic value indices.
//!
//! One index covers the ordered scalar variants: bool, integer, count,
//! real, duration, time, and enumeration. Values map onto `u64` keys in
//! an order-preserving way and land in a range-encoded [`BitmapIndex`]
//! parameterized by the field's digit base.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::{container_lookup, IndexBase, ValueIndex};
use crate::bitmap::Bitmap;
use crate::coder::{Base, BitmapIndex};
use crate::error::{Error, Result};
use crate::value::{RelOp, ValueView};

/// Which scalar variant the index accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticKind {
    Bool,
    Integer,
    Count,
    Real,
    Duration,
    Time,
    Enumeration,
}

/// Map a signed value onto `u64` preserving order.
#[inline]
fn order_i64(x: i64) -> u64 {
    (x as u64) ^ (1 << 63)
}

/// Map an IEEE-754 double onto `u64` preserving numeric order (total
/// order for finite values; NaN sorts above everything).
#[inline]
fn order_f64(x: OrderedFloat<f64>) -> u64 {
    let bits = x.0.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArithmeticIndex {
    base: IndexBase,
    kind: ArithmeticKind,
    index: BitmapIndex,
}

impl ArithmeticIndex {
    pub fn new(kind: ArithmeticKind, digits: Base) -> Self {
        Self {
            base: IndexBase::default(),
            kind,
            index: BitmapIndex::new(digits),
        }
    }

    pub fn kind(&self) -> ArithmeticKind {
        self.kind
    }

    /// Key for a view matching this index's kind.
    fn key_of(&self, value: ValueView<'_>) -> Option<u64> {
        match (self.kind, value) {
            (ArithmeticKind::Bool, ValueView::Bool(b)) => Some(b as u64),
            (ArithmeticKind::Integer, ValueView::Integer(x)) => Some(order_i64(x)),
            (ArithmeticKind::Count, ValueView::Count(x)) => Some(x),
            (ArithmeticKind::Real, ValueView::Real(x)) => Some(order_f64(x)),
            (ArithmeticKind::Duration, ValueView::Duration(x)) => Some(order_i64(x)),
            (ArithmeticKind::Time, ValueView::Time(x)) => Some(order_i64(x)),
            (ArithmeticKind::Enumeration, ValueView::Enumeration(e)) => Some(e as u64),
            _ => None,
        }
    }
}

impl ValueIndex for ArithmeticIndex {
    fn base(&self) -> &IndexBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut IndexBase {
        &mut self.base
    }

    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        let key = self.key_of(value).ok_or_else(|| {
            Error::TypeClash(format!(
                "{} value in {:?} index",
                value.kind_name(),
                self.kind
            ))
        })?;
        self.index.skip(pos - self.index.len());
        self.index.append(key);
        Ok(())
    }

    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        match value {
            ValueView::Vector(xs) => {
                return container_lookup(self, op, xs.iter().map(|x| x.view()))
            }
            ValueView::Set(xs) => return container_lookup(self, op, xs.iter().map(|x| x.view())),
            _ => {}
        }
        let key = self.key_of(value).ok_or_else(|| {
            Error::TypeClash(format!(
                "{} query against {:?} index",
                value.kind_name(),
                self.kind
            ))
        })?;
        self.index.lookup(op, key)
    }
}

// -- Tests ----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn index_of(kind: ArithmeticKind, values: &[Value]) -> ArithmeticIndex {
        let mut idx = ArithmeticIndex::new(kind, Base::uniform64(8));
        for v in values {
            idx.append(v.view()).unwrap();
        }
        idx
    }

    fn exhaustive_check(kind: ArithmeticKind, values: &[Value], queries: &[Value]) {
        let idx = index_of(kind, values);
        for q in queries {
            for op in [
                RelOp::Equal,
                RelOp::NotEqual,
                RelOp::Less,
                RelOp::LessEqual,
                RelOp::Greater,
                RelOp::GreaterEqual,
            ] {
                let got: Vec<u64> = idx.lookup(op, q.view()).unwrap().ones().collect();
                let want: Vec<u64> = values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| crate::value::evaluate(v, op, q))
                    .map(|(i, _)| i as u64)
                    .collect();
                assert_eq!(got, want, "kind={kind:?} op={op} q={q}");
            }
        }
    }

    #[test]
    fn test_integer_ops_including_negatives() {
        let values: Vec<Value> = [-100i64, -1, 0, 1, 100, i64::MIN, i64::MAX]
            .into_iter()
            .map(Value::Integer)
            .collect();
        let queries: Vec<Value> = [-100i64, -2, 0, 100, i64::MIN, i64::MAX]
            .into_iter()
            .map(Value::Integer)
            .collect();
        exhaustive_check(ArithmeticKind::Integer, &values, &queries);
    }

    #[test]
    fn test_count_ops() {
        let values: Vec<Value> = [0u64, 1, 8, 64, 1000, u64::MAX]
            .into_iter()
            .map(Value::Count)
            .collect();
        let queries = values.clone();
        exhaustive_check(ArithmeticKind::Count, &values, &queries);
    }

    #[test]
    fn test_real_ordering() {
        let values: Vec<Value> = [-2.5f64, -0.0, 0.0, 1.25, 3e10]
            .into_iter()
            .map(Value::real)
            .collect();
        let idx = index_of(ArithmeticKind::Real, &values);
        let lt = idx
            .lookup(RelOp::Less, Value::real(1.0).view())
            .unwrap();
        assert_eq!(lt.ones().collect::<Vec<_>>(), vec![0, 1, 2]);
        let ge = idx
            .lookup(RelOp::GreaterEqual, Value::real(1.25).view())
            .unwrap();
        assert_eq!(ge.ones().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn test_time_and_duration() {
        let values: Vec<Value> = [-5i64, 0, 5].into_iter().map(Value::Time).collect();
        let idx = index_of(ArithmeticKind::Time, &values);
        let hits = idx
            .lookup(RelOp::GreaterEqual, Value::Time(0).view())
            .unwrap();
        assert_eq!(hits.ones().collect::<Vec<_>>(), vec![1, 2]);
        let values: Vec<Value> = [1i64, 10].into_iter().map(Value::Duration).collect();
        let idx = index_of(ArithmeticKind::Duration, &values);
        let hits = idx
            .lookup(RelOp::Less, Value::Duration(10).view())
            .unwrap();
        assert_eq!(hits.ones().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_bool_index() {
        let values: Vec<Value> = [true, false, true].into_iter().map(Value::Bool).collect();
        let idx = index_of(ArithmeticKind::Bool, &values);
        let t = idx.lookup(RelOp::Equal, Value::Bool(true).view()).unwrap();
        assert_eq!(t.ones().collect::<Vec<_>>(), vec![0, 2]);
        let f = idx.lookup(RelOp::Equal, Value::Bool(false).view()).unwrap();
        assert_eq!(f.ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_enumeration_index() {
        let values: Vec<Value> = [0u8, 3, 3, 255]
            .into_iter()
            .map(Value::Enumeration)
            .collect();
        let idx = index_of(ArithmeticKind::Enumeration, &values);
        let hits = idx
            .lookup(RelOp::Equal, Value::Enumeration(3).view())
            .unwrap();
        assert_eq!(hits.ones().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_type_clash() {
        let idx = index_of(ArithmeticKind::Count, &[Value::Count(1)]);
        assert!(idx
            .lookup(RelOp::Equal, Value::Integer(1).view())
            .is_err());
        let mut idx = ArithmeticIndex::new(ArithmeticKind::Count, Base::uniform64(8));
        assert!(idx.append(Value::String("x".into()).view()).is_err());
    }

    #[test]
    fn test_container_membership() {
        let values: Vec<Value> = [1u64, 2, 3, 4].into_iter().map(Value::Count).collect();
        let idx = index_of(ArithmeticKind::Count, &values);
        let query = Value::Vector(vec![Value::Count(2), Value::Count(4)]);
        let hits = idx.lookup(RelOp::In, query.view()).unwrap();
        assert_eq!(hits.ones().collect::<Vec<_>>(), vec![1, 3]);
        let miss = idx.lookup(RelOp::NotIn, query.view()).unwrap();
        assert_eq!(miss.ones().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_unsupported_operator() {
        let idx = index_of(ArithmeticKind::Count, &[Value::Count(1)]);
        assert!(idx.lookup(RelOp::Match, Value::Count(1).view()).is_err());
        assert!(idx.lookup(RelOp::Ni, Value::Count(1).view()).is_err());
    }
}
