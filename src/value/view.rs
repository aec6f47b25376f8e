//! Borrowed views over values.
//!
//! A [`ValueView`] aliases an owning [`Value`] without allocating. Indices
//! and synopses ingest table-slice cells through views so the hot append
//! path never clones strings or containers. Materializing a view yields an
//! owning value again.
//!
//! Variant order mirrors [`Value`], so view comparisons agree with value
//! comparisons.

use std::collections::{BTreeMap, BTreeSet};

use ordered_float::OrderedFloat;

use super::{Address, Pattern, Port, Subnet, Value};

/// A borrowed value. Scalars are copied, everything else aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueView<'a> {
    Nil,
    Bool(bool),
    Integer(i64),
    Count(u64),
    Real(OrderedFloat<f64>),
    Duration(i64),
    Time(i64),
    String(&'a str),
    Pattern(&'a Pattern),
    Address(&'a Address),
    Subnet(&'a Subnet),
    Port(&'a Port),
    Enumeration(u8),
    Vector(&'a [Value]),
    Set(&'a BTreeSet<Value>),
    Map(&'a BTreeMap<Value, Value>),
}

impl Value {
    /// Borrow this value as a view.
    pub fn view(&self) -> ValueView<'_> {
        match self {
            Value::Nil => ValueView::Nil,
            Value::Bool(b) => ValueView::Bool(*b),
            Value::Integer(x) => ValueView::Integer(*x),
            Value::Count(x) => ValueView::Count(*x),
            Value::Real(x) => ValueView::Real(*x),
            Value::Duration(x) => ValueView::Duration(*x),
            Value::Time(x) => ValueView::Time(*x),
            Value::String(s) => ValueView::String(s),
            Value::Pattern(p) => ValueView::Pattern(p),
            Value::Address(a) => ValueView::Address(a),
            Value::Subnet(s) => ValueView::Subnet(s),
            Value::Port(p) => ValueView::Port(p),
            Value::Enumeration(e) => ValueView::Enumeration(*e),
            Value::Vector(xs) => ValueView::Vector(xs),
            Value::Set(xs) => ValueView::Set(xs),
            Value::Map(xs) => ValueView::Map(xs),
        }
    }
}

impl ValueView<'_> {
    /// Clone the viewed data into an owning value.
    pub fn materialize(self) -> Value {
        match self {
            ValueView::Nil => Value::Nil,
            ValueView::Bool(b) => Value::Bool(b),
            ValueView::Integer(x) => Value::Integer(x),
            ValueView::Count(x) => Value::Count(x),
            ValueView::Real(x) => Value::Real(x),
            ValueView::Duration(x) => Value::Duration(x),
            ValueView::Time(x) => Value::Time(x),
            ValueView::String(s) => Value::String(s.to_string()),
            ValueView::Pattern(p) => Value::Pattern(p.clone()),
            ValueView::Address(a) => Value::Address(*a),
            ValueView::Subnet(s) => Value::Subnet(*s),
            ValueView::Port(p) => Value::Port(*p),
            ValueView::Enumeration(e) => Value::Enumeration(e),
            ValueView::Vector(xs) => Value::Vector(xs.to_vec()),
            ValueView::Set(xs) => Value::Set(xs.clone()),
            ValueView::Map(xs) => Value::Map(xs.clone()),
        }
    }

    pub fn is_nil(self) -> bool {
        matches!(self, ValueView::Nil)
    }

    /// Short variant name for diagnostics.
    pub fn kind_name(self) -> &'static str {
        match self {
            ValueView::Nil => "nil",
            ValueView::Bool(_) => "bool",
            ValueView::Integer(_) => "integer",
            ValueView::Count(_) => "count",
            ValueView::Real(_) => "real",
            ValueView::Duration(_) => "duration",
            ValueView::Time(_) => "time",
            ValueView::String(_) => "string",
            ValueView::Pattern(_) => "pattern",
            ValueView::Address(_) => "address",
            ValueView::Subnet(_) => "subnet",
            ValueView::Port(_) => "port",
            ValueView::Enumeration(_) => "enumeration",
            ValueView::Vector(_) => "vector",
            ValueView::Set(_) => "set",
            ValueView::Map(_) => "map",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Proto;

    #[test]
    fn test_view_materialize_roundtrip() {
        let values = vec![
            Value::Nil,
            Value::Bool(true),
            Value::Integer(-7),
            Value::Count(7),
            Value::real(2.5),
            Value::Duration(1_000),
            Value::Time(1_500_000_000_000_000_000),
            Value::String("hello".into()),
            Value::Pattern(Pattern::new("a+").unwrap()),
            Value::Address("192.168.0.1".parse().unwrap()),
            Value::Subnet("10.0.0.0/8".parse().unwrap()),
            Value::Port(Port::new(443, Proto::Tcp)),
            Value::Enumeration(3),
            Value::Vector(vec![Value::Integer(1), Value::Nil]),
            Value::Set(BTreeSet::from([Value::Count(1), Value::Count(2)])),
            Value::Map(BTreeMap::from([(Value::Count(1), Value::Bool(false))])),
        ];
        for v in values {
            assert_eq!(v.view().materialize(), v);
        }
    }

    #[test]
    fn test_view_ordering_matches_value_ordering() {
        let a = Value::Integer(1);
        let b = Value::Count(0);
        assert_eq!(a.view() < b.view(), a < b);
        let c = Value::String("abc".into());
        let d = Value::String("abd".into());
        assert_eq!(c.view().cmp(&d.view()), c.cmp(&d));
    }

    #[test]
    fn test_view_is_copy() {
        let v = Value::String("abc".into());
        let view = v.view();
        let copy = view;
        assert_eq!(view, copy);
    }
}
