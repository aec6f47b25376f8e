//! Record types and type-directed value shaping.
//!
//! A [`RecordType`] is an ordered list of named, typed, attributed fields.
//! Layouts are compared structurally and used as map keys throughout the
//! meta-index and partition indexes. Nested records flatten into a single
//! field list with dot-joined names before storage; `flatten_value` /
//! `unflatten_value` reshape row data to match and are exact inverses for
//! correctly typed records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueView};

// -- Type -----------------------------------------------------------------

/// The type of a column or record field. Mirrors the value variants and
/// adds records and named aliases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Bool,
    Integer,
    Count,
    Real,
    Duration,
    Time,
    String,
    Pattern,
    Address,
    Subnet,
    Port,
    /// Nominal symbol table; values are indices into it.
    Enumeration(Vec<String>),
    Vector(Box<Type>),
    Set(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Record(RecordType),
    Alias(String, Box<Type>),
}

impl Type {
    /// Strip alias wrappers.
    pub fn resolve(&self) -> &Type {
        let mut t = self;
        while let Type::Alias(_, inner) = t {
            t = inner;
        }
        t
    }

    /// Type kind used as a factory key.
    pub fn kind(&self) -> TypeKind {
        match self.resolve() {
            Type::Bool => TypeKind::Bool,
            Type::Integer => TypeKind::Integer,
            Type::Count => TypeKind::Count,
            Type::Real => TypeKind::Real,
            Type::Duration => TypeKind::Duration,
            Type::Time => TypeKind::Time,
            Type::String => TypeKind::String,
            Type::Pattern => TypeKind::Pattern,
            Type::Address => TypeKind::Address,
            Type::Subnet => TypeKind::Subnet,
            Type::Port => TypeKind::Port,
            Type::Enumeration(_) => TypeKind::Enumeration,
            Type::Vector(_) => TypeKind::Vector,
            Type::Set(_) => TypeKind::Set,
            Type::Map(_, _) => TypeKind::Map,
            Type::Record(_) => TypeKind::Record,
            Type::Alias(_, _) => unreachable!("resolve strips aliases"),
        }
    }
}

/// Discriminant of [`Type`], the key of factory registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Bool,
    Integer,
    Count,
    Real,
    Duration,
    Time,
    String,
    Pattern,
    Address,
    Subnet,
    Port,
    Enumeration,
    Vector,
    Set,
    Map,
    Record,
}

// -- Attributes -----------------------------------------------------------

/// A `key` or `key=value` annotation on a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// Field with the `timestamp` attribute marks the event time column.
pub const ATTR_TIMESTAMP: &str = "timestamp";
/// Field with the `skip` attribute is excluded from indexing.
pub const ATTR_SKIP: &str = "skip";
/// `max_size=N` bounds string/sequence index width.
pub const ATTR_MAX_SIZE: &str = "max_size";
/// `base=...` selects the digit decomposition of arithmetic indices.
pub const ATTR_BASE: &str = "base";
/// Field with the `id` attribute uses a hash index instead of a
/// per-character index.
pub const ATTR_ID: &str = "id";

// -- Field & RecordType ---------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    pub attributes: Vec<Attribute>,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            attributes: Vec::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.iter().any(|a| a.key == key)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .and_then(|a| a.value.as_deref())
    }
}

/// An ordered list of fields; the layout of a table slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordType {
    pub name: String,
    pub fields: Vec<Field>,
}

impl RecordType {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Flatten nested record fields into dot-joined leaf fields. A layout
    /// without nested records flattens to itself.
    pub fn flatten(&self) -> RecordType {
        fn emit(prefix: &str, field: &Field, out: &mut Vec<Field>) {
            match field.ty.resolve() {
                Type::Record(inner) => {
                    let prefix = if prefix.is_empty() {
                        field.name.clone()
                    } else {
                        format!("{prefix}.{}", field.name)
                    };
                    for f in &inner.fields {
                        emit(&prefix, f, out);
                    }
                }
                _ => {
                    let name = if prefix.is_empty() {
                        field.name.clone()
                    } else {
                        format!("{prefix}.{}", field.name)
                    };
                    out.push(Field {
                        name,
                        ty: field.ty.clone(),
                        attributes: field.attributes.clone(),
                    });
                }
            }
        }
        let mut fields = Vec::with_capacity(self.fields.len());
        for f in &self.fields {
            emit("", f, &mut fields);
        }
        RecordType::new(self.name.clone(), fields)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} fields)", self.name, self.fields.len())
    }
}

// -- Type checking --------------------------------------------------------

/// Check a value against a type. `nil` satisfies every type; containers
/// are validated element-wise.
pub fn type_check(ty: &Type, value: ValueView<'_>) -> bool {
    match (ty.resolve(), value) {
        (_, ValueView::Nil) => true,
        (Type::Bool, ValueView::Bool(_)) => true,
        (Type::Integer, ValueView::Integer(_)) => true,
        (Type::Count, ValueView::Count(_)) => true,
        (Type::Real, ValueView::Real(_)) => true,
        (Type::Duration, ValueView::Duration(_)) => true,
        (Type::Time, ValueView::Time(_)) => true,
        (Type::String, ValueView::String(_)) => true,
        (Type::Pattern, ValueView::Pattern(_)) => true,
        (Type::Address, ValueView::Address(_)) => true,
        (Type::Subnet, ValueView::Subnet(_)) => true,
        (Type::Port, ValueView::Port(_)) => true,
        (Type::Enumeration(symbols), ValueView::Enumeration(e)) => (e as usize) < symbols.len(),
        (Type::Vector(elem), ValueView::Vector(xs)) => {
            xs.iter().all(|x| type_check(elem, x.view()))
        }
        (Type::Set(elem), ValueView::Set(xs)) => xs.iter().all(|x| type_check(elem, x.view())),
        (Type::Map(k, v), ValueView::Map(xs)) => xs
            .iter()
            .all(|(key, val)| type_check(k, key.view()) && type_check(v, val.view())),
        (Type::Record(rt), ValueView::Vector(xs)) => {
            xs.len() == rt.fields.len()
                && xs
                    .iter()
                    .zip(&rt.fields)
                    .all(|(x, f)| type_check(&f.ty, x.view()))
        }
        _ => false,
    }
}

// -- Flatten / unflatten --------------------------------------------------

/// Flatten a record value (vector of field values, possibly nested) into a
/// flat vector of leaf values. Returns `None` when the shape disagrees
/// with the type. A `nil` at a nested-record position expands into one
/// `nil` per leaf.
pub fn flatten_value(xs: &[Value], ty: &RecordType) -> Option<Vec<Value>> {
    if xs.len() != ty.fields.len() {
        return None;
    }
    let mut result = Vec::with_capacity(ty.fields.len());
    for (x, field) in xs.iter().zip(&ty.fields) {
        match field.ty.resolve() {
            Type::Record(inner) => match x {
                Value::Nil => {
                    let leaves = inner.flatten().fields.len();
                    result.extend(std::iter::repeat(Value::Nil).take(leaves));
                }
                Value::Vector(ys) => {
                    result.extend(flatten_value(ys, inner)?);
                }
                _ => return None,
            },
            _ => result.push(x.clone()),
        }
    }
    Some(result)
}

fn consume(ty: &RecordType, xs: &[Value], i: &mut usize, out: &mut Vec<Value>) -> bool {
    for field in &ty.fields {
        match field.ty.resolve() {
            Type::Record(inner) => {
                let mut sub = Vec::with_capacity(inner.fields.len());
                if !consume(inner, xs, i, &mut sub) {
                    return false;
                }
                // A nested record of all-nil leaves collapses to nil.
                if sub.iter().all(|x| x.is_nil()) {
                    out.push(Value::Nil);
                } else {
                    out.push(Value::Vector(sub));
                }
            }
            _ => {
                if *i == xs.len() {
                    return false;
                }
                out.push(xs[*i].clone());
                *i += 1;
            }
        }
    }
    true
}

/// Inverse of [`flatten_value`]. Returns `None` when the flat vector is
/// too short or too long for the type.
pub fn unflatten_value(xs: &[Value], ty: &RecordType) -> Option<Vec<Value>> {
    let mut result = Vec::with_capacity(ty.fields.len());
    let mut i = 0;
    if !consume(ty, xs, &mut i, &mut result) || i != xs.len() {
        return None;
    }
    Some(result)
}

/// Project an unflattened record value into a JSON object keyed by field
/// names. Non-record values fall back to the plain projection.
pub fn to_json_typed(value: &Value, ty: &Type) -> serde_json::Value {
    match (value, ty.resolve()) {
        (Value::Vector(xs), Type::Record(rt)) if xs.len() == rt.fields.len() => {
            let mut obj = serde_json::Map::new();
            for (x, field) in xs.iter().zip(&rt.fields) {
                obj.insert(field.name.clone(), to_json_typed(x, &field.ty));
            }
            serde_json::Value::Object(obj)
        }
        _ => crate::value::to_json(value),
    }
}

// -- Tests ----------------------------------------------------------------
