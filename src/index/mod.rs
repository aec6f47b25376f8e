//! Per-column value indices.
//!
//! A value index is appended row by row at explicit IDs; gaps encode nil.
//! Every index tracks two occupancy bitmaps: `mask` (positions written
//! with a concrete value) and `none` (positions written as nil). Lookups
//! run the concrete index machinery, intersect with `mask`, and pad to
//! cover the nil positions, so results never contain false hits from
//! gaps.
//!
//! The concrete indices form a closed set behind [`AnyIndex`]; the
//! serialized form is the enum tag plus the per-index payload.
//! [`IndexFactory`] is an injected registry from field type to
//! constructor, honoring the `id`, `max_size`, and `base` attributes.

pub mod arithmetic;
pub mod network;
pub mod partition;
pub mod sequence;
pub mod string;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::coder::Base;
use crate::error::{Error, Result};
use crate::schema::{Type, TypeKind, ATTR_BASE, ATTR_ID, ATTR_MAX_SIZE};
use crate::value::{RelOp, ValueView};

pub use arithmetic::{ArithmeticIndex, ArithmeticKind};
pub use network::{AddressIndex, PortIndex, SubnetIndex};
pub use partition::Partition;
pub use sequence::SequenceIndex;
pub use string::{HashIndex, StringIndex};

// -- Occupancy ------------------------------------------------------------

/// The occupancy bitmaps shared by every value index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexBase {
    mask: Bitmap,
    none: Bitmap,
}

impl IndexBase {
    /// Next appendable position.
    pub fn offset(&self) -> u64 {
        self.mask.len().max(self.none.len())
    }

    pub fn mask(&self) -> &Bitmap {
        &self.mask
    }

    pub fn none(&self) -> &Bitmap {
        &self.none
    }

    fn note_value(&mut self, pos: u64) {
        self.mask.pad_to(pos);
        self.mask.append_bit(true);
    }

    fn note_nil(&mut self, pos: u64) {
        self.none.pad_to(pos);
        self.none.append_bit(true);
    }
}

// -- ValueIndex -----------------------------------------------------------

/// Common behavior of all value indices. Implementors provide the
/// concrete append/lookup; the provided methods add occupancy handling
/// and the nil special cases.
pub trait ValueIndex {
    fn base(&self) -> &IndexBase;
    fn base_mut(&mut self) -> &mut IndexBase;

    /// Store a concrete (non-nil) value at `pos`.
    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()>;

    /// Evaluate `op` against a concrete value.
    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap>;

    /// Next appendable position.
    fn offset(&self) -> u64 {
        self.base().offset()
    }

    /// Append at the next position.
    fn append(&mut self, value: ValueView<'_>) -> Result<()> {
        self.append_at(value, self.offset())
    }

    /// Append at an explicit position. Fails if the position lies before
    /// the current offset; the gap in between encodes nil.
    fn append_at(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        let offset = self.offset();
        if pos < offset {
            return Err(Error::InvalidArgument(format!(
                "append at {pos} before index offset {offset}"
            )));
        }
        if value.is_nil() {
            self.base_mut().note_nil(pos);
            return Ok(());
        }
        self.append_impl(value, pos)?;
        self.base_mut().note_value(pos);
        Ok(())
    }

    /// Evaluate `op` against `value`, returning the bitmap of matching
    /// IDs. Results are restricted to concretely written positions and
    /// zero-padded over nil positions. Nil itself only supports equality.
    fn lookup(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        let base = self.base();
        if value.is_nil() {
            return match op {
                RelOp::Equal => {
                    let mut result = base.none.clone();
                    result.pad_to(base.mask.len());
                    Ok(result)
                }
                RelOp::NotEqual => {
                    let mut result = !&base.none;
                    if result.len() < base.mask.len() {
                        result.append_bits(true, base.mask.len() - result.len());
                    }
                    Ok(result)
                }
                _ => Err(Error::UnsupportedOperator(format!("{op} on nil"))),
            };
        }
        let mut result = self.lookup_impl(op, value)?;
        result &= &base.mask;
        result.pad_to(base.none.len());
        Ok(result)
    }
}

/// Membership lookup against a container of query values: the union of
/// equality lookups per element, flipped for the negative operator.
pub fn container_lookup<'a, I, V>(index: &I, op: RelOp, elements: V) -> Result<Bitmap>
where
    I: ValueIndex + ?Sized,
    V: IntoIterator<Item = ValueView<'a>>,
{
    match op {
        RelOp::In | RelOp::NotIn => {
            let mut result = Bitmap::filled(index.offset(), false);
            for element in elements {
                result |= &index.lookup(RelOp::Equal, element)?;
            }
            if op == RelOp::NotIn {
                result.pad_to(index.offset());
                result.flip();
            }
            Ok(result)
        }
        _ => Err(Error::UnsupportedOperator(format!("{op} on container"))),
    }
}

// -- AnyIndex -------------------------------------------------------------

/// The closed sum of concrete value indices. Serialization is the enum
/// tag plus the index payload.
#[derive(Debug, Serialize, Deserialize)]
pub enum AnyIndex {
    Arithmetic(ArithmeticIndex),
    String(StringIndex),
    Hash(HashIndex),
    Address(AddressIndex),
    Subnet(SubnetIndex),
    Port(PortIndex),
    Sequence(SequenceIndex),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            AnyIndex::Arithmetic($inner) => $body,
            AnyIndex::String($inner) => $body,
            AnyIndex::Hash($inner) => $body,
            AnyIndex::Address($inner) => $body,
            AnyIndex::Subnet($inner) => $body,
            AnyIndex::Port($inner) => $body,
            AnyIndex::Sequence($inner) => $body,
        }
    };
}

impl ValueIndex for AnyIndex {
    fn base(&self) -> &IndexBase {
        dispatch!(self, inner => inner.base())
    }

    fn base_mut(&mut self) -> &mut IndexBase {
        dispatch!(self, inner => inner.base_mut())
    }

    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        dispatch!(self, inner => inner.append_impl(value, pos))
    }

    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        dispatch!(self, inner => inner.lookup_impl(op, value))
    }
}

// -- Factory --------------------------------------------------------------

/// Attributes relevant to index construction.
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions<'a> {
    pub max_size: Option<&'a str>,
    pub base: Option<&'a str>,
    pub hash: bool,
}

impl Default for IndexOptions<'_> {
    fn default() -> Self {
        Self {
            max_size: None,
            base: None,
            hash: false,
        }
    }
}

const DEFAULT_MAX_SIZE: usize = 1024;

impl IndexOptions<'_> {
    fn max_size(&self) -> usize {
        self.max_size
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_SIZE)
    }

    /// Digit decomposition for arithmetic indices; uniform base 8 over 64
    /// bits unless the field says otherwise.
    fn parse_base(&self) -> Result<Base> {
        match self.base {
            Some(spec) => Base::parse(spec),
            None => Ok(Base::uniform64(8)),
        }
    }
}

type Constructor =
    fn(&IndexFactory, &Type, &IndexOptions<'_>) -> Result<Option<AnyIndex>>;

/// Injected registry from field type to index constructor.
#[derive(Clone)]
pub struct IndexFactory {
    constructors: Arc<HashMap<TypeKind, Constructor>>,
}

impl std::fmt::Debug for IndexFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexFactory")
            .field("types", &self.constructors.len())
            .finish()
    }
}

fn make_arithmetic(kind: ArithmeticKind) -> Constructor {
    // One function item per kind, selected at registration time.
    match kind {
        ArithmeticKind::Bool => |_, _, opts| {
            Ok(Some(AnyIndex::Arithmetic(ArithmeticIndex::new(
                ArithmeticKind::Bool,
                opts.parse_base()?,
            ))))
        },
        ArithmeticKind::Integer => |_, _, opts| {
            Ok(Some(AnyIndex::Arithmetic(ArithmeticIndex::new(
                ArithmeticKind::Integer,
                opts.parse_base()?,
            ))))
        },
        ArithmeticKind::Count => |_, _, opts| {
            Ok(Some(AnyIndex::Arithmetic(ArithmeticIndex::new(
                ArithmeticKind::Count,
                opts.parse_base()?,
            ))))
        },
        ArithmeticKind::Real => |_, _, opts| {
            Ok(Some(AnyIndex::Arithmetic(ArithmeticIndex::new(
                ArithmeticKind::Real,
                opts.parse_base()?,
            ))))
        },
        ArithmeticKind::Duration => |_, _, opts| {
            Ok(Some(AnyIndex::Arithmetic(ArithmeticIndex::new(
                ArithmeticKind::Duration,
                opts.parse_base()?,
            ))))
        },
        ArithmeticKind::Time => |_, _, opts| {
            Ok(Some(AnyIndex::Arithmetic(ArithmeticIndex::new(
                ArithmeticKind::Time,
                opts.parse_base()?,
            ))))
        },
        ArithmeticKind::Enumeration => |_, _, opts| {
            Ok(Some(AnyIndex::Arithmetic(ArithmeticIndex::new(
                ArithmeticKind::Enumeration,
                opts.parse_base()?,
            ))))
        },
    }
}

fn make_string(_: &IndexFactory, _: &Type, opts: &IndexOptions<'_>) -> Result<Option<AnyIndex>> {
    if opts.hash {
        // 40-bit digests: collisions start to matter around 2^20 rows.
        Ok(Some(AnyIndex::Hash(HashIndex::new(5))))
    } else {
        Ok(Some(AnyIndex::String(StringIndex::new(opts.max_size()))))
    }
}

fn make_address(_: &IndexFactory, _: &Type, _: &IndexOptions<'_>) -> Result<Option<AnyIndex>> {
    Ok(Some(AnyIndex::Address(AddressIndex::new())))
}

fn make_subnet(_: &IndexFactory, _: &Type, _: &IndexOptions<'_>) -> Result<Option<AnyIndex>> {
    Ok(Some(AnyIndex::Subnet(SubnetIndex::new())))
}

fn make_port(_: &IndexFactory, _: &Type, _: &IndexOptions<'_>) -> Result<Option<AnyIndex>> {
    Ok(Some(AnyIndex::Port(PortIndex::new())))
}

fn make_sequence(
    factory: &IndexFactory,
    ty: &Type,
    opts: &IndexOptions<'_>,
) -> Result<Option<AnyIndex>> {
    let value_type = match ty.resolve() {
        Type::Vector(elem) | Type::Set(elem) => (**elem).clone(),
        _ => return Ok(None),
    };
    Ok(Some(AnyIndex::Sequence(SequenceIndex::new(
        value_type,
        opts.max_size(),
        factory.clone(),
    ))))
}

impl IndexFactory {
    /// Registry with the standard index per type. Pattern, map, and
    /// record columns stay unindexed.
    pub fn standard() -> Self {
        let mut constructors: HashMap<TypeKind, Constructor> = HashMap::new();
        constructors.insert(TypeKind::Bool, make_arithmetic(ArithmeticKind::Bool));
        constructors.insert(TypeKind::Integer, make_arithmetic(ArithmeticKind::Integer));
        constructors.insert(TypeKind::Count, make_arithmetic(ArithmeticKind::Count));
        constructors.insert(TypeKind::Real, make_arithmetic(ArithmeticKind::Real));
        constructors.insert(
            TypeKind::Duration,
            make_arithmetic(ArithmeticKind::Duration),
        );
        constructors.insert(TypeKind::Time, make_arithmetic(ArithmeticKind::Time));
        constructors.insert(
            TypeKind::Enumeration,
            make_arithmetic(ArithmeticKind::Enumeration),
        );
        constructors.insert(TypeKind::String, make_string);
        constructors.insert(TypeKind::Address, make_address);
        constructors.insert(TypeKind::Subnet, make_subnet);
        constructors.insert(TypeKind::Port, make_port);
        constructors.insert(TypeKind::Vector, make_sequence);
        constructors.insert(TypeKind::Set, make_sequence);
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

    /// Construct an index for a field type, or `None` when the type has
    /// no index.
    pub fn make(&self, ty: &Type, opts: &IndexOptions<'_>) -> Result<Option<AnyIndex>> {
        match self.constructors.get(&ty.kind()) {
            Some(make) => make(self, ty, opts),
            None => Ok(None),
        }
    }

    /// Construct an index from a field's attributes.
    pub fn make_for_field(&self, field: &crate::schema::Field) -> Result<Option<AnyIndex>> {
        let opts = IndexOptions {
            max_size: field.attribute(ATTR_MAX_SIZE),
            base: field.attribute(ATTR_BASE),
            hash: field.has_attribute(ATTR_ID),
        };
        self.make(&field.ty, &opts)
    }
}

impl Default for IndexFactory {
    fn default() -> Self {
        Self::standard()
    }
}

// -- Tests ----------------------------------------------------------------
