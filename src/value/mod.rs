//! The tagged value model.
//!
//! [`Value`] is the closed sum type used uniformly by storage, indexing,
//! and predicate evaluation. Variant declaration order defines the
//! cross-variant ordering (tag order), so any two values compare
//! deterministically. Containers order lexicographically.
//!
//! [`ValueView`](view::ValueView) is the borrowed companion; see `view.rs`.
//! The stable byte encoding lives in `wire.rs`.

pub mod view;
pub mod wire;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use ordered_float::OrderedFloat;
use regex_lite::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

pub use view::ValueView;

// -- Relational operators -------------------------------------------------

/// The twelve relational operators of predicate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,
    NotIn,
    Ni,
    NotNi,
    Match,
    NotMatch,
}

impl RelOp {
    /// Logical negation: `==` <-> `!=`, `<` <-> `>=`, `in` <-> `!in`, ...
    pub fn negate(self) -> Self {
        use RelOp::*;
        match self {
            Equal => NotEqual,
            NotEqual => Equal,
            Less => GreaterEqual,
            LessEqual => Greater,
            Greater => LessEqual,
            GreaterEqual => Less,
            In => NotIn,
            NotIn => In,
            Ni => NotNi,
            NotNi => Ni,
            Match => NotMatch,
            NotMatch => Match,
        }
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelOp::Equal => "==",
            RelOp::NotEqual => "!=",
            RelOp::Less => "<",
            RelOp::LessEqual => "<=",
            RelOp::Greater => ">",
            RelOp::GreaterEqual => ">=",
            RelOp::In => "in",
            RelOp::NotIn => "!in",
            RelOp::Ni => "ni",
            RelOp::NotNi => "!ni",
            RelOp::Match => "~",
            RelOp::NotMatch => "!~",
        };
        f.write_str(s)
    }
}

// -- Pattern --------------------------------------------------------------

/// A regular expression plus its compiled matcher. Identity (equality,
/// ordering, hashing) is by source text.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    anchored: Regex,
    unanchored: Regex,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let anchored = Regex::new(&format!("^(?:{source})$"))
            .map_err(|e| Error::InvalidArgument(format!("bad pattern '{source}': {e}")))?;
        let unanchored = Regex::new(&source)
            .map_err(|e| Error::InvalidArgument(format!("bad pattern '{source}': {e}")))?;
        Ok(Self {
            source,
            anchored,
            unanchored,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Anchored match over the whole input.
    pub fn matches(&self, input: &str) -> bool {
        self.anchored.is_match(input)
    }

    /// Unanchored search anywhere in the input.
    pub fn search(&self, input: &str) -> bool {
        self.unanchored.is_match(input)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl PartialOrd for Pattern {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pattern {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.source.cmp(&other.source)
    }
}

impl std::hash::Hash for Pattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.source)
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(source).map_err(serde::de::Error::custom)
    }
}

// -- Address --------------------------------------------------------------

/// Prefix marking an IPv4-mapped address (`::ffff:a.b.c.d`).
const V4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

/// An IP address as 16 raw bytes; IPv4 addresses are stored v4-mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    bytes: [u8; 16],
}

impl Address {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    pub fn from_v4(octets: [u8; 4]) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..12].copy_from_slice(&V4_MAPPED_PREFIX);
        bytes[12..].copy_from_slice(&octets);
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    pub fn is_v4(&self) -> bool {
        self.bytes[..12] == V4_MAPPED_PREFIX
    }

    /// Zero all bits below the top `prefix` bits of the 128-bit address.
    pub fn mask(&mut self, prefix: u8) {
        let prefix = prefix.min(128) as usize;
        for i in 0..16 {
            let bit_start = i * 8;
            if bit_start + 8 <= prefix {
                continue;
            }
            if bit_start >= prefix {
                self.bytes[i] = 0;
            } else {
                let keep = prefix - bit_start;
                self.bytes[i] &= 0xffu8 << (8 - keep);
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_v4() {
            let o = &self.bytes[12..];
            write!(f, "{}.{}.{}.{}", o[0], o[1], o[2], o[3])
        } else {
            write!(f, "{}", std::net::Ipv6Addr::from(self.bytes))
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(v4)) => Ok(Address::from_v4(v4.octets())),
            Ok(std::net::IpAddr::V6(v6)) => Ok(Address::from_bytes(v6.octets())),
            Err(_) => Err(Error::Parse(format!("bad address: {s}"))),
        }
    }
}

// -- Subnet ---------------------------------------------------------------

/// An address prefix. For v4-mapped networks the length counts v4 bits
/// (0..=32), otherwise v6 bits (0..=128).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subnet {
    network: Address,
    length: u8,
}

impl Subnet {
    pub fn new(mut network: Address, length: u8) -> Self {
        let length = if network.is_v4() {
            length.min(32)
        } else {
            length.min(128)
        };
        network.mask(Self::top_bits(&network, length));
        Self { network, length }
    }

    fn top_bits(network: &Address, length: u8) -> u8 {
        if network.is_v4() {
            96 + length
        } else {
            length
        }
    }

    pub fn network(&self) -> &Address {
        &self.network
    }

    pub fn length(&self) -> u8 {
        self.length
    }

    /// Prefix length in 128-bit terms.
    pub fn effective_length(&self) -> u8 {
        Self::top_bits(&self.network, self.length)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        let mut masked = *addr;
        masked.mask(self.effective_length());
        masked == self.network
    }

    pub fn contains_subnet(&self, other: &Subnet) -> bool {
        other.effective_length() >= self.effective_length() && self.contains(&other.network)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.length)
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = s
            .rsplit_once('/')
            .ok_or_else(|| Error::Parse(format!("bad subnet: {s}")))?;
        let network: Address = addr.parse()?;
        let length: u8 = len
            .parse()
            .map_err(|_| Error::Parse(format!("bad subnet length: {s}")))?;
        Ok(Subnet::new(network, length))
    }
}

// -- Port -----------------------------------------------------------------

/// Transport protocol tag of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Proto {
    Unknown = 0,
    Tcp = 1,
    Udp = 2,
    Icmp = 3,
}

impl Proto {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Unknown),
            1 => Some(Self::Tcp),
            2 => Some(Self::Udp),
            3 => Some(Self::Icmp),
            _ => None,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Proto::Unknown => "?",
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Icmp => "icmp",
        };
        f.write_str(s)
    }
}

/// A transport-layer port with protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Port {
    pub number: u16,
    pub proto: Proto,
}

impl Port {
    pub fn new(number: u16, proto: Proto) -> Self {
        Self { number, proto }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.proto)
    }
}

impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (num, proto) = s
            .split_once('/')
            .ok_or_else(|| Error::Parse(format!("bad port: {s}")))?;
        let number: u16 = num
            .parse()
            .map_err(|_| Error::Parse(format!("bad port number: {s}")))?;
        let proto = match proto {
            "?" | "unknown" => Proto::Unknown,
            "tcp" => Proto::Tcp,
            "udp" => Proto::Udp,
            "icmp" => Proto::Icmp,
            _ => return Err(Error::Parse(format!("bad port protocol: {s}"))),
        };
        Ok(Port::new(number, proto))
    }
}

// -- Value ----------------------------------------------------------------

/// The closed sum of all data values. Variant order is the cross-variant
/// comparison order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Count(u64),
    Real(OrderedFloat<f64>),
    /// Signed nanoseconds.
    Duration(i64),
    /// Signed nanoseconds since the UNIX epoch.
    Time(i64),
    String(String),
    Pattern(Pattern),
    Address(Address),
    Subnet(Subnet),
    Port(Port),
    Enumeration(u8),
    Vector(Vec<Value>),
    Set(BTreeSet<Value>),
    Map(BTreeMap<Value, Value>),
}

impl Value {
    pub fn real(x: f64) -> Self {
        Value::Real(OrderedFloat(x))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Vector(_) | Value::Set(_) | Value::Map(_))
    }

    /// Short variant name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Count(_) => "count",
            Value::Real(_) => "real",
            Value::Duration(_) => "duration",
            Value::Time(_) => "time",
            Value::String(_) => "string",
            Value::Pattern(_) => "pattern",
            Value::Address(_) => "address",
            Value::Subnet(_) => "subnet",
            Value::Port(_) => "port",
            Value::Enumeration(_) => "enumeration",
            Value::Vector(_) => "vector",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
        }
    }

    /// Merge `rhs` into `self`, the aggregation flavor of addition:
    /// numbers add (narrowing saturates), strings concatenate, containers
    /// absorb, `nil` is replaced. A scalar merged with a container is
    /// first lifted into a singleton container of the same kind.
    /// Everything else is a no-op.
    pub fn merge(&mut self, rhs: &Value) {
        use Value::*;
        // Lift: scalar lhs absorbs into a container of rhs's kind.
        if !self.is_container() && !self.is_nil() && rhs.is_container() {
            let lhs = std::mem::replace(self, Nil);
            *self = match rhs {
                Vector(_) => Vector(vec![lhs]),
                Set(_) => {
                    let mut s = BTreeSet::new();
                    s.insert(lhs);
                    Set(s)
                }
                Map(_) => {
                    // No element to pair a lone scalar with.
                    lhs
                }
                _ => unreachable!(),
            };
            if self.is_container() {
                self.merge(rhs);
            }
            return;
        }
        match (&mut *self, rhs) {
            (this @ Nil, y) => *this = y.clone(),
            (Integer(x), Integer(y)) => *x = x.saturating_add(*y),
            (Integer(x), Count(y)) => {
                *x = x.saturating_add(i64::try_from(*y).unwrap_or(i64::MAX))
            }
            (Integer(x), Real(y)) => {
                *x = (*x as f64 + y.0).clamp(i64::MIN as f64, i64::MAX as f64) as i64
            }
            (Count(x), Count(y)) => *x = x.saturating_add(*y),
            (Count(x), Integer(y)) => {
                *x = if *y >= 0 {
                    x.saturating_add(*y as u64)
                } else {
                    x.saturating_sub(y.unsigned_abs())
                }
            }
            (Count(x), Real(y)) => *x = (*x as f64 + y.0).clamp(0.0, u64::MAX as f64) as u64,
            (Real(x), Integer(y)) => x.0 += *y as f64,
            (Real(x), Count(y)) => x.0 += *y as f64,
            (Real(x), Real(y)) => x.0 += y.0,
            (Enumeration(x), Integer(y)) => {
                *x = (*x as i64).saturating_add(*y).clamp(0, u8::MAX as i64) as u8
            }
            (Enumeration(x), Count(y)) => {
                *x = (*x as u64).saturating_add(*y).min(u8::MAX as u64) as u8
            }
            (Duration(x), Duration(y)) => *x = x.saturating_add(*y),
            (Time(x), Duration(y)) => *x = x.saturating_add(*y),
            (String(x), String(y)) => x.push_str(y),
            (Port(p), Integer(y)) => {
                p.number = (p.number as i64).saturating_add(*y).clamp(0, u16::MAX as i64) as u16
            }
            (Port(p), Count(y)) => {
                p.number = (p.number as u64).saturating_add(*y).min(u16::MAX as u64) as u16
            }
            (Vector(xs), Vector(ys)) => xs.extend(ys.iter().cloned()),
            (Vector(xs), Set(ys)) => xs.extend(ys.iter().cloned()),
            (Vector(xs), y) => xs.push(y.clone()),
            (Set(xs), Vector(ys)) => xs.extend(ys.iter().cloned()),
            (Set(xs), Set(ys)) => xs.extend(ys.iter().cloned()),
            (Set(xs), y) => {
                xs.insert(y.clone());
            }
            (Map(xs), Map(ys)) => {
                // Right-hand side wins on key conflicts.
                for (k, v) in ys {
                    xs.insert(k.clone(), v.clone());
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(x) => write!(f, "{x}"),
            Value::Count(x) => write!(f, "{x}"),
            Value::Real(x) => write!(f, "{}", x.0),
            Value::Duration(ns) => write!(f, "{ns}ns"),
            Value::Time(ns) => write!(f, "@{ns}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Pattern(p) => write!(f, "{p}"),
            Value::Address(a) => write!(f, "{a}"),
            Value::Subnet(s) => write!(f, "{s}"),
            Value::Port(p) => write!(f, "{p}"),
            Value::Enumeration(e) => write!(f, "{e}"),
            Value::Vector(xs) => {
                f.write_str("[")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("]")
            }
            Value::Set(xs) => {
                f.write_str("{")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("}")
            }
            Value::Map(xs) => {
                f.write_str("{")?;
                for (i, (k, v)) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} -> {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

// -- Predicate evaluation -------------------------------------------------

fn check_match(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::String(s), Value::Pattern(p)) => p.matches(s),
        _ => false,
    }
}

fn check_in(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::String(x), Value::String(y)) => y.contains(x.as_str()),
        (Value::String(x), Value::Pattern(p)) => p.search(x),
        (Value::Address(a), Value::Subnet(s)) => s.contains(a),
        (Value::Subnet(x), Value::Subnet(y)) => y.contains_subnet(x),
        (x, Value::Vector(ys)) => ys.contains(x),
        (x, Value::Set(ys)) => ys.contains(x),
        _ => false,
    }
}

/// Evaluate `lhs op rhs` over concrete values.
pub fn evaluate(lhs: &Value, op: RelOp, rhs: &Value) -> bool {
    match op {
        RelOp::Match => check_match(lhs, rhs),
        RelOp::NotMatch => !check_match(lhs, rhs),
        RelOp::In => check_in(lhs, rhs),
        RelOp::NotIn => !check_in(lhs, rhs),
        RelOp::Ni => check_in(rhs, lhs),
        RelOp::NotNi => !check_in(rhs, lhs),
        RelOp::Equal => lhs == rhs,
        RelOp::NotEqual => lhs != rhs,
        RelOp::Less => lhs < rhs,
        RelOp::LessEqual => lhs <= rhs,
        RelOp::Greater => lhs > rhs,
        RelOp::GreaterEqual => lhs >= rhs,
    }
}

// -- JSON projection ------------------------------------------------------

/// Project a value into JSON. Ports project as their number; `nil` as
/// `null`; addresses, subnets, and patterns as strings; maps as arrays of
/// `[key, value]` pairs.
pub fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::json;
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Integer(x) => json!(x),
        Value::Count(x) => json!(x),
        Value::Real(x) => json!(x.0),
        Value::Duration(ns) => json!(ns),
        Value::Time(ns) => json!(ns),
        Value::String(s) => json!(s),
        Value::Pattern(p) => json!(p.as_str()),
        Value::Address(a) => json!(a.to_string()),
        Value::Subnet(s) => json!(s.to_string()),
        Value::Port(p) => json!(p.number),
        Value::Enumeration(e) => json!(e),
        Value::Vector(xs) => serde_json::Value::Array(xs.iter().map(to_json).collect()),
        Value::Set(xs) => serde_json::Value::Array(xs.iter().map(to_json).collect()),
        Value::Map(xs) => serde_json::Value::Array(
            xs.iter()
                .map(|(k, v)| serde_json::Value::Array(vec![to_json(k), to_json(v)]))
                .collect(),
        ),
    }
}

// -- Tests ----------------------------------------------------------------
