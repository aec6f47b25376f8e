//! Stable wire encoding of values.
//!
//! One tag byte identifying the variant, then a variant-specific payload:
//! LEB128 varints for integral data (zigzag for signed), little-endian
//! IEEE-754 for reals, length-prefixed bytes for strings and patterns,
//! raw bytes plus flags for network types, and count-prefixed elements
//! for containers. The format is what segment chunks persist, so it must
//! never change shape for an existing tag.

use std::io::Write;

use ordered_float::OrderedFloat;

use super::{Address, Pattern, Port, Proto, Subnet, Value, ValueView};
use crate::error::{Error, Result};

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_COUNT: u8 = 3;
const TAG_REAL: u8 = 4;
const TAG_DURATION: u8 = 5;
const TAG_TIME: u8 = 6;
const TAG_STRING: u8 = 7;
const TAG_PATTERN: u8 = 8;
const TAG_ADDRESS: u8 = 9;
const TAG_SUBNET: u8 = 10;
const TAG_PORT: u8 = 11;
const TAG_ENUMERATION: u8 = 12;
const TAG_VECTOR: u8 = 13;
const TAG_SET: u8 = 14;
const TAG_MAP: u8 = 15;

// -- Varints --------------------------------------------------------------

pub fn write_varint<W: Write>(w: &mut W, mut x: u64) -> Result<()> {
    loop {
        let byte = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            w.write_all(&[byte])?;
            return Ok(());
        }
        w.write_all(&[byte | 0x80])?;
    }
}

pub fn read_varint(input: &mut &[u8]) -> Result<u64> {
    let mut x = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input
            .split_first()
            .ok_or_else(|| Error::Format("truncated varint".into()))?;
        *input = rest;
        if shift >= 64 {
            return Err(Error::Format("varint too long".into()));
        }
        x |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(x);
        }
        shift += 7;
    }
}

#[inline]
fn zigzag(x: i64) -> u64 {
    ((x << 1) ^ (x >> 63)) as u64
}

#[inline]
fn unzigzag(x: u64) -> i64 {
    ((x >> 1) as i64) ^ -((x & 1) as i64)
}

// -- Encoding -------------------------------------------------------------

fn read_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(Error::Format("truncated value".into()));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

/// Encode a value view into the writer.
pub fn write_value<W: Write>(w: &mut W, value: ValueView<'_>) -> Result<()> {
    match value {
        ValueView::Nil => w.write_all(&[TAG_NIL])?,
        ValueView::Bool(b) => w.write_all(&[TAG_BOOL, b as u8])?,
        ValueView::Integer(x) => {
            w.write_all(&[TAG_INTEGER])?;
            write_varint(w, zigzag(x))?;
        }
        ValueView::Count(x) => {
            w.write_all(&[TAG_COUNT])?;
            write_varint(w, x)?;
        }
        ValueView::Real(x) => {
            w.write_all(&[TAG_REAL])?;
            w.write_all(&x.0.to_le_bytes())?;
        }
        ValueView::Duration(x) => {
            w.write_all(&[TAG_DURATION])?;
            write_varint(w, zigzag(x))?;
        }
        ValueView::Time(x) => {
            w.write_all(&[TAG_TIME])?;
            write_varint(w, zigzag(x))?;
        }
        ValueView::String(s) => {
            w.write_all(&[TAG_STRING])?;
            write_varint(w, s.len() as u64)?;
            w.write_all(s.as_bytes())?;
        }
        ValueView::Pattern(p) => {
            w.write_all(&[TAG_PATTERN])?;
            write_varint(w, p.as_str().len() as u64)?;
            w.write_all(p.as_str().as_bytes())?;
        }
        ValueView::Address(a) => {
            w.write_all(&[TAG_ADDRESS])?;
            w.write_all(a.bytes())?;
            w.write_all(&[a.is_v4() as u8])?;
        }
        ValueView::Subnet(s) => {
            w.write_all(&[TAG_SUBNET])?;
            w.write_all(s.network().bytes())?;
            w.write_all(&[s.network().is_v4() as u8, s.length()])?;
        }
        ValueView::Port(p) => {
            w.write_all(&[TAG_PORT])?;
            w.write_all(&p.number.to_le_bytes())?;
            w.write_all(&[p.proto as u8])?;
        }
        ValueView::Enumeration(e) => {
            w.write_all(&[TAG_ENUMERATION])?;
            write_varint(w, e as u64)?;
        }
        ValueView::Vector(xs) => {
            w.write_all(&[TAG_VECTOR])?;
            write_varint(w, xs.len() as u64)?;
            for x in xs {
                write_value(w, x.view())?;
            }
        }
        ValueView::Set(xs) => {
            w.write_all(&[TAG_SET])?;
            write_varint(w, xs.len() as u64)?;
            for x in xs {
                write_value(w, x.view())?;
            }
        }
        ValueView::Map(xs) => {
            w.write_all(&[TAG_MAP])?;
            write_varint(w, xs.len() as u64)?;
            for (k, v) in xs {
                write_value(w, k.view())?;
                write_value(w, v.view())?;
            }
        }
    }
    Ok(())
}

/// Encode a value into a fresh byte vector.
pub fn encode(value: ValueView<'_>) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(&mut buf, value).expect("writing to a Vec cannot fail");
    buf
}

/// Decode one value from the front of `input`, advancing it.
pub fn read_value(input: &mut &[u8]) -> Result<Value> {
    let (&tag, rest) = input
        .split_first()
        .ok_or_else(|| Error::Format("truncated value: missing tag".into()))?;
    *input = rest;
    let value = match tag {
        TAG_NIL => Value::Nil,
        TAG_BOOL => {
            let b = read_bytes(input, 1)?[0];
            Value::Bool(b != 0)
        }
        TAG_INTEGER => Value::Integer(unzigzag(read_varint(input)?)),
        TAG_COUNT => Value::Count(read_varint(input)?),
        TAG_REAL => {
            let bytes: [u8; 8] = read_bytes(input, 8)?.try_into().unwrap();
            Value::Real(OrderedFloat(f64::from_le_bytes(bytes)))
        }
        TAG_DURATION => Value::Duration(unzigzag(read_varint(input)?)),
        TAG_TIME => Value::Time(unzigzag(read_varint(input)?)),
        TAG_STRING => {
            let len = read_varint(input)? as usize;
            let bytes = read_bytes(input, len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| Error::Format("string is not valid UTF-8".into()))?;
            Value::String(s.to_string())
        }
        TAG_PATTERN => {
            let len = read_varint(input)? as usize;
            let bytes = read_bytes(input, len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| Error::Format("pattern is not valid UTF-8".into()))?;
            Value::Pattern(
                Pattern::new(s).map_err(|e| Error::Format(format!("bad stored pattern: {e}")))?,
            )
        }
        TAG_ADDRESS => {
            let bytes: [u8; 16] = read_bytes(input, 16)?.try_into().unwrap();
            let _v4_flag = read_bytes(input, 1)?[0];
            Value::Address(Address::from_bytes(bytes))
        }
        TAG_SUBNET => {
            let bytes: [u8; 16] = read_bytes(input, 16)?.try_into().unwrap();
            let rest = read_bytes(input, 2)?;
            let length = rest[1];
            Value::Subnet(Subnet::new(Address::from_bytes(bytes), length))
        }
        TAG_PORT => {
            let num: [u8; 2] = read_bytes(input, 2)?.try_into().unwrap();
            let proto = read_bytes(input, 1)?[0];
            let proto = Proto::from_u8(proto)
                .ok_or_else(|| Error::Format(format!("bad port protocol tag: {proto}")))?;
            Value::Port(Port::new(u16::from_le_bytes(num), proto))
        }
        TAG_ENUMERATION => {
            let e = read_varint(input)?;
            if e > u8::MAX as u64 {
                return Err(Error::Format(format!("enumeration out of range: {e}")));
            }
            Value::Enumeration(e as u8)
        }
        TAG_VECTOR => {
            let n = read_varint(input)? as usize;
            let mut xs = Vec::with_capacity(n.min(4096));
            for _ in 0..n {
                xs.push(read_value(input)?);
            }
            Value::Vector(xs)
        }
        TAG_SET => {
            let n = read_varint(input)? as usize;
            let mut xs = std::collections::BTreeSet::new();
            for _ in 0..n {
                xs.insert(read_value(input)?);
            }
            Value::Set(xs)
        }
        TAG_MAP => {
            let n = read_varint(input)? as usize;
            let mut xs = std::collections::BTreeMap::new();
            for _ in 0..n {
                let k = read_value(input)?;
                let v = read_value(input)?;
                xs.insert(k, v);
            }
            Value::Map(xs)
        }
        other => return Err(Error::Format(format!("unknown value tag: {other}"))),
    };
    Ok(value)
}

/// Decode a value that must span the entire input.
pub fn decode(mut input: &[u8]) -> Result<Value> {
    let value = read_value(&mut input)?;
    if !input.is_empty() {
        return Err(Error::Format(format!(
            "{} trailing bytes after value",
            input.len()
        )));
    }
    Ok(value)
}

// -- Tests ----------------------------------------------------------------
