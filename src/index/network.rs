//! Network value indices: addresses, subnets, and ports.

use serde::{Deserialize, Serialize};

use super::{container_lookup, IndexBase, ValueIndex};
use crate::bitmap::Bitmap;
use crate::coder::{Base, BitSliceCoder, BitmapIndex, EqualityCoder, SingletonCoder};
use crate::error::{Error, Result};
use crate::value::{Address, Proto, RelOp, Subnet, ValueView};

// -- AddressIndex ---------------------------------------------------------

/// Sixteen per-byte bit-sliced indices plus a flag index for IPv4-mapped
/// addresses. Equality against an IPv4 address restricts candidates to
/// the v4 rows; subnet membership walks the network prefix bytewise and
/// finishes bit by bit.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddressIndex {
    base: IndexBase,
    bytes: Vec<BitSliceCoder>,
    v4: SingletonCoder,
}

impl AddressIndex {
    pub fn new() -> Self {
        Self {
            base: IndexBase::default(),
            bytes: vec![BitSliceCoder::new(); 16],
            v4: SingletonCoder::new(),
        }
    }

    fn equality(&self, op: RelOp, addr: &Address) -> Bitmap {
        let offset = self.offset();
        let negate = op == RelOp::NotEqual;
        let mut result = if addr.is_v4() {
            self.v4.storage()
        } else {
            Bitmap::filled(offset, true)
        };
        let start = if addr.is_v4() { 12 } else { 0 };
        for i in start..16 {
            if !result.any() {
                return Bitmap::filled(offset, negate);
            }
            result &= &self.bytes[i].eq(addr.bytes()[i]);
        }
        result.pad_to(offset);
        if negate {
            result.flip();
        }
        result
    }

    fn prefix_membership(&self, op: RelOp, subnet: &Subnet) -> Result<Bitmap> {
        let offset = self.offset();
        let negate = op == RelOp::NotIn;
        let mut topk = subnet.length() as u64;
        if topk == 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid subnet prefix length in {subnet}"
            )));
        }
        let is_v4 = subnet.network().is_v4();
        if subnet.effective_length() == 128 {
            // /32 and /128 membership is an equality lookup.
            let op = if op == RelOp::In {
                RelOp::Equal
            } else {
                RelOp::NotEqual
            };
            return Ok(self.equality(op, subnet.network()));
        }
        let mut result = if is_v4 {
            self.v4.storage()
        } else {
            Bitmap::filled(offset, true)
        };
        let network = subnet.network().bytes();
        let mut i = if is_v4 { 12 } else { 0 };
        while i < 16 && topk >= 8 {
            result &= &self.bytes[i].eq(network[i]);
            i += 1;
            topk -= 8;
        }
        for j in 0..topk {
            let bit = (7 - j) as u8;
            let zero = self.bytes[i].storage(bit);
            if (network[i] >> bit) & 1 == 1 {
                result &= &!&zero;
            } else {
                result &= &zero;
            }
        }
        result.pad_to(offset);
        if negate {
            result.flip();
        }
        Ok(result)
    }
}

impl Default for AddressIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueIndex for AddressIndex {
    fn base(&self) -> &IndexBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut IndexBase {
        &mut self.base
    }

    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        let addr = match value {
            ValueView::Address(a) => a,
            other => {
                return Err(Error::TypeClash(format!(
                    "{} value in address index",
                    other.kind_name()
                )))
            }
        };
        for (coder, &byte) in self.bytes.iter_mut().zip(addr.bytes()) {
            coder.skip(pos - coder.len());
            coder.append(byte);
        }
        self.v4.skip(pos - self.v4.len());
        self.v4.append(addr.is_v4());
        Ok(())
    }

    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        match (op, value) {
            (RelOp::Equal | RelOp::NotEqual, ValueView::Address(a)) => Ok(self.equality(op, a)),
            (RelOp::In | RelOp::NotIn, ValueView::Subnet(s)) => self.prefix_membership(op, s),
            (_, ValueView::Vector(xs)) => container_lookup(self, op, xs.iter().map(|x| x.view())),
            (_, ValueView::Set(xs)) => container_lookup(self, op, xs.iter().map(|x| x.view())),
            (_, ValueView::Address(_) | ValueView::Subnet(_)) => Err(Error::UnsupportedOperator(
                format!("{op} on address index"),
            )),
            (_, other) => Err(Error::TypeClash(format!(
                "{} query against address index",
                other.kind_name()
            ))),
        }
    }
}

// -- SubnetIndex ----------------------------------------------------------

/// Composes an address index over the network with a prefix-length
/// index. Supports exact equality, subset (`in`), and superset (`ni`)
/// relations, plus address membership via `ni`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubnetIndex {
    base: IndexBase,
    network: AddressIndex,
    length: EqualityCoder,
}

impl SubnetIndex {
    pub fn new() -> Self {
        Self {
            base: IndexBase::default(),
            network: AddressIndex::new(),
            // Prefix lengths 0..=128.
            length: EqualityCoder::new(129),
        }
    }

    /// Rows holding a subnet that contains `addr`: for every prefix
    /// length, mask the address and probe for an exact network match.
    fn containing_address(&self, op: RelOp, addr: &Address) -> Result<Bitmap> {
        let offset = self.offset();
        let bits: u64 = if addr.is_v4() { 32 } else { 128 };
        let mut result = Bitmap::filled(offset, false);
        for i in 0..=bits {
            let mut masked = *addr;
            masked.mask((128 - bits + i) as u8);
            let net = self
                .network
                .lookup(RelOp::Equal, ValueView::Address(&masked))?;
            let len = self.length.eq(i);
            result |= &(&net & &len);
        }
        result.pad_to(offset);
        if op == RelOp::NotNi {
            result.flip();
        }
        Ok(result)
    }

    fn subnet_relation(&self, op: RelOp, subnet: &Subnet) -> Result<Bitmap> {
        let offset = self.offset();
        match op {
            RelOp::Equal | RelOp::NotEqual => {
                let mut result = self
                    .network
                    .lookup(RelOp::Equal, ValueView::Address(subnet.network()))?;
                result &= &self.length.eq(subnet.length() as u64);
                result.pad_to(offset);
                if op == RelOp::NotEqual {
                    result.flip();
                }
                Ok(result)
            }
            RelOp::In | RelOp::NotIn => {
                // Stored subnets that are a subset of the queried one:
                // network inside it and at least as long a prefix.
                let mut result = self
                    .network
                    .lookup(RelOp::In, ValueView::Subnet(subnet))?;
                result &= &self
                    .length
                    .lookup(RelOp::GreaterEqual, subnet.length() as u64)?;
                result.pad_to(offset);
                if op == RelOp::NotIn {
                    result.flip();
                }
                Ok(result)
            }
            RelOp::Ni | RelOp::NotNi => {
                // Stored subnets that include the queried one: probe each
                // shorter-or-equal prefix of the queried network.
                let mut result = Bitmap::filled(offset, false);
                for i in 1..=subnet.length() {
                    let shorter = Subnet::new(*subnet.network(), i);
                    let mut hits = self
                        .network
                        .lookup(RelOp::In, ValueView::Subnet(&shorter))?;
                    hits &= &self.length.eq(i as u64);
                    result |= &hits;
                }
                result.pad_to(offset);
                if op == RelOp::NotNi {
                    result.flip();
                }
                Ok(result)
            }
            _ => Err(Error::UnsupportedOperator(format!("{op} on subnet index"))),
        }
    }
}

impl Default for SubnetIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueIndex for SubnetIndex {
    fn base(&self) -> &IndexBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut IndexBase {
        &mut self.base
    }

    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        let subnet = match value {
            ValueView::Subnet(s) => s,
            other => {
                return Err(Error::TypeClash(format!(
                    "{} value in subnet index",
                    other.kind_name()
                )))
            }
        };
        self.length.skip(pos - self.length.len());
        self.length.append(subnet.length() as u64);
        self.network
            .append_at(ValueView::Address(subnet.network()), pos)
    }

    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        match (op, value) {
            (RelOp::Ni | RelOp::NotNi, ValueView::Address(a)) => self.containing_address(op, a),
            (_, ValueView::Subnet(s)) => self.subnet_relation(op, s),
            (_, ValueView::Vector(xs)) => container_lookup(self, op, xs.iter().map(|x| x.view())),
            (_, ValueView::Set(xs)) => container_lookup(self, op, xs.iter().map(|x| x.view())),
            (_, ValueView::Address(_)) => Err(Error::UnsupportedOperator(format!(
                "{op} with an address against a subnet index"
            ))),
            (_, other) => Err(Error::TypeClash(format!(
                "{} query against subnet index",
                other.kind_name()
            ))),
        }
    }
}

// -- PortIndex ------------------------------------------------------------

/// Port number index plus an 8-bit protocol index. Comparisons ignore
/// the protocol iff the queried protocol is unknown.
#[derive(Debug, Serialize, Deserialize)]
pub struct PortIndex {
    base: IndexBase,
    number: BitmapIndex,
    proto: EqualityCoder,
}

impl PortIndex {
    pub fn new() -> Self {
        Self {
            base: IndexBase::default(),
            // Five base-10 digits cover the 16-bit port space.
            number: BitmapIndex::new(Base::uniform(10, 5)),
            proto: EqualityCoder::new(256),
        }
    }
}

impl Default for PortIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueIndex for PortIndex {
    fn base(&self) -> &IndexBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut IndexBase {
        &mut self.base
    }

    fn append_impl(&mut self, value: ValueView<'_>, pos: u64) -> Result<()> {
        let port = match value {
            ValueView::Port(p) => p,
            other => {
                return Err(Error::TypeClash(format!(
                    "{} value in port index",
                    other.kind_name()
                )))
            }
        };
        self.number.skip(pos - self.number.len());
        self.number.append(port.number as u64);
        self.proto.skip(pos - self.proto.len());
        self.proto.append(port.proto as u8 as u64);
        Ok(())
    }

    fn lookup_impl(&self, op: RelOp, value: ValueView<'_>) -> Result<Bitmap> {
        match value {
            ValueView::Port(port) => {
                let mut result = self.number.lookup(op, port.number as u64)?;
                if result.any() && port.proto != Proto::Unknown {
                    result &= &self.proto.eq(port.proto as u8 as u64);
                }
                result.pad_to(self.offset());
                Ok(result)
            }
            ValueView::Vector(xs) => container_lookup(self, op, xs.iter().map(|x| x.view())),
            ValueView::Set(xs) => container_lookup(self, op, xs.iter().map(|x| x.view())),
            other => Err(Error::TypeClash(format!(
                "{} query against port index",
                other.kind_name()
            ))),
        }
    }
}

// -- Tests ----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Port, Value};

    fn addr(s: &str) -> Value {
        Value::Address(s.parse().unwrap())
    }

    fn subnet(s: &str) -> Value {
        Value::Subnet(s.parse().unwrap())
    }

    fn address_index(addrs: &[&str]) -> AddressIndex {
        let mut idx = AddressIndex::new();
        for a in addrs {
            idx.append(addr(a).view()).unwrap();
        }
        idx
    }

    fn ids(bm: Bitmap) -> Vec<u64> {
        bm.ones().collect()
    }

    #[test]
    fn test_address_equality() {
        let idx = address_index(&["10.0.0.1", "192.168.1.2", "10.0.0.1"]);
        let hits = idx.lookup(RelOp::Equal, addr("10.0.0.1").view()).unwrap();
        assert_eq!(ids(hits), vec![0, 2]);
        let misses = idx
            .lookup(RelOp::NotEqual, addr("10.0.0.1").view())
            .unwrap();
        assert_eq!(ids(misses), vec![1]);
    }

    #[test]
    fn test_address_subnet_membership() {
        let idx = address_index(&["10.0.0.1", "192.168.1.2", "10.0.0.1"]);
        let hits = idx.lookup(RelOp::In, subnet("10.0.0.0/24").view()).unwrap();
        assert_eq!(ids(hits), vec![0, 2]);
        let hits = idx.lookup(RelOp::In, subnet("10.0.0.0/8").view()).unwrap();
        assert_eq!(ids(hits), vec![0, 2]);
        let out = idx
            .lookup(RelOp::NotIn, subnet("10.0.0.0/24").view())
            .unwrap();
        assert_eq!(ids(out), vec![1]);
        // Non-byte-aligned prefix exercises the bit-level tail.
        let hits = idx
            .lookup(RelOp::In, subnet("192.168.0.0/15").view())
            .unwrap();
        assert_eq!(ids(hits), vec![1]);
    }

    #[test]
    fn test_address_v4_v6_distinct() {
        let idx = address_index(&["10.0.0.1", "::ffff:10.0.0.1", "2001:db8::1"]);
        // "::ffff:10.0.0.1" is the v4-mapped form of 10.0.0.1; they are
        // the same 16 bytes.
        let hits = idx.lookup(RelOp::Equal, addr("10.0.0.1").view()).unwrap();
        assert_eq!(ids(hits), vec![0, 1]);
        let hits = idx.lookup(RelOp::Equal, addr("2001:db8::1").view()).unwrap();
        assert_eq!(ids(hits), vec![2]);
        // A v6 query does not restrict to v4 rows.
        let hits = idx
            .lookup(RelOp::In, subnet("2001:db8::/32").view())
            .unwrap();
        assert_eq!(ids(hits), vec![2]);
    }

    #[test]
    fn test_address_32_bit_prefix_is_equality() {
        let idx = address_index(&["10.0.0.1", "10.0.0.2"]);
        let hits = idx.lookup(RelOp::In, subnet("10.0.0.1/32").view()).unwrap();
        assert_eq!(ids(hits), vec![0]);
    }

    #[test]
    fn test_address_zero_prefix_is_an_error() {
        let idx = address_index(&["10.0.0.1"]);
        assert!(idx.lookup(RelOp::In, subnet("0.0.0.0/0").view()).is_err());
    }

    #[test]
    fn test_address_unsupported_ops() {
        let idx = address_index(&["10.0.0.1"]);
        assert!(idx.lookup(RelOp::Less, addr("10.0.0.1").view()).is_err());
        assert!(idx
            .lookup(RelOp::Equal, Value::Count(1).view())
            .is_err());
    }

    #[test]
    fn test_subnet_superset_of_address() {
        let mut idx = SubnetIndex::new();
        for s in ["10.0.0.0/24", "10.0.0.0/16", "192.168.0.0/16"] {
            idx.append(subnet(s).view()).unwrap();
        }
        let hits = idx.lookup(RelOp::Ni, addr("10.0.0.5").view()).unwrap();
        assert_eq!(ids(hits), vec![0, 1]);
        let hits = idx.lookup(RelOp::Ni, addr("192.168.1.1").view()).unwrap();
        assert_eq!(ids(hits), vec![2]);
        let hits = idx.lookup(RelOp::Ni, addr("172.16.0.1").view()).unwrap();
        assert_eq!(ids(hits), Vec::<u64>::new());
    }

    #[test]
    fn test_subnet_equality_and_subset() {
        let mut idx = SubnetIndex::new();
        for s in ["10.0.0.0/24", "10.0.0.0/16", "10.1.0.0/16"] {
            idx.append(subnet(s).view()).unwrap();
        }
        let hits = idx
            .lookup(RelOp::Equal, subnet("10.0.0.0/16").view())
            .unwrap();
        assert_eq!(ids(hits), vec![1]);
        // Subset: stored subnets inside 10.0.0.0/8.
        let hits = idx.lookup(RelOp::In, subnet("10.0.0.0/8").view()).unwrap();
        assert_eq!(ids(hits), vec![0, 1, 2]);
        // Subset of 10.0.0.0/16: only the /24 and itself.
        let hits = idx.lookup(RelOp::In, subnet("10.0.0.0/16").view()).unwrap();
        assert_eq!(ids(hits), vec![0, 1]);
        // Superset of 10.0.0.0/24.
        let hits = idx.lookup(RelOp::Ni, subnet("10.0.0.0/24").view()).unwrap();
        assert_eq!(ids(hits), vec![0, 1]);
    }

    #[test]
    fn test_port_with_proto() {
        let mut idx = PortIndex::new();
        for p in [
            Port::new(80, Proto::Tcp),
            Port::new(80, Proto::Udp),
            Port::new(80, Proto::Unknown),
        ] {
            idx.append(Value::Port(p).view()).unwrap();
        }
        // Unknown proto matches any proto.
        let hits = idx
            .lookup(RelOp::Equal, Value::Port(Port::new(80, Proto::Unknown)).view())
            .unwrap();
        assert_eq!(ids(hits), vec![0, 1, 2]);
        let hits = idx
            .lookup(RelOp::Equal, Value::Port(Port::new(80, Proto::Tcp)).view())
            .unwrap();
        assert_eq!(ids(hits), vec![0]);
        let hits = idx
            .lookup(RelOp::Equal, Value::Port(Port::new(443, Proto::Tcp)).view())
            .unwrap();
        assert_eq!(ids(hits), Vec::<u64>::new());
    }

    #[test]
    fn test_port_ordering() {
        let mut idx = PortIndex::new();
        for p in [
            Port::new(22, Proto::Tcp),
            Port::new(80, Proto::Tcp),
            Port::new(8080, Proto::Tcp),
        ] {
            idx.append(Value::Port(p).view()).unwrap();
        }
        let hits = idx
            .lookup(
                RelOp::Less,
                Value::Port(Port::new(1024, Proto::Unknown)).view(),
            )
            .unwrap();
        assert_eq!(ids(hits), vec![0, 1]);
        let hits = idx
            .lookup(
                RelOp::GreaterEqual,
                Value::Port(Port::new(80, Proto::Tcp)).view(),
            )
            .unwrap();
        assert_eq!(ids(hits), vec![1, 2]);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut idx = SubnetIndex::new();
        idx.append(subnet("10.0.0.0/24").view()).unwrap();
        let bytes = bincode::serialize(&idx).unwrap();
        let back: SubnetIndex = bincode::deserialize(&bytes).unwrap();
        let hits = back.lookup(RelOp::Ni, addr("10.0.0.9").view()).unwrap();
        assert_eq!(ids(hits), vec![0]);
    }
}
