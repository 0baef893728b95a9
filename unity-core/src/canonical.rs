//! Deterministic binary encoding (§6.4). Anything that participates in a
//! hash — block headers, transactions, proposals — goes through this
//! encoder instead of `serde_json`/`bincode`, so that two honest nodes
//! always produce byte-identical bytes regardless of serde's map/struct
//! representation choices. Fixed-width integers are little-endian;
//! variable-length quantities (byte-string lengths, set/sequence counts)
//! are LEB128 varints; sets are encoded in sort order, sequences in
//! insertion order.

use crate::error::CanonicalError;
use crate::primitives::{Address, Amount, Asset, AssetUnit, OutputReference, Price, U160, U256};

pub trait CanonicalEncode {
    fn encode(&self, enc: &mut Encoder);
}

pub trait CanonicalDecode: Sized {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError>;
}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u128(&mut self, v: u128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i128(&mut self, v: i128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// LEB128-encoded unsigned length/count.
    pub fn write_varint(&mut self, v: u64) {
        let mut buf = [0u8; 10];
        let n = leb128::write::unsigned(&mut &mut buf[..], v).expect("leb128 write to stack buffer");
        self.buf.extend_from_slice(&buf[..n]);
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// A length-prefixed byte string: varint length followed by the bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_raw(bytes);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 1 } else { 0 });
    }

    /// Encodes a sequence in insertion (caller-supplied) order, prefixed
    /// with its element count.
    pub fn write_seq<T: CanonicalEncode>(&mut self, items: &[T]) {
        self.write_varint(items.len() as u64);
        for item in items {
            item.encode(self);
        }
    }

    /// Encodes a set of orderable items, sorting a local copy first so the
    /// hash is independent of the caller's iteration order.
    pub fn write_sorted_set<T: CanonicalEncode + Clone + Ord>(&mut self, items: &[T]) {
        let mut sorted = items.to_vec();
        sorted.sort();
        self.write_seq(&sorted);
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CanonicalError> {
        if self.pos + n > self.buf.len() {
            return Err(CanonicalError::Eof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CanonicalError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CanonicalError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, CanonicalError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, CanonicalError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_u128(&mut self) -> Result<u128, CanonicalError> {
        Ok(u128::from_le_bytes(self.take(16)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, CanonicalError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i128(&mut self) -> Result<i128, CanonicalError> {
        Ok(i128::from_le_bytes(self.take(16)?.try_into().unwrap()))
    }

    pub fn read_varint(&mut self) -> Result<u64, CanonicalError> {
        let mut rest = &self.buf[self.pos..];
        let before = rest.len();
        let v = leb128::read::unsigned(&mut rest).map_err(|_| CanonicalError::VarintOverflow)?;
        self.pos += before - rest.len();
        Ok(v)
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], CanonicalError> {
        self.take(n)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CanonicalError> {
        let len = self.read_varint()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_bool(&mut self) -> Result<bool, CanonicalError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_seq<T: CanonicalDecode>(&mut self) -> Result<Vec<T>, CanonicalError> {
        let len = self.read_varint()? as usize;
        let mut out = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            out.push(T::decode(self)?);
        }
        Ok(out)
    }
}

impl CanonicalEncode for u64 {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_u64(*self);
    }
}

impl CanonicalEncode for u32 {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_u32(*self);
    }
}

impl CanonicalEncode for u16 {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_u16(*self);
    }
}

impl CanonicalEncode for U160 {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_raw(self);
    }
}

impl CanonicalDecode for U160 {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(dec.read_raw(20)?.try_into().unwrap())
    }
}

impl CanonicalEncode for U256 {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_raw(self);
    }
}

impl CanonicalEncode for Amount {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_i128(self.0);
    }
}

impl CanonicalDecode for Amount {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(Amount::from_raw(dec.read_i128()?))
    }
}

impl CanonicalEncode for AssetUnit {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_u16(self.0);
    }
}

impl CanonicalDecode for AssetUnit {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(AssetUnit(dec.read_u16()?))
    }
}

impl CanonicalEncode for Asset {
    fn encode(&self, enc: &mut Encoder) {
        self.amount.encode(enc);
        self.unit.encode(enc);
    }
}

impl CanonicalDecode for Asset {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(Asset { amount: Amount::decode(dec)?, unit: AssetUnit::decode(dec)? })
    }
}

impl CanonicalEncode for Price {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_u128(self.ratio);
        self.base_unit.encode(enc);
        self.quote_unit.encode(enc);
    }
}

impl CanonicalDecode for Price {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(Price {
            ratio: dec.read_u128()?,
            base_unit: AssetUnit::decode(dec)?,
            quote_unit: AssetUnit::decode(dec)?,
        })
    }
}

impl CanonicalEncode for Address {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_raw(&self.0);
    }
}

impl CanonicalDecode for Address {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(Address(dec.read_raw(20)?.try_into().unwrap()))
    }
}

impl CanonicalEncode for OutputReference {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_raw(&self.trx_hash);
        enc.write_u16(self.output_idx);
    }
}

impl CanonicalDecode for OutputReference {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        Ok(OutputReference { trx_hash: U160::decode(dec)?, output_idx: dec.read_u16()? })
    }
}

/// Hashes a value's canonical encoding with the given hash function,
/// producing a 160-bit id. Used for transaction ids and block ids.
pub fn hash160_of<T: CanonicalEncode>(value: &T, hash160: impl FnOnce(&[u8]) -> U160) -> U160 {
    let mut enc = Encoder::new();
    value.encode(&mut enc);
    hash160(enc.bytes())
}

/// Hashes a value's canonical encoding to a 256-bit digest. Used for
/// proposal digests.
pub fn sha256_of<T: CanonicalEncode>(value: &T, sha256: impl FnOnce(&[u8]) -> U256) -> U256 {
    let mut enc = Encoder::new();
    value.encode(&mut enc);
    sha256(enc.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        let mut enc = Encoder::new();
        enc.write_varint(300);
        enc.write_varint(0);
        enc.write_varint(u64::MAX);
        let mut dec = Decoder::new(enc.bytes());
        assert_eq!(dec.read_varint().unwrap(), 300);
        assert_eq!(dec.read_varint().unwrap(), 0);
        assert_eq!(dec.read_varint().unwrap(), u64::MAX);
    }

    #[test]
    fn address_encoding_roundtrips() {
        let addr = Address::from_bytes([9u8; 20]);
        let mut enc = Encoder::new();
        addr.encode(&mut enc);
        let mut dec = Decoder::new(enc.bytes());
        assert_eq!(Address::decode(&mut dec).unwrap(), addr);
    }

    #[test]
    fn sorted_set_encoding_is_order_independent() {
        let a = vec![3u64, 1, 2];
        let b = vec![1u64, 2, 3];
        let mut enc_a = Encoder::new();
        enc_a.write_sorted_set(&a);
        let mut enc_b = Encoder::new();
        enc_b.write_sorted_set(&b);
        assert_eq!(enc_a.into_bytes(), enc_b.into_bytes());
    }
}
