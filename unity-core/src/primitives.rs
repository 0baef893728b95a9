//! Primitive value types shared by every other module: fixed-point
//! amounts, asset units, prices, addresses and output references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AddressError, AmountError, AssetError, PriceError};
use crate::params::AMOUNT_SCALE;

/// 160-bit hash used for transaction ids, block ids and addresses.
pub type U160 = [u8; 20];

/// 256-bit hash, used where a wider digest is needed (proposal digests,
/// PoW target comparisons).
pub type U256 = [u8; 32];

/// A quantity of a single asset unit, stored as a 128-bit fixed-point
/// integer scaled by `10^AMOUNT_DECIMALS`. All arithmetic is checked;
/// overflow/underflow never silently wraps.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
pub struct Amount(pub i128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_raw(raw: i128) -> Amount {
        Amount(raw)
    }

    pub fn raw(self) -> i128 {
        self.0
    }

    /// Builds an `Amount` from a whole-unit integer quantity (e.g. `5` bts).
    pub fn from_units(units: i64) -> Amount {
        Amount(units as i128 * AMOUNT_SCALE)
    }

    pub fn checked_add(self, rhs: Amount) -> Result<Amount, AmountError> {
        self.0.checked_add(rhs.0).map(Amount).ok_or(AmountError::Overflow)
    }

    pub fn checked_sub(self, rhs: Amount) -> Result<Amount, AmountError> {
        self.0.checked_sub(rhs.0).map(Amount).ok_or(AmountError::Underflow)
    }

    /// Multiplies by a fixed-point ratio scaled by `AMOUNT_SCALE`, rounding
    /// toward zero per §4.1.3's rounding rule.
    pub fn checked_mul_ratio(self, ratio: u128) -> Result<Amount, AmountError> {
        let product = self.0.checked_mul(ratio as i128).ok_or(AmountError::Overflow)?;
        Ok(Amount(product / AMOUNT_SCALE))
    }

    pub fn checked_div_ratio(self, ratio: u128) -> Result<Amount, AmountError> {
        if ratio == 0 {
            return Err(AmountError::DivByZero);
        }
        let scaled = self.0.checked_mul(AMOUNT_SCALE).ok_or(AmountError::Overflow)?;
        Ok(Amount(scaled / ratio as i128))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let mag = self.0.unsigned_abs();
        let whole = mag / AMOUNT_SCALE as u128;
        let frac = mag % AMOUNT_SCALE as u128;
        write!(f, "{sign}{whole}.{frac:08}")
    }
}

/// Enumerated asset-unit tag. `BTS` is the base/collateral unit; every
/// other unit is a bit-asset priced against it. Extensible beyond the
/// well-known symbols below via the raw `u16` constructor.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct AssetUnit(pub u16);

impl AssetUnit {
    pub const BTS: AssetUnit = AssetUnit(0);
    pub const USD: AssetUnit = AssetUnit(1);
    pub const CNY: AssetUnit = AssetUnit(2);
    pub const EUR: AssetUnit = AssetUnit(3);
    pub const GLD: AssetUnit = AssetUnit(4);
    /// Sentinel marking one-past the last statically known unit.
    pub const COUNT: AssetUnit = AssetUnit(5);

    pub fn is_base(self) -> bool {
        self == Self::BTS
    }

    fn known_symbol(self) -> Option<&'static str> {
        match self {
            Self::BTS => Some("bts"),
            Self::USD => Some("usd"),
            Self::CNY => Some("cny"),
            Self::EUR => Some("eur"),
            Self::GLD => Some("gld"),
            _ => None,
        }
    }
}

impl fmt::Debug for AssetUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for AssetUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known_symbol() {
            Some(sym) => f.write_str(sym),
            None => write!(f, "unit#{}", self.0),
        }
    }
}

impl FromStr for AssetUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bts" => Ok(Self::BTS),
            "usd" => Ok(Self::USD),
            "cny" => Ok(Self::CNY),
            "eur" => Ok(Self::EUR),
            "gld" => Ok(Self::GLD),
            other => other
                .strip_prefix("unit#")
                .and_then(|n| n.parse::<u16>().ok())
                .map(AssetUnit)
                .ok_or_else(|| format!("unknown asset unit {other}")),
        }
    }
}

/// A typed quantity: an `Amount` tagged with the unit it's denominated in.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Asset {
    pub amount: Amount,
    pub unit: AssetUnit,
}

impl Asset {
    pub fn new(amount: Amount, unit: AssetUnit) -> Asset {
        Asset { amount, unit }
    }

    pub fn zero(unit: AssetUnit) -> Asset {
        Asset { amount: Amount::ZERO, unit }
    }

    pub fn checked_add(self, rhs: Asset) -> Result<Asset, AssetError> {
        self.require_same_unit(rhs)?;
        Ok(Asset::new(self.amount.checked_add(rhs.amount)?, self.unit))
    }

    pub fn checked_sub(self, rhs: Asset) -> Result<Asset, AssetError> {
        self.require_same_unit(rhs)?;
        Ok(Asset::new(self.amount.checked_sub(rhs.amount)?, self.unit))
    }

    fn require_same_unit(self, rhs: Asset) -> Result<(), AssetError> {
        if self.unit != rhs.unit {
            return Err(AssetError::UnitMismatch { expected: self.unit, found: rhs.unit });
        }
        Ok(())
    }
}

/// A quote-per-base price. Markets are keyed `(quote_unit, base_unit)` with
/// `quote_unit > base_unit`; `ratio` is a fixed-point scale of `AMOUNT_SCALE`
/// quote-units per one base-unit.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Price {
    pub ratio: u128,
    pub base_unit: AssetUnit,
    pub quote_unit: AssetUnit,
}

impl Price {
    pub fn new(ratio: u128, base_unit: AssetUnit, quote_unit: AssetUnit) -> Result<Price, PriceError> {
        if quote_unit <= base_unit {
            return Err(PriceError::UnitOrder { base: base_unit, quote: quote_unit });
        }
        if ratio == 0 {
            return Err(PriceError::ZeroRatio);
        }
        Ok(Price { ratio, base_unit, quote_unit })
    }

    /// Converts a quantity of `base_unit` into the equivalent `quote_unit` asset.
    pub fn convert_base_to_quote(&self, base: Asset) -> Result<Asset, PriceError> {
        if base.unit != self.base_unit {
            return Err(AssetError::UnitMismatch { expected: self.base_unit, found: base.unit }.into());
        }
        Ok(Asset::new(base.amount.checked_mul_ratio(self.ratio)?, self.quote_unit))
    }

    /// Converts a quantity of `quote_unit` into the equivalent `base_unit` asset.
    pub fn convert_quote_to_base(&self, quote: Asset) -> Result<Asset, PriceError> {
        if quote.unit != self.quote_unit {
            return Err(AssetError::UnitMismatch { expected: self.quote_unit, found: quote.unit }.into());
        }
        Ok(Asset::new(quote.amount.checked_div_ratio(self.ratio)?, self.base_unit))
    }
}

impl From<AssetError> for PriceError {
    fn from(e: AssetError) -> Self {
        match e {
            AssetError::Amount(a) => PriceError::Amount(a),
            AssetError::UnitMismatch { expected, found } => {
                PriceError::UnitOrder { base: expected, quote: found }
            }
        }
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ratio.cmp(&other.ratio)
    }
}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A RIPEMD-160-derived account identifier: 16 bytes of hash plus a 4-byte
/// checksum, rendered as base58. Construction from a public key and
/// checksum validation both live in `unity-crypto`, which owns the hash
/// primitives; this type only owns storage, encoding and ordering.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
pub struct Address(pub U160);

impl Address {
    pub fn from_bytes(bytes: U160) -> Address {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &U160 {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| AddressError::Base58(e.to_string()))?;
        if bytes.len() != 20 {
            return Err(AddressError::BadLength(bytes.len()));
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Address(arr))
    }
}

/// A legacy address form, carried opaquely for `ClaimByPts` outputs: the
/// core ledger never interprets its bytes, only stores them for the
/// pts-to-address mapping maintained elsewhere.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize)]
pub struct PtsAddress(pub U160);

/// Names one output of one past transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OutputReference {
    pub trx_hash: U160,
    pub output_idx: u16,
}

impl fmt::Debug for OutputReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", bs58::encode(self.trx_hash).into_string(), self.output_idx)
    }
}

/// Canonical ordering key for wallet-scan: where in the chain an output
/// was created.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct OutputIndex {
    pub block: u32,
    pub trx: u16,
    pub out: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_display_rounds_to_eight_decimals() {
        let a = Amount::from_units(5);
        assert_eq!(a.to_string(), "5.00000000");
        let neg = Amount::from_raw(-150_000_000);
        assert_eq!(neg.to_string(), "-1.50000000");
    }

    #[test]
    fn amount_checked_arithmetic_detects_overflow() {
        let max = Amount::from_raw(i128::MAX);
        assert!(max.checked_add(Amount::from_raw(1)).is_err());
    }

    #[test]
    fn price_requires_quote_greater_than_base() {
        assert!(Price::new(1, AssetUnit::USD, AssetUnit::BTS).is_err());
        assert!(Price::new(1, AssetUnit::BTS, AssetUnit::USD).is_ok());
    }

    #[test]
    fn price_converts_base_to_quote_and_back() {
        // 1 bts == 2 usd
        let price = Price::new(2 * AMOUNT_SCALE as u128, AssetUnit::BTS, AssetUnit::USD).unwrap();
        let base = Asset::new(Amount::from_units(10), AssetUnit::BTS);
        let quote = price.convert_base_to_quote(base).unwrap();
        assert_eq!(quote.amount, Amount::from_units(20));
        let back = price.convert_quote_to_base(quote).unwrap();
        assert_eq!(back.amount, Amount::from_units(10));
    }

    #[test]
    fn address_base58_roundtrip() {
        let addr = Address::from_bytes([7u8; 20]);
        let s = addr.to_string();
        let parsed: Address = s.parse().unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn asset_unit_parses_known_symbols() {
        assert_eq!("usd".parse::<AssetUnit>().unwrap(), AssetUnit::USD);
        assert_eq!("bts".parse::<AssetUnit>().unwrap(), AssetUnit::BTS);
    }
}
