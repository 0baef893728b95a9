//! The output claim taxonomy. The original design dispatched on a
//! runtime `claim_func` tag over an opaque byte buffer; here the claim is
//! a closed, exhaustively-matched enum so every caller that wants to
//! branch on claim kind gets a compiler-checked match instead of a
//! fallible downcast.

use serde::{Deserialize, Serialize};

use crate::canonical::{CanonicalDecode, CanonicalEncode, Decoder, Encoder};
use crate::error::CanonicalError;
use crate::primitives::{Address, Asset, Price, PtsAddress};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Claim {
    /// Spendable by a signature from `owner`.
    BySignature { owner: Address },
    /// Legacy address form; spendable once mapped to a signature address.
    ByPts { owner: PtsAddress },
    /// A resting order offering the output's asset at `ask_price`.
    ByBid { pay_address: Address, ask_price: Price },
    /// A resting short-sell offer: pays `bts` collateral, offers to owe a
    /// bit-asset at `ask_price`.
    ByLong { pay_address: Address, ask_price: Price },
    /// A margin position: `owner` owes `payoff`, secured by the output's
    /// `bts` collateral.
    ByCover { payoff: Asset, owner: Address },
}

impl Claim {
    pub fn kind(&self) -> ClaimKind {
        match self {
            Claim::BySignature { .. } => ClaimKind::BySignature,
            Claim::ByPts { .. } => ClaimKind::ByPts,
            Claim::ByBid { .. } => ClaimKind::ByBid,
            Claim::ByLong { .. } => ClaimKind::ByLong,
            Claim::ByCover { .. } => ClaimKind::ByCover,
        }
    }

    /// True for claim kinds that only the deterministic market engine is
    /// permitted to consume (§4.1.2): user-submitted transactions may
    /// never spend these directly.
    pub fn requires_market_context(&self) -> bool {
        matches!(self, Claim::ByBid { .. } | Claim::ByLong { .. })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[repr(u8)]
pub enum ClaimKind {
    BySignature = 0,
    ByPts = 1,
    ByBid = 2,
    ByLong = 3,
    ByCover = 4,
}

impl CanonicalEncode for Claim {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_u8(self.kind() as u8);
        match self {
            Claim::BySignature { owner } => owner.encode(enc),
            Claim::ByPts { owner } => enc.write_raw(&owner.0),
            Claim::ByBid { pay_address, ask_price } => {
                pay_address.encode(enc);
                ask_price.encode(enc);
            }
            Claim::ByLong { pay_address, ask_price } => {
                pay_address.encode(enc);
                ask_price.encode(enc);
            }
            Claim::ByCover { payoff, owner } => {
                payoff.encode(enc);
                owner.encode(enc);
            }
        }
    }
}

impl CanonicalDecode for Claim {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CanonicalError> {
        use crate::primitives::U160;
        Ok(match dec.read_u8()? {
            0 => Claim::BySignature { owner: Address::decode(dec)? },
            1 => Claim::ByPts { owner: PtsAddress(U160::decode(dec)?) },
            2 => Claim::ByBid { pay_address: Address::decode(dec)?, ask_price: Price::decode(dec)? },
            3 => Claim::ByLong { pay_address: Address::decode(dec)?, ask_price: Price::decode(dec)? },
            4 => Claim::ByCover { payoff: Asset::decode(dec)?, owner: Address::decode(dec)? },
            other => return Err(CanonicalError::BadTag(other)),
        })
    }
}
