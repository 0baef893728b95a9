//! Error taxonomy for the core data model and ledger engine.
//!
//! These map onto the "Input-validation", "Double-spend / state" and
//! "Chain invariant" categories of the error-handling design: all of them
//! are surfaced to the caller as `Result`s, never panics, so that a bad
//! transaction or a bad block from a peer can be rejected without taking
//! the node down.

use thiserror::Error;

use crate::primitives::AssetUnit;

#[derive(Debug, Error)]
pub enum AmountError {
    #[error("amount overflow")]
    Overflow,
    #[error("amount underflow")]
    Underflow,
    #[error("division by zero")]
    DivByZero,
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("unit mismatch: expected {expected:?}, found {found:?}")]
    UnitMismatch { expected: AssetUnit, found: AssetUnit },
    #[error(transparent)]
    Amount(#[from] AmountError),
}

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("price quote_unit ({quote:?}) must be greater than base_unit ({base:?})")]
    UnitOrder { base: AssetUnit, quote: AssetUnit },
    #[error("price ratio must be nonzero")]
    ZeroRatio,
    #[error(transparent)]
    Amount(#[from] AmountError),
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("base58 decode error: {0}")]
    Base58(String),
    #[error("address must decode to 20 bytes, found {0}")]
    BadLength(usize),
}

/// Errors surfaced by `evaluate`/`push_block`/`match_orders`. Variant names
/// are chosen to match the categories in the error-handling design so a
/// caller can bucket them for peer-penalty or submitter-facing purposes.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("signature missing for claim owner")]
    MissingSignature,
    #[error("referenced output {0:?} is unknown")]
    UnknownOutput(crate::primitives::OutputReference),
    #[error("referenced output {0:?} is already spent")]
    AlreadySpent(crate::primitives::OutputReference),
    #[error("claim predicate rejected the spend")]
    ClaimRejected,
    #[error("per-unit balance unbalanced for {0:?}: inputs {1} outputs+fee {2}")]
    Unbalanced(AssetUnit, i128, i128),
    #[error("fee {paid} below required minimum {required}")]
    FeeTooLow { paid: i128, required: i128 },
    #[error("stake {0:x?} does not match any recent block id")]
    BadStake(u64),
    #[error("transaction timestamp outside its valid window")]
    TimeWindow,
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Amount(#[from] AmountError),
}

/// Chain-invariant violations (§3.3). A block that fails any of these is
/// never re-fetched: its id is marked invalid in the fork database.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block_num {found} does not follow parent's {expected}")]
    BadHeight { expected: u64, found: u64 },
    #[error("timestamp {ts} does not satisfy the min-spacing/future-drift window")]
    BadTimestamp { ts: i64 },
    #[error("trx_merkle_root mismatch")]
    BadMerkleRoot,
    #[error("proof of work {found:x} below required difficulty {required:x}")]
    InsufficientWork { found: u128, required: u128 },
    #[error("market-match prefix of block does not match the deterministic output")]
    BadMarketPrefix,
    #[error("money conservation violated for unit {0:?}")]
    UnbalancedUnit(AssetUnit),
    #[error("next_fee field does not match the expected retarget formula")]
    BadNextFee,
    #[error(transparent)]
    Eval(#[from] EvalError),
}

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("unexpected end of buffer while decoding")]
    Eof,
    #[error("varint too large")]
    VarintOverflow,
    #[error("invalid tag byte {0}")]
    BadTag(u8),
}
