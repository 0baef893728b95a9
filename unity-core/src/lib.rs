//! Core data model and state-transition logic for the unity network:
//! primitive value types (§3.1), transactions and outputs (§3.2), blocks
//! (§3.3), the ledger/market engine (§4.1) and the deterministic binary
//! encoding every hash goes through (§6.4).
//!
//! This crate owns no I/O, no persistence and no cryptographic
//! primitives of its own: everything that needs to hash or sign takes a
//! `CryptoProvider` (implemented by `unity-crypto`), and everything that
//! needs to persist state is handed a snapshot to checkpoint (owned by
//! `unity-storage`/`unity-forkdb`). That keeps the hard-to-get-right
//! money and matching logic testable without a disk or a network.

pub mod block;
pub mod canonical;
pub mod claim;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod market;
pub mod params;
pub mod primitives;
pub mod transaction;

pub use block::{genesis_block, merkle_root, proof_of_work_value, BlockHeader, TrxBlock};
pub use claim::{Claim, ClaimKind};
pub use crypto::{CompactSignature, CryptoError, CryptoProvider};
pub use error::{AddressError, AmountError, AssetError, BlockError, CanonicalError, EvalError, PriceError};
pub use ledger::{DepthStats, Eval, LedgerState, MetaTrx, TrxNum};
pub use market::{BidKey, CallKey};
pub use primitives::{
    Address, Amount, Asset, AssetUnit, OutputIndex, OutputReference, Price, PtsAddress, U160, U256,
};
pub use transaction::{SignedTransaction, Transaction, TrxInput, TrxOutput};
