//! Network-consensus constants. Every one of these must match across all
//! nodes for blocks and proposals to be mutually verifiable; none of them
//! are meant to be operator-configurable.

/// Collateral must be at least this multiple of the notional debt when a
/// short position is opened.
pub const INITIAL_MARGIN_REQUIREMENT: u64 = 2;

/// Upper bound on the serialized size (bytes) of the transaction list of a
/// single block. `generate_next_block` stops appending candidates once this
/// is exceeded.
pub const MAX_BLOCK_TRXS_SIZE: usize = 2 * 1024 * 1024;

/// Width of the median-difficulty smoothing window used by the fork
/// database's `current_pow_difficulty`.
pub const BITNAME_TIMEKEEPER_WINDOW: usize = 30;

/// Target spacing, in seconds, between blocks.
pub const BLOCK_INTERVAL_SEC: i64 = 300;

/// Number of blocks between difficulty retargets.
pub const RETARGET_WINDOW: u32 = 144;

/// A block's timestamp must exceed its parent's by more than this.
pub const MIN_BLOCK_INTERVAL_SEC: i64 = 30;

/// A block's timestamp must not exceed "now" by more than this.
pub const MAX_FUTURE_DRIFT_SEC: i64 = 60;

/// How long the fork database will wait for an outstanding block/header
/// fetch before redispatching it to a different peer.
pub const BITNAME_BLOCK_FETCH_TIMEOUT_SEC: u64 = 30;

/// Fixed backoff between outbound peer reconnect attempts.
pub const PEER_RECONNECT_BACKOFF_SEC: u64 = 30;

/// Number of decimal places every `Amount` is rounded to.
pub const AMOUNT_DECIMALS: u32 = 8;

/// `10 ^ AMOUNT_DECIMALS`, the scale factor between an `Amount`'s raw i128
/// and its display value.
pub const AMOUNT_SCALE: i128 = 100_000_000;

/// Unity BFT thresholds, expressed as the spec does: a fraction of total
/// trusted weight. `prev_proposal_votes` must clear 60%, an individual
/// item must clear 75% of the max weight seen this round, and
/// `next_proposal_votes` must clear 60% before a round is considered safe
/// to advance.
pub const UNITY_PREV_MAJORITY_PCT: u64 = 60;
pub const UNITY_ITEM_THRESHOLD_PCT: u64 = 75;
pub const UNITY_NEXT_MAJORITY_PCT: u64 = 60;

/// Market-depth gate (§4.1.3 step 5): matching against `bts` is skipped
/// while the resting depth for the quote unit is below `total_shares / this`.
pub const MARKET_DEPTH_GATE_DIVISOR: i128 = 100;
