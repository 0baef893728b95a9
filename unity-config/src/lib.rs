//! Node-local configuration (§2.1, §6.3): everything an operator tunes
//! per-deployment, layered from a TOML file with `UNITY__`-prefixed
//! environment overrides exactly as `dxid-config::DxidConfig::load` did.
//!
//! Network-consensus constants (difficulty retarget window, unity
//! agreement thresholds, fee/margin parameters) are *not* here: those
//! live as compiled-in constants in `unity_core::params` because every
//! node must agree on them bit-for-bit, which a config file cannot
//! guarantee.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid address: {0}")]
    Address(#[from] unity_core::error::AddressError),
    #[error("UNL must name at least one signer")]
    EmptyUnl,
}

/// Where chain/fork/wallet state lives on disk (§6.3): `<data_dir>/chain`,
/// `<data_dir>/chain/forks`, `<data_dir>/wallet.bts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

/// This node's identity within the unity consensus round (§4.3): the
/// fixed UNL of authorized signer addresses, and, if this node is
/// itself a signer, the wallet account it should sign proposals with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub unique_node_list: Vec<String>,
    /// Name of a wallet entry to sign proposals with; omitted for a
    /// non-signing (observer) node.
    pub local_signer: Option<String>,
}

impl ConsensusConfig {
    pub fn unl_addresses(&self) -> Result<Vec<unity_core::primitives::Address>, ConfigError> {
        if self.unique_node_list.is_empty() {
            return Err(ConfigError::EmptyUnl);
        }
        self.unique_node_list
            .iter()
            .map(|s| s.parse().map_err(ConfigError::Address))
            .collect()
    }
}

/// Transport/gossip configuration (§4.4.1): libp2p listen multiaddr and
/// the seed peers dialed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_addr: String,
    pub seed_nodes: Vec<String>,
}

/// The REST API bind address (§6; no gRPC surface in this workspace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub listen_addr: String,
}

/// Parameters for the genesis block a fresh data directory is seeded
/// with on first start; ignored once `chain/` already has a tip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub timestamp: i64,
    pub initial_difficulty: u128,
    /// `(address, amount-in-whole-bts)` initial allocations.
    pub allocations: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnityConfig {
    pub storage: StorageConfig,
    pub consensus: ConsensusConfig,
    pub network: NetworkConfig,
    pub rpc: RpcConfig,
    pub genesis: GenesisConfig,
}

impl UnityConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("UNITY").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// A runnable single-node configuration, used by `unity-cli init`
    /// and by tests that need a config without a file on disk.
    pub fn example() -> Self {
        UnityConfig {
            storage: StorageConfig { data_dir: "./data".into() },
            consensus: ConsensusConfig { unique_node_list: vec![], local_signer: None },
            network: NetworkConfig {
                listen_addr: "/ip4/0.0.0.0/tcp/7300".into(),
                seed_nodes: vec![],
            },
            rpc: RpcConfig { listen_addr: "127.0.0.1:8645".into() },
            genesis: GenesisConfig {
                timestamp: 1_700_000_000,
                initial_difficulty: 1,
                allocations: vec![],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_round_trips_through_toml() {
        let cfg = UnityConfig::example();
        let toml_text = toml::to_string(&cfg).unwrap();
        let parsed: UnityConfig = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.storage.data_dir, cfg.storage.data_dir);
        assert_eq!(parsed.rpc.listen_addr, cfg.rpc.listen_addr);
    }

    #[test]
    fn empty_unl_is_rejected() {
        let consensus = ConsensusConfig { unique_node_list: vec![], local_signer: None };
        assert!(matches!(consensus.unl_addresses(), Err(ConfigError::EmptyUnl)));
    }
}
