//! Configuration types for the chain controller

use crate::domain::ChainParameters;
use crate::error::{ChainError, ChainResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use shared_types::{BlockTimestamp, ChainId, Name, PublicKey};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Which view of the chain reads observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Reads see the head block, pending changes are discarded.
    #[default]
    Head,
    /// Reads see the pending block including speculative transactions.
    Speculative,
    /// Reads see only irreversible state; reversible blocks are not applied.
    Irreversible,
}

/// How much received blocks are re-checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    #[default]
    Full,
    /// Trust producer signatures and skip authorization checks.
    Light,
}

/// Runtime configuration for the controller
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Senders whose actions bypass the lists below.
    pub sender_bypass_whiteblacklist: BTreeSet<Name>,
    pub actor_whitelist: BTreeSet<Name>,
    pub actor_blacklist: BTreeSet<Name>,
    pub contract_whitelist: BTreeSet<Name>,
    pub contract_blacklist: BTreeSet<Name>,
    /// (contract, action) pairs.
    pub action_blacklist: BTreeSet<(Name, Name)>,
    pub key_blacklist: BTreeSet<PublicKey>,

    /// Directory of the block log and block state log. In-memory logs when unset.
    pub blocks_dir: Option<PathBuf>,
    /// Directory the fork database is persisted to on shutdown.
    pub state_dir: Option<PathBuf>,
    /// Maximum state size in bytes (0 = unbounded).
    pub state_size: u64,
    /// Free space below which new blocks are refused.
    pub state_guard_size: u64,
    /// Keep a log of irreversible block header states next to the block log.
    pub keep_state_log: bool,

    /// Percentage of signature recovery time billed to the transaction.
    pub sig_cpu_bill_pct: u32,
    /// Worker threads for merkle computation, serialization and key recovery.
    pub chain_thread_pool_size: u16,
    pub max_nonprivileged_inline_action_size: u32,
    /// Longest signature accepted while producing.
    pub maximum_variable_signature_length: usize,

    pub read_only: bool,
    /// Re-validate everything when replaying validated blocks.
    pub force_all_checks: bool,
    /// Keep undo sessions during irreversible replay.
    pub disable_replay_opts: bool,
    pub contracts_console: bool,
    pub disable_all_subjective_mitigations: bool,
    pub allow_ram_billing_in_notify: bool,

    /// Stop after this block number (0 = never).
    pub terminate_at_block: u32,
    /// Extra cpu time granted before subjective deadlines fire.
    pub subjective_cpu_leeway_us: Option<i64>,

    pub read_mode: ReadMode,
    pub block_validation_mode: ValidationMode,
    /// Producers whose blocks are light-validated.
    pub trusted_producers: BTreeSet<Name>,

    /// Per-transaction wall-clock budget.
    pub max_transaction_time_ms: i64,
    /// Furthest allowed expiration of input transactions.
    pub max_transaction_lifetime_secs: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sender_bypass_whiteblacklist: BTreeSet::new(),
            actor_whitelist: BTreeSet::new(),
            actor_blacklist: BTreeSet::new(),
            contract_whitelist: BTreeSet::new(),
            contract_blacklist: BTreeSet::new(),
            action_blacklist: BTreeSet::new(),
            key_blacklist: BTreeSet::new(),
            blocks_dir: None,
            state_dir: None,
            state_size: crate::DEFAULT_STATE_SIZE,
            state_guard_size: crate::DEFAULT_STATE_GUARD_SIZE,
            keep_state_log: false,
            sig_cpu_bill_pct: crate::DEFAULT_SIG_CPU_BILL_PCT,
            chain_thread_pool_size: crate::DEFAULT_CHAIN_THREAD_POOL_SIZE,
            max_nonprivileged_inline_action_size: 4096,
            maximum_variable_signature_length: 16 * 1024,
            read_only: false,
            force_all_checks: false,
            disable_replay_opts: false,
            contracts_console: false,
            disable_all_subjective_mitigations: false,
            allow_ram_billing_in_notify: false,
            terminate_at_block: 0,
            subjective_cpu_leeway_us: None,
            read_mode: ReadMode::Head,
            block_validation_mode: ValidationMode::Full,
            trusted_producers: BTreeSet::new(),
            max_transaction_time_ms: 30,
            max_transaction_lifetime_secs: 60 * 60,
        }
    }
}

impl ControllerConfig {
    /// Parse from JSON; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> ChainResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ChainError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.chain_thread_pool_size == 0 {
            return Err(ChainError::InvalidConfig(
                "chain_thread_pool_size must be greater than 0".into(),
            ));
        }
        if self.sig_cpu_bill_pct > 100 {
            return Err(ChainError::InvalidConfig(format!(
                "sig_cpu_bill_pct must be at most 100, got {}",
                self.sig_cpu_bill_pct
            )));
        }
        if self.state_size > 0 && self.state_guard_size >= self.state_size {
            return Err(ChainError::InvalidConfig(
                "state_guard_size must be smaller than state_size".into(),
            ));
        }
        if self.max_transaction_time_ms <= 0 {
            return Err(ChainError::InvalidConfig(
                "max_transaction_time_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Initial chain state. Its digest is the chain id.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct GenesisState {
    pub initial_timestamp: BlockTimestamp,
    /// Signing key of the initial single-producer schedule.
    pub initial_key: PublicKey,
    pub initial_configuration: ChainParameters,
}

impl GenesisState {
    pub fn new(initial_timestamp: BlockTimestamp, initial_key: PublicKey) -> Self {
        Self {
            initial_timestamp,
            initial_key,
            initial_configuration: ChainParameters::default(),
        }
    }

    pub fn compute_chain_id(&self) -> ChainResult<ChainId> {
        let encoded = bincode::serialize(self)?;
        Ok(Sha256::digest(&encoded).into())
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.initial_key.is_empty() {
            return Err(ChainError::InvalidConfig("genesis initial key is empty".into()));
        }
        self.initial_configuration.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = ControllerConfig::from_json_str(
            r#"{ "read_mode": "irreversible", "trusted_producers": ["alice"] }"#,
        )
        .unwrap();
        assert_eq!(config.read_mode, ReadMode::Irreversible);
        assert!(config.trusted_producers.contains(&Name::from("alice")));
        assert_eq!(config.sig_cpu_bill_pct, crate::DEFAULT_SIG_CPU_BILL_PCT);
    }

    #[test]
    fn test_zero_thread_pool_rejected() {
        let config = ControllerConfig {
            chain_thread_pool_size: 0,
            ..ControllerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChainError::InvalidConfig(_))));
    }

    #[test]
    fn test_chain_id_depends_on_genesis() {
        let a = GenesisState::new(BlockTimestamp::from_slot(10), b"key-a".to_vec());
        let b = GenesisState::new(BlockTimestamp::from_slot(10), b"key-b".to_vec());
        assert_ne!(a.compute_chain_id().unwrap(), b.compute_chain_id().unwrap());
        assert_eq!(a.compute_chain_id().unwrap(), a.clone().compute_chain_id().unwrap());
    }
}
