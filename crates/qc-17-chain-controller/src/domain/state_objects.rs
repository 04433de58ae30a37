//! Rows the controller keeps in the versioned state store.

use crate::error::{ChainError, ChainResult};
use qc_04_versioned_state::StateObject;
use serde::{Deserialize, Serialize};
use shared_types::{
    BlockId, ChainId, Digest, Name, ProducerAuthoritySchedule, TimePoint, TimePointSec,
    TransactionId,
};
use std::collections::BTreeSet;

/// System account that owns `onblock` and the producer permissions.
pub const SYSTEM_ACCOUNT: &str = "sysio";
/// Account whose permissions track the active producer set.
pub const PRODUCERS_ACCOUNT: &str = "sysio.prods";
pub const ACTIVE_PERMISSION: &str = "active";
pub const MAJORITY_PERMISSION: &str = "prod.major";
pub const MINORITY_PERMISSION: &str = "prod.minor";

/// Host functions available from genesis.
pub const GENESIS_INTRINSICS: &[&str] = &[
    "action_data_size",
    "read_action_data",
    "current_receiver",
    "require_auth",
    "require_auth2",
    "has_auth",
    "require_recipient",
    "is_account",
    "send_inline",
    "send_context_free_inline",
    "current_time",
    "publication_time",
    "sha256",
    "assert_sha256",
    "db_store_i64",
    "db_update_i64",
    "db_remove_i64",
    "db_get_i64",
    "db_find_i64",
    "printi",
    "prints",
    "sysio_assert",
];

/// Key types supported before any key-type feature activates.
pub const GENESIS_KEY_TYPES: u8 = 2;

/// Fixed ram overhead billed per generated transaction row.
pub const GENERATED_TRANSACTION_OVERHEAD: i64 = 96;

/// Consensus parameters adjustable by the system contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParameters {
    pub max_block_net_usage: u64,
    pub target_block_net_usage_pct: u32,
    pub max_transaction_net_usage: u32,
    pub base_per_transaction_net_usage: u32,
    pub max_block_cpu_usage: u32,
    pub target_block_cpu_usage_pct: u32,
    pub max_transaction_cpu_usage: u32,
    pub min_transaction_cpu_usage: u32,
    pub max_transaction_lifetime: u32,
    pub max_inline_action_size: u32,
    pub max_authority_depth: u16,
}

impl Default for ChainParameters {
    fn default() -> Self {
        Self {
            max_block_net_usage: 1024 * 1024,
            target_block_net_usage_pct: 1000,
            max_transaction_net_usage: 512 * 1024,
            base_per_transaction_net_usage: 12,
            max_block_cpu_usage: 200_000,
            target_block_cpu_usage_pct: 1000,
            max_transaction_cpu_usage: 150_000,
            min_transaction_cpu_usage: 100,
            max_transaction_lifetime: 60 * 60,
            max_inline_action_size: 512 * 1024,
            max_authority_depth: 6,
        }
    }
}

impl ChainParameters {
    pub fn validate(&self) -> ChainResult<()> {
        if self.target_block_net_usage_pct > 10_000 || self.target_block_cpu_usage_pct > 10_000 {
            return Err(ChainError::InvalidConfig(
                "target block usage percentage cannot exceed 100%".into(),
            ));
        }
        if u64::from(self.max_transaction_net_usage) >= self.max_block_net_usage {
            return Err(ChainError::InvalidConfig(
                "max transaction net usage must be less than max block net usage".into(),
            ));
        }
        if self.max_transaction_cpu_usage >= self.max_block_cpu_usage {
            return Err(ChainError::InvalidConfig(
                "max transaction cpu usage must be less than max block cpu usage".into(),
            ));
        }
        if self.min_transaction_cpu_usage > self.max_transaction_cpu_usage {
            return Err(ChainError::InvalidConfig(
                "min transaction cpu usage cannot exceed max transaction cpu usage".into(),
            ));
        }
        Ok(())
    }
}

/// Singleton row: chain id, parameters and the proposed producer schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPropertyObject {
    /// Block in which the schedule was proposed, if any.
    pub proposed_schedule_block_num: Option<u32>,
    pub proposed_schedule: ProducerAuthoritySchedule,
    pub configuration: ChainParameters,
    pub chain_id: ChainId,
}

impl StateObject for GlobalPropertyObject {
    const TABLE: &'static str = "global_property";

    fn primary_key(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// A protocol feature and the block it activated in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatedProtocolFeature {
    pub feature_digest: Digest,
    pub activation_block_num: u32,
}

/// Singleton row with protocol feature bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProtocolStateObject {
    pub activated_protocol_features: Vec<ActivatedProtocolFeature>,
    pub preactivated_protocol_features: Vec<Digest>,
    pub whitelisted_intrinsics: BTreeSet<String>,
    pub num_supported_key_types: u8,
}

impl ProtocolStateObject {
    pub fn genesis() -> Self {
        Self {
            activated_protocol_features: Vec::new(),
            preactivated_protocol_features: Vec::new(),
            whitelisted_intrinsics: GENESIS_INTRINSICS.iter().map(|s| s.to_string()).collect(),
            num_supported_key_types: GENESIS_KEY_TYPES,
        }
    }
}

impl StateObject for ProtocolStateObject {
    const TABLE: &'static str = "protocol_state";

    fn primary_key(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Ring of recent block ids used for TaPoS, keyed by the low 16 bits of the
/// block number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummaryObject {
    pub slot: u16,
    pub block_id: BlockId,
}

impl BlockSummaryObject {
    pub fn key_for(ref_block_num: u16) -> Vec<u8> {
        ref_block_num.to_be_bytes().to_vec()
    }
}

impl StateObject for BlockSummaryObject {
    const TABLE: &'static str = "block_summary";

    fn primary_key(&self) -> Vec<u8> {
        Self::key_for(self.slot)
    }
}

/// Dedup entry for an unexpired input transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionObject {
    pub trx_id: TransactionId,
    pub expiration: TimePointSec,
}

impl StateObject for TransactionObject {
    const TABLE: &'static str = "transaction";

    fn primary_key(&self) -> Vec<u8> {
        self.trx_id.to_vec()
    }
}

/// Secondary index of [`TransactionObject`] ordered by expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionExpiryEntry {
    pub expiration: TimePointSec,
    pub trx_id: TransactionId,
}

impl TransactionExpiryEntry {
    pub fn key_for(expiration: TimePointSec, trx_id: &TransactionId) -> Vec<u8> {
        let mut key = expiration.secs().to_be_bytes().to_vec();
        key.extend_from_slice(trx_id);
        key
    }
}

impl StateObject for TransactionExpiryEntry {
    const TABLE: &'static str = "transaction_by_expiration";

    fn primary_key(&self) -> Vec<u8> {
        Self::key_for(self.expiration, &self.trx_id)
    }
}

/// A scheduled transaction left over from deferred execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTransactionObject {
    pub trx_id: TransactionId,
    pub sender: Name,
    pub sender_id: u128,
    /// Account billed for the row's ram.
    pub payer: Name,
    pub delay_until: TimePoint,
    pub expiration: TimePoint,
    pub published: TimePoint,
    pub packed_trx: Vec<u8>,
}

impl GeneratedTransactionObject {
    pub fn billable_size(&self) -> i64 {
        self.packed_trx.len() as i64 + GENERATED_TRANSACTION_OVERHEAD
    }
}

impl StateObject for GeneratedTransactionObject {
    const TABLE: &'static str = "generated_transaction";

    fn primary_key(&self) -> Vec<u8> {
        self.trx_id.to_vec()
    }
}

/// Threshold-based permission of the producers account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerPermissionObject {
    pub permission: Name,
    pub threshold: u32,
    pub accounts: Vec<Name>,
}

impl ProducerPermissionObject {
    /// Threshold over `n` producers for each producers-account permission.
    pub fn threshold_for(permission: &str, n: u32) -> u32 {
        match permission {
            MAJORITY_PERMISSION => n / 2 + 1,
            MINORITY_PERMISSION => n / 3 + 1,
            _ => n * 2 / 3 + 1,
        }
    }

    pub fn for_schedule(permission: &str, schedule: &ProducerAuthoritySchedule) -> Self {
        let accounts: Vec<Name> = schedule
            .producers
            .iter()
            .map(|p| p.producer_name.clone())
            .collect();
        Self {
            permission: Name::from(permission),
            threshold: Self::threshold_for(permission, accounts.len() as u32),
            accounts,
        }
    }
}

impl StateObject for ProducerPermissionObject {
    const TABLE: &'static str = "producers_permission";

    fn primary_key(&self) -> Vec<u8> {
        self.permission.as_str().as_bytes().to_vec()
    }
}

/// Ram owed back to an account after an accounting bug fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRamCorrectionObject {
    pub name: Name,
    pub ram_correction: u64,
}

impl StateObject for AccountRamCorrectionObject {
    const TABLE: &'static str = "account_ram_correction";

    fn primary_key(&self) -> Vec<u8> {
        self.name.as_str().as_bytes().to_vec()
    }
}

/// Tables exported into and imported from snapshots, in section order.
pub const SNAPSHOT_TABLES: &[&str] = &[
    GlobalPropertyObject::TABLE,
    ProtocolStateObject::TABLE,
    BlockSummaryObject::TABLE,
    TransactionObject::TABLE,
    TransactionExpiryEntry::TABLE,
    GeneratedTransactionObject::TABLE,
    ProducerPermissionObject::TABLE,
    AccountRamCorrectionObject::TABLE,
];
