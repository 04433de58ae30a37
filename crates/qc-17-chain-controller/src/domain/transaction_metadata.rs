//! Transaction metadata and execution traces.

use crate::error::{ChainError, ChainResult};
use crate::ports::Authorization;
use sha2::{Digest as _, Sha256};
use shared_types::{
    short_id, Action, BlockId, BlockTimestamp, ChainId, Digest, DigestEncode, Microseconds, Name,
    PackedTransaction, PublicKey, TimePoint, TransactionId, TransactionReceiptHeader,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// How a transaction entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxType {
    /// Submitted by a user, or carried in a received block.
    Input,
    /// Generated by the controller itself, e.g. `onblock`.
    Implicit,
    /// Executed for its result only; never changes state or the block.
    ReadOnly,
    /// Fully checked and executed, then discarded.
    DryRun,
}

/// Digest the transaction signatures sign.
pub fn signing_digest(chain_id: &ChainId, trx: &PackedTransaction) -> Digest {
    let mut hasher = Sha256::new();
    chain_id.feed(&mut hasher);
    trx.transaction.feed(&mut hasher);
    if trx.context_free_data.is_empty() {
        [0u8; 32].feed(&mut hasher);
    } else {
        trx.context_free_data.digest().feed(&mut hasher);
    }
    hasher.finalize().into()
}

/// A packed transaction with its recovered keys and pipeline flags.
#[derive(Debug)]
pub struct TransactionMetadata {
    packed_trx: Arc<PackedTransaction>,
    id: TransactionId,
    recovered_keys: BTreeSet<PublicKey>,
    sig_cpu_usage: Microseconds,
    trx_type: TrxType,
    accepted: AtomicBool,
    billed_cpu_time_us: AtomicU32,
}

impl TransactionMetadata {
    pub fn create_no_recover_keys(packed_trx: Arc<PackedTransaction>, trx_type: TrxType) -> Self {
        let id = packed_trx.id();
        Self {
            packed_trx,
            id,
            recovered_keys: BTreeSet::new(),
            sig_cpu_usage: Microseconds(0),
            trx_type,
            accepted: AtomicBool::new(false),
            billed_cpu_time_us: AtomicU32::new(0),
        }
    }

    /// Recover signing keys. Time spent is remembered so it can be billed.
    pub fn recover_keys(
        packed_trx: Arc<PackedTransaction>,
        trx_type: TrxType,
        chain_id: &ChainId,
        authorization: &dyn Authorization,
    ) -> ChainResult<Self> {
        let start = TimePoint::now();
        let digest = signing_digest(chain_id, &packed_trx);
        let mut keys = BTreeSet::new();
        for signature in &packed_trx.signatures {
            let key = authorization.recover_key(signature, &digest)?;
            if !keys.insert(key) {
                return Err(ChainError::Transaction(format!(
                    "transaction {} includes more than one signature signed using the same key",
                    short_id(&packed_trx.id())
                )));
            }
        }
        let mut meta = Self::create_no_recover_keys(packed_trx, trx_type);
        meta.recovered_keys = keys;
        meta.sig_cpu_usage = TimePoint::now().since(start);
        Ok(meta)
    }

    pub fn packed_trx(&self) -> &Arc<PackedTransaction> {
        &self.packed_trx
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn recovered_keys(&self) -> &BTreeSet<PublicKey> {
        &self.recovered_keys
    }

    pub fn sig_cpu_usage(&self) -> Microseconds {
        self.sig_cpu_usage
    }

    pub fn trx_type(&self) -> TrxType {
        self.trx_type
    }

    pub fn implicit(&self) -> bool {
        self.trx_type == TrxType::Implicit
    }

    pub fn is_read_only(&self) -> bool {
        self.trx_type == TrxType::ReadOnly
    }

    pub fn is_dry_run(&self) -> bool {
        self.trx_type == TrxType::DryRun
    }

    /// Read-only and dry-run transactions leave no trace in state or block.
    pub fn is_transient(&self) -> bool {
        self.is_read_only() || self.is_dry_run()
    }

    /// Mark as accepted; true only the first time.
    pub fn mark_accepted(&self) -> bool {
        !self.accepted.swap(true, Ordering::AcqRel)
    }

    pub fn billed_cpu_time_us(&self) -> u32 {
        self.billed_cpu_time_us.load(Ordering::Acquire)
    }

    pub fn set_billed_cpu_time_us(&self, billed: u32) {
        self.billed_cpu_time_us.store(billed, Ordering::Release);
    }
}

/// Trace of one executed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTrace {
    pub action_ordinal: u32,
    pub receiver: Name,
    pub act: Action,
    pub context_free: bool,
    pub elapsed: Microseconds,
    pub console: String,
    pub return_value: Vec<u8>,
    pub receipt_digest: Option<Digest>,
}

/// Outcome of pushing a transaction, successful or not.
#[derive(Debug, Clone, Default)]
pub struct TransactionTrace {
    pub id: TransactionId,
    pub block_num: u32,
    pub block_time: BlockTimestamp,
    pub producer_block_id: Option<BlockId>,
    pub receipt: Option<TransactionReceiptHeader>,
    pub elapsed: Microseconds,
    pub net_usage: u64,
    pub scheduled: bool,
    pub action_traces: Vec<ActionTrace>,
    pub account_ram_delta: Option<(Name, i64)>,
    /// Captured failure; `None` on success.
    pub except: Option<ChainError>,
}

impl TransactionTrace {
    pub fn new(
        id: TransactionId,
        block_num: u32,
        block_time: BlockTimestamp,
        producer_block_id: Option<BlockId>,
    ) -> Self {
        Self {
            id,
            block_num,
            block_time,
            producer_block_id,
            ..Self::default()
        }
    }

    pub fn failed(&self) -> bool {
        self.except.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PermissiveAuthorization;
    use shared_types::Transaction;

    fn packed(signers: &[&[u8]], chain_id: &ChainId) -> Arc<PackedTransaction> {
        let mut trx = PackedTransaction::new(Transaction::default(), Vec::new());
        let digest = signing_digest(chain_id, &trx);
        trx.signatures = signers
            .iter()
            .map(|k| PermissiveAuthorization::sign(k, &digest))
            .collect();
        Arc::new(trx)
    }

    #[test]
    fn test_recover_keys_collects_signers() {
        let chain_id = [3u8; 32];
        let trx = packed(&[b"alice-key", b"bob-key"], &chain_id);
        let meta =
            TransactionMetadata::recover_keys(trx, TrxType::Input, &chain_id, &PermissiveAuthorization)
                .unwrap();
        assert_eq!(meta.recovered_keys().len(), 2);
        assert!(meta.recovered_keys().contains(&b"alice-key".to_vec()));
    }

    #[test]
    fn test_duplicate_signer_rejected() {
        let chain_id = [3u8; 32];
        let trx = packed(&[b"alice-key", b"alice-key"], &chain_id);
        let err =
            TransactionMetadata::recover_keys(trx, TrxType::Input, &chain_id, &PermissiveAuthorization)
                .unwrap_err();
        assert!(matches!(err, ChainError::Transaction(_)));
    }

    #[test]
    fn test_signature_for_other_chain_rejected() {
        let trx = packed(&[b"alice-key"], &[1u8; 32]);
        assert!(TransactionMetadata::recover_keys(
            trx,
            TrxType::Input,
            &[2u8; 32],
            &PermissiveAuthorization
        )
        .is_err());
    }

    #[test]
    fn test_accepted_only_once() {
        let meta = TransactionMetadata::create_no_recover_keys(
            Arc::new(PackedTransaction::default()),
            TrxType::Input,
        );
        assert!(meta.mark_accepted());
        assert!(!meta.mark_accepted());
        assert!(!meta.is_transient());
    }
}
