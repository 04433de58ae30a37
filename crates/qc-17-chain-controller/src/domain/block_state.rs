//! # Block Header State
//!
//! Consensus bookkeeping carried from block to block: producer schedules,
//! confirmation counts and the two irreversibility markers.
//!
//! ```text
//!   BlockHeaderState ──next(when, confirmed)──► PendingBlockHeaderState
//!          ▲                                            │
//!          └──────────── finish_next(header) ───────────┘
//! ```
//!
//! `dpos_proposed_irreversible_blocknum` is the newest block confirmed by
//! two thirds of the active producers. `dpos_irreversible_blocknum` is the
//! (n-1)/3-th smallest proposal implied by each producer's last block, so
//! it can only advance once a supermajority has built on a proposal.

use super::state_objects::SYSTEM_ACCOUNT;
use super::transaction_metadata::TransactionMetadata;
use crate::error::{ChainError, ChainResult};
use crate::ports::{Authorization, BlockSigner, FeatureValidator};
use parking_lot::Mutex;
use qc_08_fork_database::ForkNode;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use shared_types::{
    short_id, BlockHeader, BlockId, BlockSigningAuthority, BlockTimestamp, ChainId, Digest,
    DigestEncode, Extension, Name, ProducerAuthority, ProducerAuthoritySchedule,
    ProtocolFeatureActivation, PublicKey, Signature, SignedBlock,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Block extension tag carrying signatures beyond the producer signature.
pub const ADDITIONAL_BLOCK_SIGNATURES_EXTENSION: u16 = 2;

const MAXIMUM_TRACKED_DPOS_CONFIRMATIONS: usize = 1024;

/// A proposed schedule waiting to become active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PendingSchedule {
    /// Block that proposed it; it activates once this block is irreversible.
    pub schedule_lib_num: u32,
    pub schedule_hash: Digest,
    pub schedule: ProducerAuthoritySchedule,
}

/// Header state after a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderState {
    pub id: BlockId,
    pub block_num: u32,
    pub header: BlockHeader,
    pub producer_signature: Signature,
    pub additional_signatures: Vec<Signature>,
    pub dpos_proposed_irreversible_blocknum: u32,
    pub dpos_irreversible_blocknum: u32,
    pub active_schedule: ProducerAuthoritySchedule,
    pub pending_schedule: PendingSchedule,
    pub activated_protocol_features: BTreeSet<Digest>,
    pub producer_to_last_produced: BTreeMap<Name, u32>,
    pub producer_to_last_implied_irb: BTreeMap<Name, u32>,
    pub valid_block_signing_authority: BlockSigningAuthority,
    pub confirm_count: Vec<u8>,
}

/// Header state of a block under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlockHeaderState {
    pub block_num: u32,
    pub previous: BlockId,
    pub timestamp: BlockTimestamp,
    pub producer: Name,
    pub confirmed: u16,
    pub active_schedule_version: u32,
    pub active_schedule: ProducerAuthoritySchedule,
    pub prev_pending_schedule: PendingSchedule,
    pub prev_activated_protocol_features: BTreeSet<Digest>,
    pub valid_block_signing_authority: BlockSigningAuthority,
    pub dpos_proposed_irreversible_blocknum: u32,
    pub dpos_irreversible_blocknum: u32,
    pub producer_to_last_produced: BTreeMap<Name, u32>,
    pub producer_to_last_implied_irb: BTreeMap<Name, u32>,
    pub confirm_count: Vec<u8>,
    /// The previous pending schedule became active with this block.
    pub was_pending_promoted: bool,
}

impl BlockHeaderState {
    /// State of block 0: a single system producer and the chain id as the
    /// action root.
    pub fn genesis(initial_timestamp: BlockTimestamp, initial_key: PublicKey, chain_id: ChainId) -> Self {
        let system = Name::from(SYSTEM_ACCOUNT);
        let authority = BlockSigningAuthority::single(initial_key);
        let schedule = ProducerAuthoritySchedule {
            version: 0,
            producers: vec![ProducerAuthority {
                producer_name: system.clone(),
                authority: authority.clone(),
            }],
        };

        // previous carries u32::MAX so the block number wraps to zero
        let mut previous = [0u8; 32];
        previous[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        let header = BlockHeader {
            timestamp: initial_timestamp,
            producer: system.clone(),
            confirmed: 1,
            previous,
            transaction_mroot: [0u8; 32],
            action_mroot: chain_id,
            schedule_version: 0,
            new_producers: None,
            header_extensions: Vec::new(),
        };
        let block_num = header.block_num();

        Self {
            id: header.calculate_id(),
            block_num,
            header,
            producer_signature: Vec::new(),
            additional_signatures: Vec::new(),
            dpos_proposed_irreversible_blocknum: block_num,
            dpos_irreversible_blocknum: block_num,
            pending_schedule: PendingSchedule {
                schedule_lib_num: block_num,
                schedule_hash: schedule.digest(),
                schedule: schedule.clone(),
            },
            active_schedule: schedule,
            activated_protocol_features: BTreeSet::new(),
            producer_to_last_produced: [(system.clone(), block_num)].into_iter().collect(),
            producer_to_last_implied_irb: [(system, block_num)].into_iter().collect(),
            valid_block_signing_authority: authority,
            confirm_count: Vec::new(),
        }
    }

    /// Irreversible block implied if `producer_of_next_block` produces next.
    pub fn calc_dpos_last_irreversible(&self, producer_of_next_block: &Name) -> u32 {
        let mut blocknums: Vec<u32> = self
            .producer_to_last_implied_irb
            .iter()
            .map(|(name, &num)| {
                if name == producer_of_next_block {
                    self.dpos_proposed_irreversible_blocknum
                } else {
                    num
                }
            })
            .collect();
        if blocknums.is_empty() {
            return 0;
        }
        let index = (blocknums.len() - 1) / 3;
        let (_, nth, _) = blocknums.select_nth_unstable(index);
        *nth
    }

    /// Start the header state of the block following this one.
    pub fn next(&self, when: BlockTimestamp, num_prev_blocks_to_confirm: u16) -> ChainResult<PendingBlockHeaderState> {
        if when <= self.header.timestamp {
            return Err(ChainError::BlockValidate("next block must be in the future".into()));
        }
        let block_num = self.block_num.wrapping_add(1);
        let proauth = self
            .active_schedule
            .scheduled_producer(when)
            .ok_or_else(|| ChainError::ProducerSchedule("active producer schedule is empty".into()))?
            .clone();

        if let Some(&last) = self.producer_to_last_produced.get(&proauth.producer_name) {
            if last >= block_num.wrapping_sub(u32::from(num_prev_blocks_to_confirm)) {
                return Err(ChainError::BlockValidate(format!(
                    "producer {} double-confirming known range",
                    proauth.producer_name
                )));
            }
        }

        let mut confirm_count = self.confirm_count.clone();
        let num_active = self.active_schedule.producers.len();
        let required_confs = ((num_active * 2 / 3) + 1).min(usize::from(u8::MAX)) as u8;
        if confirm_count.len() < MAXIMUM_TRACKED_DPOS_CONFIRMATIONS {
            confirm_count.push(required_confs);
        } else {
            confirm_count.rotate_left(1);
            if let Some(last) = confirm_count.last_mut() {
                *last = required_confs;
            }
        }

        let mut dpos_proposed = self.dpos_proposed_irreversible_blocknum;
        let mut blocks_to_confirm = u32::from(num_prev_blocks_to_confirm) + 1;
        let mut i = confirm_count.len();
        while i > 0 && blocks_to_confirm > 0 {
            i -= 1;
            confirm_count[i] = confirm_count[i].saturating_sub(1);
            if confirm_count[i] == 0 {
                dpos_proposed = block_num.wrapping_sub((confirm_count.len() - 1 - i) as u32);
                confirm_count.drain(..=i);
                break;
            }
            blocks_to_confirm -= 1;
        }

        let dpos_irreversible = self.calc_dpos_last_irreversible(&proauth.producer_name);
        let producer = proauth.producer_name.clone();
        let pending = &self.pending_schedule;
        let promote = !pending.schedule.producers.is_empty() && dpos_irreversible >= pending.schedule_lib_num;

        let (active_schedule, last_produced, last_implied_irb) = if promote {
            let schedule = pending.schedule.clone();
            let mut last_produced = BTreeMap::new();
            let mut last_implied = BTreeMap::new();
            for p in &schedule.producers {
                let name = &p.producer_name;
                last_produced.insert(
                    name.clone(),
                    self.producer_to_last_produced.get(name).copied().unwrap_or(dpos_irreversible),
                );
                last_implied.insert(
                    name.clone(),
                    self.producer_to_last_implied_irb.get(name).copied().unwrap_or(dpos_irreversible),
                );
            }
            last_produced.insert(producer.clone(), block_num);
            last_implied.insert(producer.clone(), self.dpos_proposed_irreversible_blocknum);
            (schedule, last_produced, last_implied)
        } else {
            let mut last_produced = self.producer_to_last_produced.clone();
            let mut last_implied = self.producer_to_last_implied_irb.clone();
            last_produced.insert(producer.clone(), block_num);
            last_implied.insert(producer.clone(), self.dpos_proposed_irreversible_blocknum);
            (self.active_schedule.clone(), last_produced, last_implied)
        };

        Ok(PendingBlockHeaderState {
            block_num,
            previous: self.id,
            timestamp: when,
            producer,
            confirmed: num_prev_blocks_to_confirm,
            active_schedule_version: self.active_schedule.version,
            active_schedule,
            prev_pending_schedule: self.pending_schedule.clone(),
            prev_activated_protocol_features: self.activated_protocol_features.clone(),
            valid_block_signing_authority: proauth.authority,
            dpos_proposed_irreversible_blocknum: dpos_proposed,
            dpos_irreversible_blocknum: dpos_irreversible,
            producer_to_last_produced: last_produced,
            producer_to_last_implied_irb: last_implied_irb,
            confirm_count,
            was_pending_promoted: promote,
        })
    }

    /// Digest the producer signs: header digest bound to the pending
    /// schedule hash.
    pub fn sig_digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        self.header.digest().feed(&mut hasher);
        self.pending_schedule.schedule_hash.feed(&mut hasher);
        hasher.finalize().into()
    }

    /// Sign with `signer` and verify the result.
    pub fn sign(&mut self, signer: &BlockSigner<'_>, authorization: &dyn Authorization) -> ChainResult<()> {
        let digest = self.sig_digest();
        let mut signatures = signer(&digest)?;
        let producer_signature = signatures
            .pop()
            .ok_or_else(|| ChainError::WrongSigningKey("block signer returned no signatures".into()))?;
        self.producer_signature = producer_signature;
        self.additional_signatures = signatures;
        self.verify_signee(authorization)
    }

    /// Check the signatures against the producer's signing authority.
    pub fn verify_signee(&self, authorization: &dyn Authorization) -> ChainResult<()> {
        let authority = &self.valid_block_signing_authority;
        let num_signatures = self.additional_signatures.len() + 1;
        if num_signatures > authority.keys.len() {
            return Err(ChainError::WrongSigningKey(format!(
                "number of block signatures ({num_signatures}) exceeds number of keys in block signing authority ({})",
                authority.keys.len()
            )));
        }

        let digest = self.sig_digest();
        let recover = |signature: &Signature| {
            authorization
                .recover_key(signature, &digest)
                .map_err(|e| ChainError::WrongSigningKey(e.to_string()))
        };
        let mut keys = vec![recover(&self.producer_signature)?];
        for signature in &self.additional_signatures {
            let key = recover(signature)?;
            if keys.contains(&key) {
                return Err(ChainError::WrongSigningKey(format!(
                    "block {} signed by the same key more than once",
                    self.block_num
                )));
            }
            keys.push(key);
        }

        let all_relevant = keys
            .iter()
            .all(|k| authority.keys.iter().any(|kw| &kw.key == k));
        if !all_relevant {
            return Err(ChainError::WrongSigningKey(format!(
                "block {} signed by an unexpected key",
                short_id(&self.id)
            )));
        }
        if !authority.satisfied_by(&keys) {
            return Err(ChainError::WrongSigningKey(format!(
                "block {} signatures do not satisfy the block signing authority",
                short_id(&self.id)
            )));
        }
        Ok(())
    }
}

impl PendingBlockHeaderState {
    /// Header for the block being assembled.
    pub fn make_block_header(
        &self,
        transaction_mroot: Digest,
        action_mroot: Digest,
        new_producers: Option<ProducerAuthoritySchedule>,
        new_protocol_feature_activations: Vec<Digest>,
    ) -> ChainResult<BlockHeader> {
        let mut header_extensions = Vec::new();
        if !new_protocol_feature_activations.is_empty() {
            let activation = ProtocolFeatureActivation {
                protocol_features: new_protocol_feature_activations,
            };
            header_extensions.push(activation.to_extension()?);
        }
        Ok(BlockHeader {
            timestamp: self.timestamp,
            producer: self.producer.clone(),
            confirmed: self.confirmed,
            previous: self.previous,
            transaction_mroot,
            action_mroot,
            schedule_version: self.active_schedule_version,
            new_producers,
            header_extensions,
        })
    }

    /// Complete the header state once the header is known.
    pub fn finish_next(self, header: &BlockHeader, validator: &FeatureValidator<'_>) -> ChainResult<BlockHeaderState> {
        let mismatch = |what: &str| ChainError::BlockValidate(format!("{what} in signed block header does not match"));
        if header.timestamp != self.timestamp {
            return Err(mismatch("timestamp"));
        }
        if header.previous != self.previous {
            return Err(mismatch("previous"));
        }
        if header.producer != self.producer {
            return Err(ChainError::BlockValidate(format!(
                "wrong producer specified: expected {}, got {}",
                self.producer, header.producer
            )));
        }
        if header.confirmed != self.confirmed {
            return Err(mismatch("confirmed"));
        }
        if header.schedule_version != self.active_schedule_version {
            return Err(mismatch("schedule_version"));
        }

        let new_features = header
            .protocol_feature_activation()
            .map_err(|e| ChainError::BlockValidate(e.to_string()))?
            .map(|a| a.protocol_features)
            .unwrap_or_default();
        validator(self.timestamp, &self.prev_activated_protocol_features, &new_features)?;
        let mut activated_protocol_features = self.prev_activated_protocol_features;
        activated_protocol_features.extend(new_features);

        let prev_pending = self.prev_pending_schedule;
        let pending_schedule = if let Some(new_producers) = &header.new_producers {
            if self.was_pending_promoted {
                return Err(ChainError::ProducerSchedule(
                    "cannot set pending producer schedule in the same block in which pending was promoted to active".into(),
                ));
            }
            if new_producers.version != self.active_schedule.version + 1 {
                return Err(ChainError::ProducerSchedule(format!(
                    "wrong producer schedule version specified: expected {}, got {}",
                    self.active_schedule.version + 1,
                    new_producers.version
                )));
            }
            if !prev_pending.schedule.producers.is_empty() {
                return Err(ChainError::ProducerSchedule(
                    "cannot set new pending producers until last pending is confirmed".into(),
                ));
            }
            PendingSchedule {
                schedule_lib_num: self.block_num,
                schedule_hash: new_producers.digest(),
                schedule: new_producers.clone(),
            }
        } else if self.was_pending_promoted {
            PendingSchedule {
                schedule_lib_num: prev_pending.schedule_lib_num,
                schedule_hash: prev_pending.schedule_hash,
                schedule: ProducerAuthoritySchedule {
                    version: prev_pending.schedule.version,
                    producers: Vec::new(),
                },
            }
        } else {
            prev_pending
        };

        Ok(BlockHeaderState {
            id: header.calculate_id(),
            block_num: self.block_num,
            header: header.clone(),
            producer_signature: Vec::new(),
            additional_signatures: Vec::new(),
            dpos_proposed_irreversible_blocknum: self.dpos_proposed_irreversible_blocknum,
            dpos_irreversible_blocknum: self.dpos_irreversible_blocknum,
            active_schedule: self.active_schedule,
            pending_schedule,
            activated_protocol_features,
            producer_to_last_produced: self.producer_to_last_produced,
            producer_to_last_implied_irb: self.producer_to_last_implied_irb,
            valid_block_signing_authority: self.valid_block_signing_authority,
            confirm_count: self.confirm_count,
        })
    }
}

fn additional_signatures_of(block: &SignedBlock) -> ChainResult<Vec<Signature>> {
    let mut found = None;
    for ext in &block.block_extensions {
        if ext.id != ADDITIONAL_BLOCK_SIGNATURES_EXTENSION {
            return Err(ChainError::BlockValidate(format!(
                "unsupported block extension {}",
                ext.id
            )));
        }
        if found.is_some() {
            return Err(ChainError::BlockValidate(
                "duplicate additional block signatures extension".into(),
            ));
        }
        let signatures: Vec<Signature> = bincode::deserialize(&ext.data)
            .map_err(|e| ChainError::BlockValidate(format!("malformed additional signatures: {e}")))?;
        if signatures.is_empty() {
            return Err(ChainError::BlockValidate(
                "additional block signatures extension is empty".into(),
            ));
        }
        found = Some(signatures);
    }
    Ok(found.unwrap_or_default())
}

/// A block in the fork database: header state, body and cached metadata.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockState {
    pub header_state: BlockHeaderState,
    /// Absent for the head loaded from a snapshot.
    pub block: Option<Arc<SignedBlock>>,
    #[serde(skip)]
    validated: AtomicBool,
    #[serde(skip)]
    pub_keys_recovered: AtomicBool,
    #[serde(skip)]
    cached_trxs: Mutex<Vec<Arc<TransactionMetadata>>>,
}

impl BlockState {
    pub fn new(header_state: BlockHeaderState, block: Option<Arc<SignedBlock>>) -> Self {
        Self {
            header_state,
            block,
            validated: AtomicBool::new(false),
            pub_keys_recovered: AtomicBool::new(false),
            cached_trxs: Mutex::new(Vec::new()),
        }
    }

    /// Genesis block state; valid by definition.
    pub fn genesis(header_state: BlockHeaderState) -> Self {
        let block = SignedBlock::from_header(header_state.header.clone());
        let state = Self::new(header_state, Some(Arc::new(block)));
        state.validated.store(true, Ordering::Release);
        state
    }

    /// State of a block assembled locally, signed by `signer`.
    pub fn from_pending(
        pending: PendingBlockHeaderState,
        mut block: SignedBlock,
        trx_metas: Vec<Arc<TransactionMetadata>>,
        validator: &FeatureValidator<'_>,
        signer: &BlockSigner<'_>,
        authorization: &dyn Authorization,
    ) -> ChainResult<Self> {
        let mut header_state = pending.finish_next(&block.header, validator)?;
        header_state.sign(signer, authorization)?;
        block.producer_signature = header_state.producer_signature.clone();
        if !header_state.additional_signatures.is_empty() {
            block.block_extensions.push(Extension {
                id: ADDITIONAL_BLOCK_SIGNATURES_EXTENSION,
                data: bincode::serialize(&header_state.additional_signatures)?,
            });
        }
        let state = Self::new(header_state, Some(Arc::new(block)));
        state.set_trxs_metas(trx_metas, true);
        Ok(state)
    }

    /// State of a block received from elsewhere, built on `prev`.
    pub fn from_received(
        prev: &BlockHeaderState,
        block: Arc<SignedBlock>,
        validator: &FeatureValidator<'_>,
        skip_validate_signee: bool,
        authorization: &dyn Authorization,
    ) -> ChainResult<Self> {
        let pending = prev.next(block.header.timestamp, block.header.confirmed)?;
        let mut header_state = pending.finish_next(&block.header, validator)?;
        header_state.producer_signature = block.producer_signature.clone();
        header_state.additional_signatures = additional_signatures_of(&block)?;
        if !skip_validate_signee {
            header_state.verify_signee(authorization)?;
        }
        Ok(Self::new(header_state, Some(block)))
    }

    pub fn id(&self) -> BlockId {
        self.header_state.id
    }

    pub fn block_num(&self) -> u32 {
        self.header_state.block_num
    }

    pub fn previous(&self) -> BlockId {
        self.header_state.header.previous
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        self.header_state.header.timestamp
    }

    pub fn dpos_irreversible_blocknum(&self) -> u32 {
        self.header_state.dpos_irreversible_blocknum
    }

    /// Features newly activated by this block's header.
    pub fn new_protocol_feature_activations(&self) -> ChainResult<Vec<Digest>> {
        Ok(self
            .header_state
            .header
            .protocol_feature_activation()?
            .map(|a| a.protocol_features)
            .unwrap_or_default())
    }

    pub fn is_pub_keys_recovered(&self) -> bool {
        self.pub_keys_recovered.load(Ordering::Acquire)
    }

    pub fn trxs_metas(&self) -> Vec<Arc<TransactionMetadata>> {
        self.cached_trxs.lock().clone()
    }

    pub fn set_trxs_metas(&self, metas: Vec<Arc<TransactionMetadata>>, keys_recovered: bool) {
        *self.cached_trxs.lock() = metas;
        self.pub_keys_recovered.store(keys_recovered, Ordering::Release);
    }

    /// Take the cached metadata, leaving the cache empty.
    pub fn extract_trxs_metas(&self) -> Vec<Arc<TransactionMetadata>> {
        self.pub_keys_recovered.store(false, Ordering::Release);
        std::mem::take(&mut *self.cached_trxs.lock())
    }
}

impl ForkNode for BlockState {
    fn id(&self) -> BlockId {
        self.header_state.id
    }

    fn previous(&self) -> BlockId {
        self.header_state.header.previous
    }

    fn block_num(&self) -> u32 {
        self.header_state.block_num
    }

    fn timestamp(&self) -> BlockTimestamp {
        self.header_state.header.timestamp
    }

    fn irreversible_blocknum(&self) -> u32 {
        self.header_state.dpos_irreversible_blocknum
    }

    fn is_valid(&self) -> bool {
        self.validated.load(Ordering::Acquire)
    }

    fn set_valid(&self, valid: bool) {
        self.validated.store(valid, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PermissiveAuthorization;

    const KEY: &[u8] = b"genesis-key";

    fn no_features(_: BlockTimestamp, _: &BTreeSet<Digest>, _: &[Digest]) -> ChainResult<()> {
        Ok(())
    }

    fn genesis() -> BlockHeaderState {
        BlockHeaderState::genesis(BlockTimestamp::from_slot(100), KEY.to_vec(), [9u8; 32])
    }

    fn produce(prev: &BlockHeaderState, slot: u32) -> BlockHeaderState {
        let pending = prev.next(BlockTimestamp::from_slot(slot), 0).unwrap();
        let header = pending
            .make_block_header([0u8; 32], [0u8; 32], None, Vec::new())
            .unwrap();
        let mut state = pending.finish_next(&header, &no_features).unwrap();
        let signer = |d: &Digest| Ok(vec![PermissiveAuthorization::sign(KEY, d)]);
        state.sign(&signer, &PermissiveAuthorization).unwrap();
        state
    }

    #[test]
    fn test_genesis_is_block_zero() {
        let g = genesis();
        assert_eq!(g.block_num, 0);
        assert_eq!(shared_types::block_num_from_id(&g.id), 0);
        assert_eq!(g.header.action_mroot, [9u8; 32]);
    }

    #[test]
    fn test_single_producer_lib_trails_head_by_one() {
        let mut state = genesis();
        for slot in 101..110 {
            state = produce(&state, slot);
            assert_eq!(state.dpos_irreversible_blocknum, state.block_num - 1);
        }
        assert_eq!(state.block_num, 9);
    }

    #[test]
    fn test_first_block_promotes_genesis_schedule() {
        let g = genesis();
        let pending = g.next(BlockTimestamp::from_slot(101), 0).unwrap();
        assert!(pending.was_pending_promoted);
        let header = pending
            .make_block_header([0u8; 32], [0u8; 32], None, Vec::new())
            .unwrap();
        let state = pending.finish_next(&header, &no_features).unwrap();
        assert!(state.pending_schedule.schedule.producers.is_empty());
        assert_eq!(state.active_schedule.version, 0);
    }

    #[test]
    fn test_next_requires_later_timestamp() {
        let g = genesis();
        let err = g.next(BlockTimestamp::from_slot(100), 0).unwrap_err();
        assert!(matches!(err, ChainError::BlockValidate(_)));
    }

    #[test]
    fn test_double_confirmation_rejected() {
        let one = produce(&genesis(), 101);
        // block 2 by the same producer may not confirm block 1 again
        assert!(one.next(BlockTimestamp::from_slot(102), 0).is_ok());
        assert!(matches!(
            one.next(BlockTimestamp::from_slot(102), 1),
            Err(ChainError::BlockValidate(_))
        ));
    }

    #[test]
    fn test_calc_dpos_last_irreversible_takes_lower_third() {
        let mut state = genesis();
        state.producer_to_last_implied_irb = [("a", 10), ("b", 20), ("c", 30), ("d", 40)]
            .into_iter()
            .map(|(n, v)| (Name::from(n), v))
            .collect();
        state.dpos_proposed_irreversible_blocknum = 50;
        // (4 - 1) / 3 = index 1 of [10, 20, 30, 40]
        assert_eq!(state.calc_dpos_last_irreversible(&Name::from("z")), 20);
        // a's entry is replaced by the proposed value: [20, 30, 40, 50]
        assert_eq!(state.calc_dpos_last_irreversible(&Name::from("a")), 30);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let pending = genesis().next(BlockTimestamp::from_slot(101), 0).unwrap();
        let header = pending
            .make_block_header([0u8; 32], [0u8; 32], None, Vec::new())
            .unwrap();
        let mut state = pending.finish_next(&header, &no_features).unwrap();
        let signer = |d: &Digest| Ok(vec![PermissiveAuthorization::sign(b"other-key", d)]);
        assert!(matches!(
            state.sign(&signer, &PermissiveAuthorization),
            Err(ChainError::WrongSigningKey(_))
        ));
    }

    #[test]
    fn test_new_producers_need_next_version() {
        let one = produce(&genesis(), 101);
        let pending = one.next(BlockTimestamp::from_slot(102), 0).unwrap();
        let bad = ProducerAuthoritySchedule {
            version: 5,
            producers: one.active_schedule.producers.clone(),
        };
        let header = pending
            .make_block_header([0u8; 32], [0u8; 32], Some(bad), Vec::new())
            .unwrap();
        assert!(matches!(
            pending.clone().finish_next(&header, &no_features),
            Err(ChainError::ProducerSchedule(_))
        ));

        let good = ProducerAuthoritySchedule {
            version: 1,
            producers: one.active_schedule.producers.clone(),
        };
        let header = pending
            .make_block_header([0u8; 32], [0u8; 32], Some(good), Vec::new())
            .unwrap();
        let state = pending.finish_next(&header, &no_features).unwrap();
        assert_eq!(state.pending_schedule.schedule_lib_num, 2);
        assert_eq!(state.pending_schedule.schedule.version, 1);
    }

    #[test]
    fn test_received_block_matches_produced_state() {
        let g = genesis();
        let produced = produce(&g, 101);
        let mut block = SignedBlock::from_header(produced.header.clone());
        block.producer_signature = produced.producer_signature.clone();
        let received =
            BlockState::from_received(&g, Arc::new(block), &no_features, false, &PermissiveAuthorization)
                .unwrap();
        assert_eq!(received.header_state, produced);
        assert!(!received.is_valid());
    }
}
