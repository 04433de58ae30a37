//! # Protocol Features
//!
//! A protocol feature is a consensus rule change identified by a digest.
//! [`ProtocolFeatureSet`] is the node's catalogue of recognized features
//! and their subjective activation restrictions; [`ProtocolFeatureManager`]
//! tracks which of them are active at which block.
//!
//! ```text
//!   recognized ──preactivate──► preactivated ──start_block──► activated(block_num)
//!        │                                                          │
//!        └──────── listed in a block header extension ──────────────┘
//! ```
//!
//! Activation is strictly ordered by block number so that popping blocks
//! can undo activations from the top.

use super::state_objects::{ActivatedProtocolFeature, ProtocolStateObject};
use crate::error::{ChainError, ChainResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use shared_types::{sha256, short_id, BlockTimestamp, Digest, DigestEncode, TimePoint};
use std::collections::{BTreeSet, HashMap};
use tracing::info;

/// Features built into this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuiltinProtocolFeature {
    PreactivateFeature,
    OnlyLinkToExistingPermission,
    ReplaceDeferred,
    NoDuplicateDeferredId,
    FixLinkauthRestriction,
    DisallowEmptyProducerSchedule,
    RestrictActionToSelf,
    OnlyBillFirstAuthorizer,
    ForwardSetcode,
    GetSender,
    RamRestrictions,
    WebauthnKey,
    WtmsigBlockSignatures,
    ActionReturnValue,
    BlockchainParameters,
    GetCodeHash,
    ConfigurableWasmLimits,
    CryptoPrimitives,
    GetBlockNum,
    EmKey,
    BlsPrimitives,
    DisableDeferredTrxsStage1,
    DisableDeferredTrxsStage2,
    DisableCompressionInTransactionMerkle,
    MultipleStateRootsSupported,
    EdKey,
}

impl BuiltinProtocolFeature {
    /// Every builtin, in an order where dependencies come first.
    pub const ALL: [BuiltinProtocolFeature; 26] = [
        Self::PreactivateFeature,
        Self::OnlyLinkToExistingPermission,
        Self::ReplaceDeferred,
        Self::NoDuplicateDeferredId,
        Self::FixLinkauthRestriction,
        Self::DisallowEmptyProducerSchedule,
        Self::RestrictActionToSelf,
        Self::OnlyBillFirstAuthorizer,
        Self::ForwardSetcode,
        Self::GetSender,
        Self::RamRestrictions,
        Self::WebauthnKey,
        Self::WtmsigBlockSignatures,
        Self::ActionReturnValue,
        Self::BlockchainParameters,
        Self::GetCodeHash,
        Self::ConfigurableWasmLimits,
        Self::CryptoPrimitives,
        Self::GetBlockNum,
        Self::EmKey,
        Self::BlsPrimitives,
        Self::DisableDeferredTrxsStage1,
        Self::DisableDeferredTrxsStage2,
        Self::DisableCompressionInTransactionMerkle,
        Self::MultipleStateRootsSupported,
        Self::EdKey,
    ];

    /// Stable numeric tag, part of the feature digest.
    pub fn index(self) -> u32 {
        match self {
            Self::PreactivateFeature => 0,
            Self::OnlyLinkToExistingPermission => 1,
            Self::ReplaceDeferred => 2,
            Self::NoDuplicateDeferredId => 3,
            Self::FixLinkauthRestriction => 4,
            Self::DisallowEmptyProducerSchedule => 5,
            Self::RestrictActionToSelf => 6,
            Self::OnlyBillFirstAuthorizer => 7,
            Self::ForwardSetcode => 8,
            Self::GetSender => 9,
            Self::RamRestrictions => 10,
            Self::WebauthnKey => 11,
            Self::WtmsigBlockSignatures => 12,
            Self::ActionReturnValue => 13,
            Self::BlockchainParameters => 16,
            Self::GetCodeHash => 17,
            Self::ConfigurableWasmLimits => 18,
            Self::CryptoPrimitives => 19,
            Self::GetBlockNum => 20,
            Self::EmKey => 21,
            Self::BlsPrimitives => 22,
            Self::DisableDeferredTrxsStage1 => 23,
            Self::DisableDeferredTrxsStage2 => 24,
            Self::DisableCompressionInTransactionMerkle => 25,
            Self::MultipleStateRootsSupported => 26,
            Self::EdKey => 27,
        }
    }

    pub fn codename(self) -> &'static str {
        match self {
            Self::PreactivateFeature => "PREACTIVATE_FEATURE",
            Self::OnlyLinkToExistingPermission => "ONLY_LINK_TO_EXISTING_PERMISSION",
            Self::ReplaceDeferred => "REPLACE_DEFERRED",
            Self::NoDuplicateDeferredId => "NO_DUPLICATE_DEFERRED_ID",
            Self::FixLinkauthRestriction => "FIX_LINKAUTH_RESTRICTION",
            Self::DisallowEmptyProducerSchedule => "DISALLOW_EMPTY_PRODUCER_SCHEDULE",
            Self::RestrictActionToSelf => "RESTRICT_ACTION_TO_SELF",
            Self::OnlyBillFirstAuthorizer => "ONLY_BILL_FIRST_AUTHORIZER",
            Self::ForwardSetcode => "FORWARD_SETCODE",
            Self::GetSender => "GET_SENDER",
            Self::RamRestrictions => "RAM_RESTRICTIONS",
            Self::WebauthnKey => "WEBAUTHN_KEY",
            Self::WtmsigBlockSignatures => "WTMSIG_BLOCK_SIGNATURES",
            Self::ActionReturnValue => "ACTION_RETURN_VALUE",
            Self::BlockchainParameters => "BLOCKCHAIN_PARAMETERS",
            Self::GetCodeHash => "GET_CODE_HASH",
            Self::ConfigurableWasmLimits => "CONFIGURABLE_WASM_LIMITS",
            Self::CryptoPrimitives => "CRYPTO_PRIMITIVES",
            Self::GetBlockNum => "GET_BLOCK_NUM",
            Self::EmKey => "EM_KEY",
            Self::BlsPrimitives => "BLS_PRIMITIVES",
            Self::DisableDeferredTrxsStage1 => "DISABLE_DEFERRED_TRXS_STAGE_1",
            Self::DisableDeferredTrxsStage2 => "DISABLE_DEFERRED_TRXS_STAGE_2",
            Self::DisableCompressionInTransactionMerkle => "DISABLE_COMPRESSION_IN_TRANSACTION_MERKLE",
            Self::MultipleStateRootsSupported => "MULTIPLE_STATE_ROOTS_SUPPORTED",
            Self::EdKey => "ED_KEY",
        }
    }

    pub fn from_codename(codename: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.codename() == codename)
    }

    /// Builtins that must be active before this one.
    pub fn builtin_dependencies(self) -> &'static [BuiltinProtocolFeature] {
        match self {
            Self::DisableDeferredTrxsStage2 => &[Self::DisableDeferredTrxsStage1],
            _ => &[],
        }
    }

    pub fn default_restrictions(self) -> SubjectiveRestrictions {
        match self {
            Self::PreactivateFeature => SubjectiveRestrictions {
                earliest_allowed_activation_time: TimePoint(0),
                preactivation_required: false,
                enabled: true,
            },
            _ => SubjectiveRestrictions::default(),
        }
    }

    /// Canonical description hashed into the feature digest.
    pub fn description_digest(self) -> Digest {
        sha256(format!("Builtin protocol feature: {}\n", self.codename()).as_bytes())
    }
}

/// Node-local policy on when a feature may activate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectiveRestrictions {
    pub earliest_allowed_activation_time: TimePoint,
    pub preactivation_required: bool,
    pub enabled: bool,
}

impl Default for SubjectiveRestrictions {
    fn default() -> Self {
        Self {
            earliest_allowed_activation_time: TimePoint(0),
            preactivation_required: true,
            enabled: true,
        }
    }
}

/// Description of a builtin feature before it is added to a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinFeatureDescriptor {
    pub codename: BuiltinProtocolFeature,
    pub description_digest: Digest,
    pub dependencies: BTreeSet<Digest>,
    pub subjective_restrictions: SubjectiveRestrictions,
}

impl BuiltinFeatureDescriptor {
    /// Feature digest over type, description, dependencies and codename.
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        0u32.feed(&mut hasher);
        self.description_digest.feed(&mut hasher);
        (self.dependencies.len() as u32).feed(&mut hasher);
        for dependency in &self.dependencies {
            dependency.feed(&mut hasher);
        }
        self.codename.index().feed(&mut hasher);
        hasher.finalize().into()
    }
}

/// A recognized feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFeature {
    pub feature_digest: Digest,
    pub description_digest: Digest,
    pub dependencies: BTreeSet<Digest>,
    pub earliest_allowed_activation_time: TimePoint,
    pub preactivation_required: bool,
    pub enabled: bool,
    pub builtin_feature: Option<BuiltinProtocolFeature>,
}

/// Outcome of asking whether a feature may activate now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizedStatus {
    Unrecognized,
    Disabled,
    TooEarly,
    Ready,
}

/// Catalogue of features this node recognizes.
#[derive(Debug, Clone, Default)]
pub struct ProtocolFeatureSet {
    recognized: HashMap<Digest, ProtocolFeature>,
    builtin_digests: HashMap<BuiltinProtocolFeature, Digest>,
}

impl ProtocolFeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recognize every builtin with its default restrictions.
    pub fn with_all_builtins() -> ChainResult<Self> {
        let mut set = Self::new();
        for codename in BuiltinProtocolFeature::ALL {
            let known = set.builtin_digests.clone();
            let descriptor = Self::make_default_builtin(codename, |dependency| {
                known.get(&dependency).copied().ok_or_else(|| {
                    ChainError::ProtocolFeature(format!(
                        "builtin {} needs {} to be recognized first",
                        codename.codename(),
                        dependency.codename()
                    ))
                })
            })?;
            set.add_feature(descriptor)?;
        }
        Ok(set)
    }

    /// Build a descriptor with default restrictions. `handle_dependency`
    /// resolves each builtin dependency to its digest.
    pub fn make_default_builtin(
        codename: BuiltinProtocolFeature,
        mut handle_dependency: impl FnMut(BuiltinProtocolFeature) -> ChainResult<Digest>,
    ) -> ChainResult<BuiltinFeatureDescriptor> {
        let mut dependencies = BTreeSet::new();
        for dependency in codename.builtin_dependencies() {
            dependencies.insert(handle_dependency(*dependency)?);
        }
        Ok(BuiltinFeatureDescriptor {
            codename,
            description_digest: codename.description_digest(),
            dependencies,
            subjective_restrictions: codename.default_restrictions(),
        })
    }

    pub fn add_feature(&mut self, descriptor: BuiltinFeatureDescriptor) -> ChainResult<Digest> {
        let codename = descriptor.codename;
        if self.builtin_digests.contains_key(&codename) {
            return Err(ChainError::ProtocolFeature(format!(
                "builtin protocol feature {} was already added",
                codename.codename()
            )));
        }
        for dependency in &descriptor.dependencies {
            if !self.recognized.contains_key(dependency) {
                return Err(ChainError::ProtocolFeature(format!(
                    "dependency {} of {} is not recognized",
                    short_id(dependency),
                    codename.codename()
                )));
            }
        }
        for required in codename.builtin_dependencies() {
            let satisfied = self
                .builtin_digests
                .get(required)
                .is_some_and(|d| descriptor.dependencies.contains(d));
            if !satisfied {
                return Err(ChainError::ProtocolFeature(format!(
                    "{} must depend on builtin {}",
                    codename.codename(),
                    required.codename()
                )));
            }
        }

        let digest = descriptor.digest();
        if self.recognized.contains_key(&digest) {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest {} was already added",
                short_id(&digest)
            )));
        }
        let restrictions = descriptor.subjective_restrictions;
        self.recognized.insert(
            digest,
            ProtocolFeature {
                feature_digest: digest,
                description_digest: descriptor.description_digest,
                dependencies: descriptor.dependencies,
                earliest_allowed_activation_time: restrictions.earliest_allowed_activation_time,
                preactivation_required: restrictions.preactivation_required,
                enabled: restrictions.enabled,
                builtin_feature: Some(codename),
            },
        );
        self.builtin_digests.insert(codename, digest);
        Ok(digest)
    }

    pub fn len(&self) -> usize {
        self.recognized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recognized.is_empty()
    }

    pub fn is_recognized(&self, digest: &Digest, now: TimePoint) -> RecognizedStatus {
        match self.recognized.get(digest) {
            None => RecognizedStatus::Unrecognized,
            Some(f) if !f.enabled => RecognizedStatus::Disabled,
            Some(f) if f.earliest_allowed_activation_time > now => RecognizedStatus::TooEarly,
            Some(_) => RecognizedStatus::Ready,
        }
    }

    pub fn get_builtin_digest(&self, codename: BuiltinProtocolFeature) -> Option<Digest> {
        self.builtin_digests.get(&codename).copied()
    }

    pub fn get_protocol_feature(&self, digest: &Digest) -> ChainResult<&ProtocolFeature> {
        self.recognized.get(digest).ok_or_else(|| {
            ChainError::ProtocolFeature(format!(
                "unrecognized protocol feature with digest {}",
                short_id(digest)
            ))
        })
    }

    /// Whether every dependency of `digest` passes `satisfied`.
    pub fn validate_dependencies(
        &self,
        digest: &Digest,
        mut satisfied: impl FnMut(&Digest) -> bool,
    ) -> bool {
        match self.recognized.get(digest) {
            Some(f) => f.dependencies.iter().all(|d| satisfied(d)),
            None => false,
        }
    }

    /// Validate the activations a block header announces.
    pub fn check_protocol_features(
        &self,
        timestamp: BlockTimestamp,
        currently_activated: &BTreeSet<Digest>,
        new_features: &[Digest],
    ) -> ChainResult<()> {
        let now = timestamp.to_time_point();
        for (i, digest) in new_features.iter().enumerate() {
            let id = short_id(digest);
            match self.is_recognized(digest, now) {
                RecognizedStatus::Unrecognized => {
                    return Err(ChainError::ProtocolFeature(format!(
                        "protocol feature with digest '{id}' is unrecognized"
                    )))
                }
                RecognizedStatus::Disabled => {
                    return Err(ChainError::ProtocolFeature(format!(
                        "protocol feature with digest '{id}' is disabled"
                    )))
                }
                RecognizedStatus::TooEarly => {
                    return Err(ChainError::ProtocolFeature(format!(
                        "block timestamp is before the earliest allowed activation of protocol feature '{id}'"
                    )))
                }
                RecognizedStatus::Ready => {}
            }
            let earlier = &new_features[..i];
            if currently_activated.contains(digest) {
                return Err(ChainError::ProtocolFeature(format!(
                    "protocol feature with digest '{id}' was already activated"
                )));
            }
            if earlier.contains(digest) {
                return Err(ChainError::ProtocolFeature(format!(
                    "protocol feature with digest '{id}' was activated twice in the same block"
                )));
            }
            let deps_ok = self.validate_dependencies(digest, |d| {
                currently_activated.contains(d) || earlier.contains(d)
            });
            if !deps_ok {
                return Err(ChainError::ProtocolFeature(format!(
                    "not all dependencies of protocol feature '{id}' have been activated"
                )));
            }
        }
        Ok(())
    }
}

/// Tracks activations against the feature set.
#[derive(Debug, Default)]
pub struct ProtocolFeatureManager {
    feature_set: ProtocolFeatureSet,
    activated: Vec<ActivatedProtocolFeature>,
    builtin_activation: HashMap<BuiltinProtocolFeature, u32>,
    initialized: bool,
}

impl ProtocolFeatureManager {
    pub fn new(feature_set: ProtocolFeatureSet) -> Self {
        Self {
            feature_set,
            ..Self::default()
        }
    }

    pub fn feature_set(&self) -> &ProtocolFeatureSet {
        &self.feature_set
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Rebuild activation state from the persisted protocol state.
    pub fn init(&mut self, pso: &ProtocolStateObject) -> ChainResult<()> {
        self.activated.clear();
        self.builtin_activation.clear();
        for f in &pso.activated_protocol_features {
            self.activate_feature(&f.feature_digest, f.activation_block_num)?;
        }
        self.initialized = true;
        Ok(())
    }

    pub fn activate_feature(&mut self, digest: &Digest, current_block_num: u32) -> ChainResult<()> {
        let feature = self.feature_set.get_protocol_feature(digest)?;
        if let Some(last) = self.activated.last() {
            if last.activation_block_num > current_block_num {
                return Err(ChainError::ProtocolFeature(format!(
                    "activation at block {current_block_num} precedes the latest activation at block {}",
                    last.activation_block_num
                )));
            }
        }
        if self.activated.iter().any(|a| &a.feature_digest == digest) {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature {} is already activated",
                short_id(digest)
            )));
        }
        if let Some(builtin) = feature.builtin_feature {
            self.builtin_activation.insert(builtin, current_block_num);
            info!(
                feature = builtin.codename(),
                block_num = current_block_num,
                "[qc-17] protocol feature activated"
            );
        }
        self.activated.push(ActivatedProtocolFeature {
            feature_digest: *digest,
            activation_block_num: current_block_num,
        });
        Ok(())
    }

    /// Forget activations above `block_num`.
    pub fn popped_blocks_to(&mut self, block_num: u32) {
        while let Some(last) = self.activated.last() {
            if last.activation_block_num <= block_num {
                break;
            }
            if let Ok(f) = self.feature_set.get_protocol_feature(&last.feature_digest) {
                if let Some(builtin) = f.builtin_feature {
                    self.builtin_activation.remove(&builtin);
                }
            }
            self.activated.pop();
        }
    }

    pub fn is_builtin_activated(&self, feature: BuiltinProtocolFeature, current_block_num: u32) -> bool {
        self.builtin_activation
            .get(&feature)
            .is_some_and(|&activated_at| activated_at <= current_block_num)
    }

    pub fn activated_features(&self) -> &[ActivatedProtocolFeature] {
        &self.activated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_digests_are_deterministic() {
        let a = ProtocolFeatureSet::with_all_builtins().unwrap();
        let b = ProtocolFeatureSet::with_all_builtins().unwrap();
        assert_eq!(a.len(), BuiltinProtocolFeature::ALL.len());
        for f in BuiltinProtocolFeature::ALL {
            assert_eq!(a.get_builtin_digest(f), b.get_builtin_digest(f));
        }
    }

    #[test]
    fn test_codename_round_trip() {
        for f in BuiltinProtocolFeature::ALL {
            assert_eq!(BuiltinProtocolFeature::from_codename(f.codename()), Some(f));
        }
    }

    #[test]
    fn test_stage_two_depends_on_stage_one() {
        let set = ProtocolFeatureSet::with_all_builtins().unwrap();
        let stage1 = set
            .get_builtin_digest(BuiltinProtocolFeature::DisableDeferredTrxsStage1)
            .unwrap();
        let stage2 = set
            .get_builtin_digest(BuiltinProtocolFeature::DisableDeferredTrxsStage2)
            .unwrap();
        assert!(!set.validate_dependencies(&stage2, |_| false));
        assert!(set.validate_dependencies(&stage2, |d| *d == stage1));

        let ts = BlockTimestamp::from_slot(1);
        let err = set
            .check_protocol_features(ts, &BTreeSet::new(), &[stage2])
            .unwrap_err();
        assert!(matches!(err, ChainError::ProtocolFeature(_)));
        assert!(set
            .check_protocol_features(ts, &BTreeSet::new(), &[stage1, stage2])
            .is_ok());
    }

    #[test]
    fn test_duplicate_activation_in_batch_rejected() {
        let set = ProtocolFeatureSet::with_all_builtins().unwrap();
        let d = set
            .get_builtin_digest(BuiltinProtocolFeature::GetSender)
            .unwrap();
        let ts = BlockTimestamp::from_slot(1);
        assert!(set.check_protocol_features(ts, &BTreeSet::new(), &[d, d]).is_err());
        let active: BTreeSet<Digest> = [d].into_iter().collect();
        assert!(set.check_protocol_features(ts, &active, &[d]).is_err());
    }

    #[test]
    fn test_unrecognized_feature_rejected() {
        let set = ProtocolFeatureSet::with_all_builtins().unwrap();
        assert_eq!(
            set.is_recognized(&[7u8; 32], TimePoint(0)),
            RecognizedStatus::Unrecognized
        );
    }

    #[test]
    fn test_duplicate_builtin_rejected() {
        let mut set = ProtocolFeatureSet::with_all_builtins().unwrap();
        let descriptor =
            ProtocolFeatureSet::make_default_builtin(BuiltinProtocolFeature::GetSender, |_| {
                Ok([0u8; 32])
            })
            .unwrap();
        assert!(set.add_feature(descriptor).is_err());
    }

    #[test]
    fn test_manager_pops_activations_above_block() {
        let set = ProtocolFeatureSet::with_all_builtins().unwrap();
        let sender = set.get_builtin_digest(BuiltinProtocolFeature::GetSender).unwrap();
        let num = set.get_builtin_digest(BuiltinProtocolFeature::GetBlockNum).unwrap();
        let mut manager = ProtocolFeatureManager::new(set);

        manager.activate_feature(&sender, 5).unwrap();
        manager.activate_feature(&num, 7).unwrap();
        assert!(manager.is_builtin_activated(BuiltinProtocolFeature::GetBlockNum, 7));
        assert!(!manager.is_builtin_activated(BuiltinProtocolFeature::GetBlockNum, 6));

        manager.popped_blocks_to(6);
        assert!(!manager.is_builtin_activated(BuiltinProtocolFeature::GetBlockNum, 10));
        assert!(manager.is_builtin_activated(BuiltinProtocolFeature::GetSender, 10));
        assert_eq!(manager.activated_features().len(), 1);
    }

    #[test]
    fn test_manager_rejects_out_of_order_activation() {
        let set = ProtocolFeatureSet::with_all_builtins().unwrap();
        let sender = set.get_builtin_digest(BuiltinProtocolFeature::GetSender).unwrap();
        let num = set.get_builtin_digest(BuiltinProtocolFeature::GetBlockNum).unwrap();
        let mut manager = ProtocolFeatureManager::new(set);
        manager.activate_feature(&sender, 5).unwrap();
        assert!(manager.activate_feature(&num, 4).is_err());
        assert!(manager.activate_feature(&sender, 6).is_err());
    }
}
