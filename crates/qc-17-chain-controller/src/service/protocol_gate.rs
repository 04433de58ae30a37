//! Protocol feature gating and producer schedule proposals.

use super::Controller;
use crate::domain::{
    BlockStatus, BuiltinProtocolFeature, GlobalPropertyObject, ProtocolStateObject,
    RecognizedStatus,
};
use crate::error::{ChainError, ChainResult};
use shared_types::{short_id, Digest, ProducerAuthority, ProducerAuthoritySchedule};
use std::collections::BTreeSet;
use tracing::info;

/// Feature violations are the producer's own fault while producing, and
/// make a received block invalid otherwise.
pub(super) fn gate_error(status: BlockStatus, msg: String) -> ChainError {
    if matches!(status, BlockStatus::Incomplete | BlockStatus::Ephemeral) {
        ChainError::SubjectiveBlockProduction(msg)
    } else {
        ChainError::ProtocolFeatureBadBlock(msg)
    }
}

impl Controller {
    /// Mark a feature for activation by the next block. Must be called
    /// while building a block.
    pub fn preactivate_feature(&mut self, digest: &Digest) -> ChainResult<()> {
        let pending = self.pending_ref()?;
        let status = pending.block_status;
        let block_time = pending.block_stage.timestamp().to_time_point();
        let id = short_id(digest);

        let feature_set = self.protocol_features.feature_set();
        match feature_set.is_recognized(digest, block_time) {
            RecognizedStatus::Ready => {}
            RecognizedStatus::Unrecognized => {
                return Err(gate_error(
                    status,
                    format!("protocol feature with digest '{id}' is unrecognized"),
                ))
            }
            RecognizedStatus::Disabled => {
                return Err(gate_error(
                    status,
                    format!("protocol feature with digest '{id}' is disabled"),
                ))
            }
            RecognizedStatus::TooEarly => {
                return Err(gate_error(
                    status,
                    format!("block time is before the earliest allowed activation of protocol feature '{id}'"),
                ))
            }
        }

        if self.is_protocol_feature_activated(digest)? {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest '{id}' is already activated"
            )));
        }

        let pso: ProtocolStateObject = self.db.fetch(&[])?;
        if pso.preactivated_protocol_features.contains(digest) {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest '{id}' is already pre-activated"
            )));
        }

        let activated: BTreeSet<Digest> = self
            .protocol_features
            .activated_features()
            .iter()
            .map(|f| f.feature_digest)
            .collect();
        let dependencies_met = feature_set.validate_dependencies(digest, |d| {
            activated.contains(d) || pso.preactivated_protocol_features.contains(d)
        });
        if !dependencies_met {
            return Err(ChainError::ProtocolFeature(format!(
                "not all dependencies of protocol feature with digest '{id}' have been activated or pre-activated"
            )));
        }

        self.db.modify::<ProtocolStateObject>(&[], |pso| {
            pso.preactivated_protocol_features.push(*digest);
        })?;
        info!(feature = %id, "[qc-17] protocol feature pre-activated");
        Ok(())
    }

    /// Check a candidate activation list against the head block.
    pub fn validate_protocol_features(&self, features: &[Digest]) -> ChainResult<()> {
        let head = self.head()?;
        self.protocol_features.feature_set().check_protocol_features(
            head.timestamp(),
            &head.header_state.activated_protocol_features,
            features,
        )
    }

    /// Whether a feature is active in the pending block, or at the head
    /// when there is none.
    pub fn is_protocol_feature_activated(&self, digest: &Digest) -> ChainResult<bool> {
        match &self.pending {
            Some(pending) => pending.block_stage.is_protocol_feature_activated(digest),
            None => Ok(self
                .head()?
                .header_state
                .activated_protocol_features
                .contains(digest)),
        }
    }

    pub fn is_builtin_activated(&self, feature: BuiltinProtocolFeature) -> bool {
        let head_num = self.head.as_ref().map_or(0, |h| h.block_num());
        let current = if self.pending.is_some() {
            head_num.saturating_add(1)
        } else {
            head_num
        };
        self.protocol_features.is_builtin_activated(feature, current)
    }

    /// Propose a new producer schedule. Returns the proposed version, or -1
    /// when nothing was proposed.
    pub fn set_proposed_producers(&mut self, producers: Vec<ProducerAuthority>) -> ChainResult<i64> {
        let pending = self.pending_ref()?;
        let header = &pending.block_stage.building()?.pending_block_header_state;
        let current_block_num = header.block_num;

        if producers.is_empty()
            && self.is_builtin_activated(BuiltinProtocolFeature::DisallowEmptyProducerSchedule)
        {
            return Err(ChainError::ProducerSchedule(
                "producer schedule cannot be empty".into(),
            ));
        }

        let gpo: GlobalPropertyObject = self.db.fetch(&[])?;
        if let Some(proposed_in) = gpo.proposed_schedule_block_num {
            if proposed_in != current_block_num {
                return Ok(-1);
            }
            if gpo.proposed_schedule.producers == producers {
                return Ok(-1);
            }
        }

        let base = if header.prev_pending_schedule.schedule.producers.is_empty() {
            &header.active_schedule
        } else {
            &header.prev_pending_schedule.schedule
        };
        if base.producers == producers {
            return Ok(-1);
        }
        let version = base.version + 1;

        let schedule = ProducerAuthoritySchedule { version, producers };
        info!(
            version,
            producers = schedule.producers.len(),
            block_num = current_block_num,
            "[qc-17] producer schedule proposed"
        );
        self.db.modify::<GlobalPropertyObject>(&[], |gpo| {
            gpo.proposed_schedule_block_num = Some(current_block_num);
            gpo.proposed_schedule = schedule;
        })?;
        Ok(i64::from(version))
    }
}
