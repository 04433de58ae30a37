//! One-time state migrations run in the block a builtin feature activates.

use super::protocol_features::BuiltinProtocolFeature;
use super::state_objects::{
    AccountRamCorrectionObject, GeneratedTransactionObject, ProtocolStateObject,
};
use crate::error::{ChainError, ChainResult};
use crate::ports::ResourceLimits;
use qc_04_versioned_state::Database;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What an activation handler may touch.
pub struct ActivationContext<'a> {
    pub db: &'a Database,
    pub resource_limits: &'a dyn ResourceLimits,
}

pub type ActivationHandler = Box<dyn Fn(&ActivationContext<'_>) -> ChainResult<()> + Send + Sync>;

/// Dispatch table from builtin feature to its migration.
#[derive(Default)]
pub struct ActivationHandlers {
    handlers: HashMap<BuiltinProtocolFeature, ActivationHandler>,
}

impl std::fmt::Debug for ActivationHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut features: Vec<_> = self.handlers.keys().map(|k| k.codename()).collect();
        features.sort_unstable();
        f.debug_struct("ActivationHandlers")
            .field("features", &features)
            .finish()
    }
}

impl ActivationHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for every builtin that migrates state.
    pub fn with_builtin_handlers() -> Self {
        use BuiltinProtocolFeature::*;

        let mut handlers = Self::new();
        let intrinsics: &[(BuiltinProtocolFeature, &'static [&'static str])] = &[
            (PreactivateFeature, &["preactivate_feature", "is_feature_activated"]),
            (GetSender, &["get_sender"]),
            (WtmsigBlockSignatures, &["set_proposed_producers_ex"]),
            (ActionReturnValue, &["set_action_return_value"]),
            (ConfigurableWasmLimits, &["set_wasm_parameters_packed", "get_wasm_parameters_packed"]),
            (BlockchainParameters, &["get_parameters_packed", "set_parameters_packed"]),
            (GetCodeHash, &["get_code_hash"]),
            (GetBlockNum, &["get_block_num"]),
            (
                CryptoPrimitives,
                &["alt_bn128_add", "alt_bn128_mul", "alt_bn128_pair", "mod_exp", "blake2_f", "sha3", "k1_recover"],
            ),
            (BlsPrimitives, &["bls_g1_add", "bls_g2_add", "bls_pairing", "bls_fp_mod"]),
        ];
        for (feature, names) in intrinsics {
            let names: &'static [&'static str] = *names;
            handlers.insert(*feature, Box::new(move |ctx| add_intrinsics(ctx, names)));
        }

        handlers.insert(WebauthnKey, Box::new(|ctx| add_key_type(ctx, 3)));
        handlers.insert(EmKey, Box::new(|ctx| add_key_type(ctx, 4)));
        handlers.insert(EdKey, Box::new(|ctx| add_key_type(ctx, 5)));
        handlers.insert(ReplaceDeferred, Box::new(apply_ram_corrections));
        handlers.insert(DisableDeferredTrxsStage2, Box::new(purge_generated_transactions));
        handlers
    }

    fn insert(&mut self, feature: BuiltinProtocolFeature, handler: ActivationHandler) {
        self.handlers.insert(feature, handler);
    }

    /// Register a handler; each feature has at most one.
    pub fn set(&mut self, feature: BuiltinProtocolFeature, handler: ActivationHandler) -> ChainResult<()> {
        if self.handlers.contains_key(&feature) {
            return Err(ChainError::ProtocolFeature(format!(
                "activation handler for {} already set",
                feature.codename()
            )));
        }
        self.insert(feature, handler);
        Ok(())
    }

    pub fn has_handler(&self, feature: BuiltinProtocolFeature) -> bool {
        self.handlers.contains_key(&feature)
    }

    /// Run the migration for `feature`, if it has one.
    pub fn trigger(&self, feature: BuiltinProtocolFeature, ctx: &ActivationContext<'_>) -> ChainResult<()> {
        match self.handlers.get(&feature) {
            Some(handler) => {
                debug!(feature = feature.codename(), "[qc-17] running activation handler");
                handler(ctx)
            }
            None => Ok(()),
        }
    }
}

fn add_intrinsics(ctx: &ActivationContext<'_>, names: &[&str]) -> ChainResult<()> {
    ctx.db.modify::<ProtocolStateObject>(&[], |pso| {
        pso.whitelisted_intrinsics
            .extend(names.iter().map(|n| n.to_string()));
    })?;
    Ok(())
}

fn add_key_type(ctx: &ActivationContext<'_>, num_supported: u8) -> ChainResult<()> {
    ctx.db.modify::<ProtocolStateObject>(&[], |pso| {
        pso.num_supported_key_types = pso.num_supported_key_types.max(num_supported);
    })?;
    Ok(())
}

/// Give back ram over-billed before deferred replacement semantics.
fn apply_ram_corrections(ctx: &ActivationContext<'_>) -> ChainResult<()> {
    for correction in ctx.db.all::<AccountRamCorrectionObject>()? {
        let current = ctx.resource_limits.get_account_ram_usage(ctx.db, &correction.name);
        let mut delta = -i64::try_from(correction.ram_correction).unwrap_or(i64::MAX);
        if correction.ram_correction > current.max(0) as u64 {
            warn!(
                account = %correction.name,
                correction = correction.ram_correction,
                usage = current,
                "[qc-17] ram correction exceeds usage, correcting to zero"
            );
            delta = -current;
        }
        ctx.resource_limits
            .add_pending_ram_usage(ctx.db, &correction.name, delta)?;
        ctx.db
            .remove::<AccountRamCorrectionObject>(correction.name.as_str().as_bytes())?;
    }
    Ok(())
}

/// Drop every remaining generated transaction and refund its payer.
fn purge_generated_transactions(ctx: &ActivationContext<'_>) -> ChainResult<()> {
    let generated = ctx.db.all::<GeneratedTransactionObject>()?;
    let count = generated.len();
    for gto in generated {
        ctx.resource_limits
            .add_pending_ram_usage(ctx.db, &gto.payer, -gto.billable_size())?;
        ctx.db.remove::<GeneratedTransactionObject>(&gto.trx_id)?;
    }
    if count > 0 {
        info!(count, "[qc-17] purged generated transactions");
    }
    Ok(())
}
