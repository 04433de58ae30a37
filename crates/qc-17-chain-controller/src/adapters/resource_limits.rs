//! Resource accounting that never limits anything but still tracks ram.

use crate::error::ChainResult;
use crate::ports::{ElasticLimitParameters, ResourceLimits};
use parking_lot::Mutex;
use qc_04_versioned_state::Database;
use shared_types::Name;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct UnlimitedResources {
    ram_usage: Mutex<HashMap<Name, i64>>,
    last_block: Mutex<Option<u32>>,
}

impl UnlimitedResources {
    /// Last block whose usage was processed.
    pub fn last_processed_block(&self) -> Option<u32> {
        *self.last_block.lock()
    }
}

impl ResourceLimits for UnlimitedResources {
    fn process_account_limit_updates(&self, _db: &Database) -> ChainResult<()> {
        Ok(())
    }

    fn set_block_parameters(
        &self,
        _db: &Database,
        _cpu: ElasticLimitParameters,
        _net: ElasticLimitParameters,
    ) -> ChainResult<()> {
        Ok(())
    }

    fn process_block_usage(&self, _db: &Database, block_num: u32) -> ChainResult<()> {
        *self.last_block.lock() = Some(block_num);
        Ok(())
    }

    fn add_pending_ram_usage(&self, _db: &Database, account: &Name, delta: i64) -> ChainResult<()> {
        *self.ram_usage.lock().entry(account.clone()).or_default() += delta;
        Ok(())
    }

    fn get_account_ram_usage(&self, _db: &Database, account: &Name) -> i64 {
        self.ram_usage.lock().get(account).copied().unwrap_or(0)
    }
}
