//! # Controller Signals
//!
//! Observers register closures per event kind. Emission is synchronous on
//! the calling thread. A failing or panicking observer is logged and
//! skipped; only fatal errors (out of memory) propagate back into the
//! controller.

use crate::domain::{BlockState, TransactionMetadata, TransactionTrace};
use crate::error::ChainResult;
use parking_lot::RwLock;
use shared_types::{BlockId, PackedTransaction, SignedBlock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

type Slot<T> = Box<dyn Fn(&T) -> ChainResult<()> + Send + Sync>;

/// Ordered list of observers for one event kind.
pub struct Signal<T> {
    name: &'static str,
    slots: RwLock<Vec<Slot<T>>>,
}

impl<T> Signal<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn connect(&self, slot: impl Fn(&T) -> ChainResult<()> + Send + Sync + 'static) {
        self.slots.write().push(Box::new(slot));
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every observer in registration order.
    pub fn emit(&self, arg: &T) -> ChainResult<()> {
        let slots = self.slots.read();
        for (index, slot) in slots.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| slot(arg))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_fatal() => return Err(e),
                Ok(Err(e)) => {
                    warn!(signal = self.name, slot = index, error = %e, "[qc-17] signal handler failed");
                }
                Err(_) => {
                    warn!(signal = self.name, slot = index, "[qc-17] signal handler panicked");
                }
            }
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("slots", &self.len())
            .finish()
    }
}

/// A block about to be applied, with its id.
pub type PreAcceptedBlock = (Arc<SignedBlock>, BlockId);

/// Trace of an applied transaction and the transaction itself.
pub type AppliedTransaction = (Arc<TransactionTrace>, Arc<PackedTransaction>);

/// Every signal the controller emits.
#[derive(Debug)]
pub struct ChainSignals {
    /// Block number of a block being started.
    pub block_start: Signal<u32>,
    pub pre_accepted_block: Signal<PreAcceptedBlock>,
    pub accepted_block_header: Signal<Arc<BlockState>>,
    pub accepted_block: Signal<Arc<BlockState>>,
    pub irreversible_block: Signal<Arc<BlockState>>,
    pub accepted_transaction: Signal<Arc<TransactionMetadata>>,
    pub applied_transaction: Signal<AppliedTransaction>,
}

impl Default for ChainSignals {
    fn default() -> Self {
        Self {
            block_start: Signal::new("block_start"),
            pre_accepted_block: Signal::new("pre_accepted_block"),
            accepted_block_header: Signal::new("accepted_block_header"),
            accepted_block: Signal::new("accepted_block"),
            irreversible_block: Signal::new("irreversible_block"),
            accepted_transaction: Signal::new("accepted_transaction"),
            applied_transaction: Signal::new("applied_transaction"),
        }
    }
}
