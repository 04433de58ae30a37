//! Wall-clock deadline threaded into every execution entry point.

use crate::error::{ChainError, ChainResult};
use shared_types::{Microseconds, TimePoint};

/// Deadline of one transaction: the earlier of the block deadline and the
/// transaction's own time budget (plus any subjective leeway).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionDeadline {
    pub start: TimePoint,
    pub block_deadline: TimePoint,
    pub max_transaction_time: Microseconds,
    pub leeway: Microseconds,
}

impl TransactionDeadline {
    pub fn new(
        start: TimePoint,
        block_deadline: TimePoint,
        max_transaction_time: Microseconds,
        leeway: Microseconds,
    ) -> Self {
        Self {
            start,
            block_deadline,
            max_transaction_time,
            leeway,
        }
    }

    /// A deadline that never fires.
    pub fn unlimited(start: TimePoint) -> Self {
        Self::new(start, TimePoint::maximum(), Microseconds::MAX, Microseconds(0))
    }

    pub fn deadline(&self) -> TimePoint {
        let own = self.start.add(self.max_transaction_time).add(self.leeway);
        own.min(self.block_deadline)
    }

    pub fn is_infinite(&self) -> bool {
        self.deadline() == TimePoint::maximum()
    }

    /// Fail when `now` is past the deadline, naming which limit fired.
    pub fn checktime(&self, now: TimePoint) -> ChainResult<()> {
        let deadline = self.deadline();
        if now <= deadline {
            return Ok(());
        }
        let over = now.since(deadline).count();
        if now > self.block_deadline {
            return Err(ChainError::DeadlineExceeded(format!(
                "block deadline exceeded by {over}us"
            )));
        }
        if self.leeway.count() > 0 && now > self.start.add(self.max_transaction_time) {
            return Err(ChainError::LeewayDeadline(format!(
                "transaction ran {over}us past its leeway"
            )));
        }
        Err(ChainError::TxCpuUsageExceeded(format!(
            "transaction was executing for too long, {over}us over its limit"
        )))
    }
}
