//! Transaction timeout task

use std::sync::Weak;

use async_trait::async_trait;
use tracing::debug;

use super::{Transaction, TransactionCoordinator};
use crate::error::TmError;
use crate::manager::InFlight;
use crate::scheduler::Task;

/// Rolls a transaction back when its deadline passes while it is still active
pub(crate) struct TransactionTimeoutTask {
    pub tx: Weak<Transaction>,
    pub coordinator: Weak<TransactionCoordinator>,
    pub in_flight: Weak<InFlight>,
}

#[async_trait]
impl Task for TransactionTimeoutTask {
    fn describe(&self) -> String {
        match self.tx.upgrade() {
            Some(tx) => format!("timeout of transaction {}", tx.gtrid()),
            None => "timeout of a finished transaction".to_string(),
        }
    }

    async fn execute(&self) -> Result<(), TmError> {
        let (Some(tx), Some(coordinator)) = (self.tx.upgrade(), self.coordinator.upgrade()) else {
            return Ok(());
        };
        // Both phases are over once the timeout rolled it back
        if coordinator.time_out(&tx).await
            && let Some(in_flight) = self.in_flight.upgrade()
            && in_flight.remove(&tx.gtrid()).is_some()
        {
            debug!(gtrid = %tx.gtrid(), "Timed-out transaction no longer in flight");
        }
        Ok(())
    }
}
