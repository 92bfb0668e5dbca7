//! Background retry sweep for failed refunds.

use crate::services::metrics::SWEEP_RETRIES_TOTAL;
use crate::services::settlement::SettlementService;
use crate::services::store::Store;
use chrono::Utc;
use std::sync::Arc;
use taxfree_core::error::AppError;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct RetrySweep {
    store: Arc<dyn Store>,
    settlement: Arc<SettlementService>,
}

impl RetrySweep {
    pub fn new(store: Arc<dyn Store>, settlement: Arc<SettlementService>) -> Self {
        Self { store, settlement }
    }

    /// Retry every FAILED refund whose backoff elapsed and whose retry
    /// budget remains. Refunds are processed sequentially; one refund's
    /// failure never aborts the sweep for the others. The conditional
    /// claim inside `process_refund` makes a concurrently running sweep
    /// skip refunds this one already picked up.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepOutcome, AppError> {
        let due = self.store.refunds_due_for_retry(Utc::now()).await?;
        let mut outcome = SweepOutcome {
            attempted: due.len(),
            ..Default::default()
        };

        for refund in due {
            match self.settlement.process_refund(refund.refund_id).await {
                Ok(_) => {
                    outcome.succeeded += 1;
                    SWEEP_RETRIES_TOTAL.with_label_values(&["succeeded"]).inc();
                }
                Err(e) => {
                    outcome.failed += 1;
                    SWEEP_RETRIES_TOTAL.with_label_values(&["failed"]).inc();
                    warn!(
                        refund_id = %refund.refund_id,
                        error = %e,
                        "Sweep retry failed; continuing"
                    );
                }
            }
        }

        if outcome.attempted > 0 {
            info!(
                attempted = outcome.attempted,
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                "Retry sweep completed"
            );
        }
        Ok(outcome)
    }

    /// Run the sweep on a fixed interval until the task is aborted.
    pub async fn run(self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "Retry sweep iteration failed");
            }
        }
    }
}
