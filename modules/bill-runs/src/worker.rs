//! Bill run worker
//!
//! Polls the repository on a fixed interval. Each tick first empties
//! cancelled runs, then processes queued runs one at a time, oldest first.

use std::time::Duration;

use crate::services::{BillRunError, BillRunService};

/// Outcome of one poll
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub finalized: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Run one poll cycle
///
/// A failing run is logged and counted; it does not stop the others.
pub async fn poll_once(service: &BillRunService) -> Result<PollSummary, BillRunError> {
    let mut summary = PollSummary {
        finalized: service.finalize_cancelled().await?,
        ..PollSummary::default()
    };

    for bill_run_id in service.queued_bill_run_ids().await? {
        match service.process_bill_run(bill_run_id).await {
            Ok(status) => {
                summary.processed += 1;
                tracing::info!(bill_run_id = %bill_run_id, status = %status, "Bill run processed");
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(bill_run_id = %bill_run_id, error = %e, "Bill run processing failed");
            }
        }
    }

    Ok(summary)
}

/// Start the worker task
pub fn start_bill_run_worker(service: BillRunService, poll_interval: Duration) {
    tokio::spawn(async move {
        tracing::info!(poll_interval_secs = poll_interval.as_secs(), "Starting bill run worker");

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match poll_once(&service).await {
                Ok(summary) if summary != PollSummary::default() => {
                    tracing::info!(
                        finalized = summary.finalized,
                        processed = summary.processed,
                        failed = summary.failed,
                        "Bill run poll complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Bill run poll failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StubChargeGateway;
    use crate::metrics::Metrics;
    use crate::models::{BatchType, NewBillRun, Scheme};
    use crate::repos::InMemoryBillingRepository;
    use crate::state_machine::BillRunStatus;
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_poll_processes_queued_runs() {
        let repo = InMemoryBillingRepository::new();
        let service = BillRunService::new(
            Arc::new(repo.clone()),
            Arc::new(StubChargeGateway::new()),
            Duration::from_secs(5),
            Metrics::new(),
        );
        let bill_run = service
            .create_bill_run(&NewBillRun {
                region_id: Uuid::new_v4(),
                scheme: Scheme::Sroc,
                batch_type: BatchType::Annual,
                to_financial_year_ending: 2024,
            })
            .await
            .unwrap();

        let summary = poll_once(&service).await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(repo.bill_run(bill_run.id).unwrap().status, BillRunStatus::Empty);
        assert_eq!(poll_once(&service).await.unwrap(), PollSummary::default());
    }
}
