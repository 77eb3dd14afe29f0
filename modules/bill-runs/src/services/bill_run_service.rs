//! Bill run orchestration
//!
//! Owns the run-level lifecycle: creating runs behind the busy check,
//! processing every billing period of a run, cancellation, and the hand-off
//! to sending. Every status change is a compare-and-set through
//! [`BillRunStatus::transition`].

use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use super::billing_period_processor::{BillingPeriodProcessor, ProcessError};
use super::busy_checker::{BillRunBusyChecker, BusyStatus};
use crate::gateway::ChargeSubmissionGateway;
use crate::metrics::Metrics;
use crate::models::{
    BatchType, BillRun, BillRunErrorCode, BillingPeriod, NewBillRun, Scheme,
};
use crate::repos::{BillingRepository, RepoError};
use crate::run_log::RunLog;
use crate::state_machine::{BillRunStatus, TransitionError};

/// First financial year billed under the current scheme
pub const SROC_FIRST_FINANCIAL_YEAR_ENDING: i32 = 2023;

/// Financial years a supplementary run looks back over, including its own
pub const SUPPLEMENTARY_YEARS: i32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum BillRunError {
    #[error("Another bill run is in progress ({0})")]
    Busy(BusyStatus),

    #[error("Bill run not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid bill run request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Bill run {id} is no longer {expected}")]
    StaleStatus { id: Uuid, expected: BillRunStatus },

    #[error("Bill run processing failed: {0}")]
    Processing(#[from] ProcessError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),
}

/// Billing periods a run covers, newest first
///
/// Annual and two-part tariff runs bill their own financial year;
/// supplementary runs look back up to six years. Years outside the run's
/// scheme are dropped.
pub fn billing_periods(
    scheme: Scheme,
    batch_type: BatchType,
    to_financial_year_ending: i32,
) -> Vec<BillingPeriod> {
    let years = match batch_type {
        BatchType::Annual | BatchType::TwoPartTariff => 1,
        BatchType::Supplementary => SUPPLEMENTARY_YEARS,
    };

    (0..years)
        .map(|offset| to_financial_year_ending - offset)
        .filter(|&year| match scheme {
            Scheme::Sroc => year >= SROC_FIRST_FINANCIAL_YEAR_ENDING,
            Scheme::Presroc => year < SROC_FIRST_FINANCIAL_YEAR_ENDING,
        })
        .filter_map(BillingPeriod::for_financial_year_ending)
        .collect()
}

#[derive(Clone)]
pub struct BillRunService {
    repo: Arc<dyn BillingRepository>,
    busy_checker: BillRunBusyChecker,
    processor: BillingPeriodProcessor,
    metrics: Metrics,
}

impl BillRunService {
    pub fn new(
        repo: Arc<dyn BillingRepository>,
        gateway: Arc<dyn ChargeSubmissionGateway>,
        submission_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            busy_checker: BillRunBusyChecker::new(repo.clone()),
            processor: BillingPeriodProcessor::new(
                repo.clone(),
                gateway,
                submission_timeout,
                metrics.clone(),
            ),
            repo,
            metrics,
        }
    }

    /// Queue a new bill run unless another run is building or cancelling
    pub async fn create_bill_run(&self, new_bill_run: &NewBillRun) -> Result<BillRun, BillRunError> {
        let busy = self.busy_checker.status().await?;
        if busy.is_busy() {
            tracing::warn!(busy = %busy, "Bill run refused, another run is in progress");
            return Err(BillRunError::Busy(busy));
        }

        if billing_periods(
            new_bill_run.scheme,
            new_bill_run.batch_type,
            new_bill_run.to_financial_year_ending,
        )
        .is_empty()
        {
            return Err(BillRunError::InvalidRequest(format!(
                "{} has no financial years up to {}",
                new_bill_run.scheme.as_str(),
                new_bill_run.to_financial_year_ending
            )));
        }

        let bill_run = self.repo.create_bill_run(new_bill_run).await?;

        tracing::info!(
            bill_run_id = %bill_run.id,
            region_id = %bill_run.region_id,
            scheme = bill_run.scheme.as_str(),
            batch_type = bill_run.batch_type.as_str(),
            to_financial_year_ending = bill_run.to_financial_year_ending,
            "Bill run queued"
        );

        Ok(bill_run)
    }

    /// Process a queued run, or generate a reviewed two-part tariff run.
    /// Returns the status the run was left in.
    ///
    /// A queued two-part tariff run moves to review when its review has
    /// been staged and to empty otherwise; it is generated once it comes
    /// back from review.
    pub async fn process_bill_run(&self, bill_run_id: Uuid) -> Result<BillRunStatus, BillRunError> {
        let bill_run = self.load(bill_run_id).await?;
        let run_log = RunLog::new(&bill_run);

        self.run(bill_run, &run_log)
            .instrument(run_log.span().clone())
            .await
    }

    async fn run(&self, bill_run: BillRun, run_log: &RunLog) -> Result<BillRunStatus, BillRunError> {
        let started_from = bill_run.status;
        self.transition(&bill_run, started_from, BillRunStatus::Processing, None)
            .await?;
        tracing::info!(from = %started_from, "Bill run processing started");

        if bill_run.batch_type == BatchType::TwoPartTariff && started_from == BillRunStatus::Queued {
            let staged = self.repo.count_review_licences(bill_run.id).await?;
            let next = if staged > 0 {
                BillRunStatus::Review
            } else {
                BillRunStatus::Empty
            };
            return self.finish(&bill_run, next, run_log).await;
        }

        let mut produced = false;
        for billing_period in billing_periods(
            bill_run.scheme,
            bill_run.batch_type,
            bill_run.to_financial_year_ending,
        ) {
            let current = self.load(bill_run.id).await?;
            if current.status != BillRunStatus::Processing {
                tracing::info!(
                    status = %current.status,
                    financial_year_ending = billing_period.financial_year_ending(),
                    "Bill run no longer processing, stopping"
                );
                self.record_outcome(&bill_run, "cancelled", run_log);
                return Ok(current.status);
            }

            let billing_accounts = match self
                .repo
                .fetch_billing_accounts(&bill_run, &billing_period)
                .await
            {
                Ok(accounts) => accounts,
                Err(e) => {
                    self.fail(&bill_run, BillRunErrorCode::FailedToPopulateChargeVersions, &e, run_log)
                        .await?;
                    return Err(e.into());
                }
            };

            match self
                .processor
                .process(&bill_run, &billing_period, &billing_accounts, run_log)
                .await
            {
                Ok(period_produced) => produced |= period_produced,
                Err(ProcessError::NoLongerProcessing(_)) => {
                    let current = self.load(bill_run.id).await?;
                    tracing::info!(
                        status = %current.status,
                        financial_year_ending = billing_period.financial_year_ending(),
                        "Bill run left processing during the period, output discarded"
                    );
                    self.record_outcome(&bill_run, "cancelled", run_log);
                    return Ok(current.status);
                }
                Err(e) => {
                    self.fail(&bill_run, e.error_code(), &e, run_log).await?;
                    return Err(e.into());
                }
            }
        }

        if bill_run.batch_type == BatchType::Supplementary {
            let unflagged = self.repo.unflag_unbilled_licences(&bill_run).await?;
            tracing::debug!(unflagged, "Cleared flags of licences with nothing to bill");
        }

        let next = if produced {
            BillRunStatus::Ready
        } else {
            BillRunStatus::Empty
        };
        self.finish(&bill_run, next, run_log).await
    }

    async fn finish(
        &self,
        bill_run: &BillRun,
        next: BillRunStatus,
        run_log: &RunLog,
    ) -> Result<BillRunStatus, BillRunError> {
        if next == BillRunStatus::Review {
            self.transition(bill_run, BillRunStatus::Processing, next, None)
                .await?;
        } else {
            // Review staging rows are only needed while the run is in review
            let transition = BillRunStatus::Processing.transition(next)?;
            if !self
                .repo
                .complete_bill_run(bill_run.id, transition, None)
                .await?
            {
                return Err(BillRunError::StaleStatus {
                    id: bill_run.id,
                    expected: BillRunStatus::Processing,
                });
            }
        }
        self.record_outcome(bill_run, next.as_str(), run_log);

        tracing::info!(
            status = %next,
            elapsed_ms = run_log.elapsed_ms() as u64,
            "Bill run processing finished"
        );

        Ok(next)
    }

    async fn fail(
        &self,
        bill_run: &BillRun,
        error_code: BillRunErrorCode,
        error: &(dyn std::error::Error + Send + Sync),
        run_log: &RunLog,
    ) -> Result<(), BillRunError> {
        tracing::error!(
            error_code = error_code.code(),
            error = %error,
            elapsed_ms = run_log.elapsed_ms() as u64,
            "Bill run failed"
        );
        self.record_outcome(bill_run, "error", run_log);
        self.transition(
            bill_run,
            BillRunStatus::Processing,
            BillRunStatus::Error,
            Some(error_code),
        )
        .await
    }

    fn record_outcome(&self, bill_run: &BillRun, outcome: &str, run_log: &RunLog) {
        let batch_type = bill_run.batch_type.as_str();
        self.metrics
            .bill_runs_total
            .with_label_values(&[batch_type, outcome])
            .inc();
        self.metrics
            .bill_run_duration_seconds
            .with_label_values(&[batch_type])
            .observe(run_log.elapsed().as_secs_f64());
    }

    /// Ask a queued or processing run to stop. Processing stops before its
    /// next billing period; [`finalize_cancelled`](Self::finalize_cancelled)
    /// clears what it produced.
    pub async fn request_cancel(&self, bill_run_id: Uuid) -> Result<(), BillRunError> {
        let bill_run = self.load(bill_run_id).await?;
        self.transition(&bill_run, bill_run.status, BillRunStatus::Cancel, None)
            .await?;

        tracing::info!(bill_run_id = %bill_run_id, from = %bill_run.status, "Bill run cancel requested");

        Ok(())
    }

    /// Delete the output of every cancelled run and empty it. Returns the
    /// number of runs finalized.
    pub async fn finalize_cancelled(&self) -> Result<usize, BillRunError> {
        let transition = BillRunStatus::Cancel.transition(BillRunStatus::Empty)?;
        let mut finalized = 0;

        for bill_run_id in self
            .repo
            .fetch_bill_run_ids_with_status(BillRunStatus::Cancel)
            .await?
        {
            if self
                .repo
                .delete_bill_run_output(bill_run_id, transition)
                .await?
            {
                finalized += 1;
                tracing::info!(bill_run_id = %bill_run_id, "Cancelled bill run emptied");
            } else {
                tracing::warn!(bill_run_id = %bill_run_id, "Cancelled bill run changed status, skipped");
            }
        }

        Ok(finalized)
    }

    pub async fn mark_sending(&self, bill_run_id: Uuid) -> Result<(), BillRunError> {
        let bill_run = self.load(bill_run_id).await?;
        self.transition(&bill_run, bill_run.status, BillRunStatus::Sending, None)
            .await?;

        tracing::info!(bill_run_id = %bill_run_id, "Bill run sending");

        Ok(())
    }

    /// Mark a sending run sent. Supplementary runs clear the supplementary
    /// billing flag of every licence they billed.
    pub async fn mark_sent(&self, bill_run_id: Uuid) -> Result<(), BillRunError> {
        let bill_run = self.load(bill_run_id).await?;
        self.transition(&bill_run, bill_run.status, BillRunStatus::Sent, None)
            .await?;

        let unflagged = if bill_run.batch_type == BatchType::Supplementary {
            self.repo.unflag_billed_licences(&bill_run).await?
        } else {
            0
        };

        tracing::info!(bill_run_id = %bill_run_id, unflagged, "Bill run sent");

        Ok(())
    }

    /// Ids of runs waiting to be processed, oldest first
    pub async fn queued_bill_run_ids(&self) -> Result<Vec<Uuid>, BillRunError> {
        Ok(self
            .repo
            .fetch_bill_run_ids_with_status(BillRunStatus::Queued)
            .await?)
    }

    async fn load(&self, bill_run_id: Uuid) -> Result<BillRun, BillRunError> {
        self.repo
            .fetch_bill_run(bill_run_id)
            .await?
            .ok_or(BillRunError::NotFound(bill_run_id))
    }

    async fn transition(
        &self,
        bill_run: &BillRun,
        from: BillRunStatus,
        to: BillRunStatus,
        error_code: Option<BillRunErrorCode>,
    ) -> Result<(), BillRunError> {
        let transition = from.transition(to)?;
        if self
            .repo
            .apply_status_transition(bill_run.id, transition, error_code)
            .await?
        {
            Ok(())
        } else {
            Err(BillRunError::StaleStatus {
                id: bill_run.id,
                expected: from,
            })
        }
    }
}
