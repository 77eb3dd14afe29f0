//! Two-part tariff review licence removal
//!
//! An operator reviewing a two-part tariff run can take a licence out of
//! it. The licence's staged review rows are deleted in dependency order and
//! the licence is flagged so the next two-part tariff run picks it up again,
//! all in one repository transaction. A run left without licences is
//! emptied.

use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::notifier::NotificationSink;
use crate::repos::{BillingRepository, RepoError, ReviewLicenceRemoval};
use crate::run_log::RunLog;
use crate::state_machine::{BillRunStatus, TransitionError};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("Bill run not found: {0}")]
    BillRunNotFound(Uuid),

    #[error("Bill run {bill_run_id} is {status}, not in review")]
    NotInReview {
        bill_run_id: Uuid,
        status: BillRunStatus,
    },

    #[error("Licence {licence_id} is not in the review of bill run {bill_run_id}")]
    ReviewLicenceNotFound { bill_run_id: Uuid, licence_id: Uuid },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Bill run {0} changed status during removal")]
    StaleStatus(Uuid),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),
}

#[derive(Clone)]
pub struct ReviewLicenceRemover {
    repo: Arc<dyn BillingRepository>,
    metrics: Metrics,
}

impl ReviewLicenceRemover {
    pub fn new(repo: Arc<dyn BillingRepository>, metrics: Metrics) -> Self {
        Self { repo, metrics }
    }

    /// Remove a licence from a run in review. Returns true when it was the
    /// last licence and the run is now empty; otherwise a banner naming the
    /// licence is sent to `notifier`.
    ///
    /// The review status is checked inside the removal transaction, so a
    /// run that leaves review concurrently keeps its staged rows.
    pub async fn remove(
        &self,
        bill_run_id: Uuid,
        licence_id: Uuid,
        notifier: &dyn NotificationSink,
        run_log: &RunLog,
    ) -> Result<bool, ReviewError> {
        self.remove_in_review(bill_run_id, licence_id, notifier, run_log)
            .instrument(run_log.span().clone())
            .await
    }

    async fn remove_in_review(
        &self,
        bill_run_id: Uuid,
        licence_id: Uuid,
        notifier: &dyn NotificationSink,
        run_log: &RunLog,
    ) -> Result<bool, ReviewError> {
        let (licence_ref, remaining) = match self
            .repo
            .remove_review_licence(bill_run_id, licence_id)
            .await?
        {
            ReviewLicenceRemoval::Removed {
                licence_ref,
                remaining,
            } => (licence_ref, remaining),
            ReviewLicenceRemoval::BillRunNotFound => {
                return Err(ReviewError::BillRunNotFound(bill_run_id))
            }
            ReviewLicenceRemoval::NotInReview(status) => {
                tracing::warn!(status = %status, "Review licence removal refused");
                return Err(ReviewError::NotInReview {
                    bill_run_id,
                    status,
                });
            }
            ReviewLicenceRemoval::LicenceNotInReview => {
                return Err(ReviewError::ReviewLicenceNotFound {
                    bill_run_id,
                    licence_id,
                })
            }
        };
        self.metrics.review_licences_removed_total.inc();

        tracing::info!(
            licence_ref = %licence_ref,
            remaining,
            elapsed_ms = run_log.elapsed_ms() as u64,
            "Removed licence from two-part tariff review"
        );

        if remaining > 0 {
            notifier.banner(&format!("Licence {licence_ref} removed from the bill run."));
            return Ok(false);
        }

        let transition = BillRunStatus::Review.transition(BillRunStatus::Empty)?;
        if !self
            .repo
            .apply_status_transition(bill_run_id, transition, None)
            .await?
        {
            return Err(ReviewError::StaleStatus(bill_run_id));
        }

        tracing::info!(
            elapsed_ms = run_log.elapsed_ms() as u64,
            "Last review licence removed, bill run is empty"
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AbstractionPeriod, BatchType, BillRun, ChargeElement, ChargeFactors, ChargeReference,
        ChargeVersion, Licence, Scheme,
    };
    use crate::notifier::CollectingNotifier;
    use crate::repos::{InMemoryBillingRepository, ReviewTable};
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;
    use std::collections::HashMap;

    fn review_run(status: BillRunStatus) -> BillRun {
        BillRun {
            id: Uuid::new_v4(),
            region_id: Uuid::new_v4(),
            scheme: Scheme::Sroc,
            batch_type: BatchType::TwoPartTariff,
            status,
            to_financial_year_ending: 2024,
            error_code: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn charge_version(licence_ref: &str) -> ChargeVersion {
        ChargeVersion {
            id: Uuid::new_v4(),
            scheme: Scheme::Sroc,
            start_date: NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
            end_date: None,
            licence: Licence {
                id: Uuid::new_v4(),
                licence_ref: licence_ref.to_string(),
                region_id: Uuid::new_v4(),
                revoked_date: None,
                lapsed_date: None,
                expired_date: None,
                include_in_sroc_billing: false,
                include_in_presroc_billing: false,
                include_in_sroc_tpt_billing: false,
            },
            charge_references: vec![ChargeReference {
                id: Uuid::new_v4(),
                charge_category_code: "4.6.12".to_string(),
                description: "High loss".to_string(),
                factors: ChargeFactors::default(),
                charge_elements: vec![ChargeElement {
                    id: Uuid::new_v4(),
                    description: "Spray irrigation".to_string(),
                    authorised_annual_quantity: Decimal::new(100, 0),
                    abstraction_period: AbstractionPeriod::ALL_YEAR,
                    annual_charge: 1000,
                }],
            }],
            reviewed_allocation: None,
        }
    }

    fn remover(repo: &InMemoryBillingRepository) -> ReviewLicenceRemover {
        ReviewLicenceRemover::new(Arc::new(repo.clone()), Metrics::new())
    }

    #[tokio::test]
    async fn test_removing_last_licence_empties_run_silently() {
        let repo = InMemoryBillingRepository::new();
        let run = review_run(BillRunStatus::Review);
        repo.insert_bill_run(run.clone());
        let cv = charge_version("01/123");
        repo.seed_review_licence(run.id, &cv, &HashMap::new());
        let notifier = CollectingNotifier::new();

        let emptied = remover(&repo)
            .remove(run.id, cv.licence.id, &notifier, &RunLog::new(&run))
            .await
            .unwrap();

        assert!(emptied);
        assert_eq!(repo.bill_run(run.id).unwrap().status, BillRunStatus::Empty);
        assert!(notifier.messages().is_empty());
        assert!(repo.review_row_counts().values().all(|&n| n == 0));
        assert!(repo.licence(cv.licence.id).unwrap().include_in_sroc_tpt_billing);
    }

    #[tokio::test]
    async fn test_removing_one_of_several_sends_banner() {
        let repo = InMemoryBillingRepository::new();
        let run = review_run(BillRunStatus::Review);
        repo.insert_bill_run(run.clone());
        let first = charge_version("01/123");
        let second = charge_version("01/456");
        repo.seed_review_licence(run.id, &first, &HashMap::new());
        repo.seed_review_licence(run.id, &second, &HashMap::new());
        let notifier = CollectingNotifier::new();

        let emptied = remover(&repo)
            .remove(run.id, first.licence.id, &notifier, &RunLog::new(&run))
            .await
            .unwrap();

        assert!(!emptied);
        assert_eq!(repo.bill_run(run.id).unwrap().status, BillRunStatus::Review);
        assert_eq!(
            notifier.messages(),
            vec!["Licence 01/123 removed from the bill run.".to_string()]
        );
        assert!(repo.licence(first.licence.id).unwrap().include_in_sroc_tpt_billing);
        assert_eq!(repo.review_licence_ids(run.id), vec![second.licence.id]);
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back_everything() {
        let repo = InMemoryBillingRepository::new();
        let run = review_run(BillRunStatus::Review);
        repo.insert_bill_run(run.clone());
        let cv = charge_version("01/123");
        repo.seed_review_licence(run.id, &cv, &HashMap::new());
        let before = repo.review_row_counts();
        repo.fail_review_deletion_at(Some(ReviewTable::ChargeVersions));

        let err = remover(&repo)
            .remove(run.id, cv.licence.id, &CollectingNotifier::new(), &RunLog::new(&run))
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::Repository(_)));
        assert_eq!(repo.review_row_counts(), before);
        assert!(!repo.licence(cv.licence.id).unwrap().include_in_sroc_tpt_billing);
        assert_eq!(repo.bill_run(run.id).unwrap().status, BillRunStatus::Review);
    }

    #[tokio::test]
    async fn test_run_must_be_in_review() {
        let repo = InMemoryBillingRepository::new();
        let run = review_run(BillRunStatus::Ready);
        repo.insert_bill_run(run.clone());

        let err = remover(&repo)
            .remove(run.id, Uuid::new_v4(), &CollectingNotifier::new(), &RunLog::new(&run))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReviewError::NotInReview {
                status: BillRunStatus::Ready,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_licence_is_not_found() {
        let repo = InMemoryBillingRepository::new();
        let run = review_run(BillRunStatus::Review);
        repo.insert_bill_run(run.clone());

        let err = remover(&repo)
            .remove(run.id, Uuid::new_v4(), &CollectingNotifier::new(), &RunLog::new(&run))
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::ReviewLicenceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_run_that_left_review_keeps_staged_rows() {
        let repo = InMemoryBillingRepository::new();
        let run = review_run(BillRunStatus::Processing);
        repo.insert_bill_run(run.clone());
        let cv = charge_version("01/123");
        repo.seed_review_licence(run.id, &cv, &HashMap::new());
        let before = repo.review_row_counts();

        let err = remover(&repo)
            .remove(run.id, cv.licence.id, &CollectingNotifier::new(), &RunLog::new(&run))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReviewError::NotInReview {
                status: BillRunStatus::Processing,
                ..
            }
        ));
        assert_eq!(repo.review_row_counts(), before);
        assert_eq!(repo.review_licence_ids(run.id), vec![cv.licence.id]);
        assert!(!repo.licence(cv.licence.id).unwrap().include_in_sroc_tpt_billing);
    }

    #[tokio::test]
    async fn test_unknown_bill_run_is_not_found() {
        let repo = InMemoryBillingRepository::new();
        let run = review_run(BillRunStatus::Review);

        let err = remover(&repo)
            .remove(run.id, Uuid::new_v4(), &CollectingNotifier::new(), &RunLog::new(&run))
            .await
            .unwrap_err();

        assert!(matches!(err, ReviewError::BillRunNotFound(id) if id == run.id));
    }
}
