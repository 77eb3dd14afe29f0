//! PostgreSQL implementation of the BillingRepository trait

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::review_repo::ReviewScope;
use super::{
    bill_repo, bill_run_repo, billing_account_repo, licence_repo, review_repo, transaction_repo,
    BillingRepository, BusyFlags, PreviousTransactionQuery, RepoResult, ReviewLicenceRemoval,
    REVIEW_LICENCE_DELETION_STEPS,
};
use crate::models::{
    BillRun, BillRunErrorCode, BillingAccount, BillingPeriod, BillingPeriodOutput, NewBillRun,
    Transaction,
};
use crate::state_machine::{BillRunStatus, StatusTransition};

/// BillingRepository backed by a Postgres pool
#[derive(Clone)]
pub struct PgBillingRepository {
    pool: PgPool,
}

impl PgBillingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingRepository for PgBillingRepository {
    async fn fetch_busy_flags(&self) -> RepoResult<BusyFlags> {
        bill_run_repo::fetch_busy_flags(&self.pool).await
    }

    async fn create_bill_run(&self, new_bill_run: &NewBillRun) -> RepoResult<BillRun> {
        bill_run_repo::insert(&self.pool, new_bill_run).await
    }

    async fn fetch_bill_run(&self, bill_run_id: Uuid) -> RepoResult<Option<BillRun>> {
        bill_run_repo::find_by_id(&self.pool, bill_run_id).await
    }

    async fn fetch_bill_run_ids_with_status(&self, status: BillRunStatus) -> RepoResult<Vec<Uuid>> {
        bill_run_repo::ids_with_status(&self.pool, status).await
    }

    async fn apply_status_transition(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
        error_code: Option<BillRunErrorCode>,
    ) -> RepoResult<bool> {
        bill_run_repo::apply_transition(&self.pool, bill_run_id, transition, error_code).await
    }

    async fn fetch_billing_accounts(
        &self,
        bill_run: &BillRun,
        billing_period: &BillingPeriod,
    ) -> RepoResult<Vec<BillingAccount>> {
        billing_account_repo::fetch_for_billing_period(&self.pool, bill_run, billing_period).await
    }

    async fn fetch_previous_sent_transactions(
        &self,
        query: &PreviousTransactionQuery,
    ) -> RepoResult<Vec<Transaction>> {
        transaction_repo::fetch_previous_sent(&self.pool, query).await
    }

    async fn persist_billing_period(
        &self,
        bill_run_id: Uuid,
        output: &BillingPeriodOutput,
    ) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Holds off a cancel until the period is written, and refuses to
        // write into a run that was cancelled first
        let status = bill_run_repo::lock_status(&mut tx, bill_run_id).await?;
        if status != Some(BillRunStatus::Processing) {
            tx.rollback().await?;
            tracing::warn!(
                bill_run_id = %bill_run_id,
                status = ?status,
                "Bill run left processing; billing period output discarded"
            );
            return Ok(false);
        }

        bill_repo::insert_bills(&mut tx, &output.bills).await?;
        bill_repo::insert_bill_licences(&mut tx, &output.bill_licences).await?;
        transaction_repo::insert_transactions(&mut tx, &output.transactions).await?;

        tx.commit().await?;

        tracing::debug!(
            bills = output.bills.len(),
            bill_licences = output.bill_licences.len(),
            transactions = output.transactions.len(),
            "Persisted billing period output"
        );

        Ok(true)
    }

    async fn complete_bill_run(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
        error_code: Option<BillRunErrorCode>,
    ) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await?;

        if !bill_run_repo::apply_transition_tx(&mut tx, bill_run_id, transition, error_code).await?
        {
            tx.rollback().await?;
            return Ok(false);
        }

        let scope = ReviewScope::BillRun { bill_run_id };
        for table in REVIEW_LICENCE_DELETION_STEPS {
            review_repo::delete_step(&mut tx, table, &scope).await?;
        }

        tx.commit().await?;

        Ok(true)
    }

    async fn delete_bill_run_output(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
    ) -> RepoResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Status first: a run that moved on keeps its rows
        if !bill_run_repo::apply_transition_tx(&mut tx, bill_run_id, transition, None).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        bill_repo::delete_for_bill_run(&mut tx, bill_run_id).await?;

        let scope = ReviewScope::BillRun { bill_run_id };
        for table in REVIEW_LICENCE_DELETION_STEPS {
            review_repo::delete_step(&mut tx, table, &scope).await?;
        }

        tx.commit().await?;

        Ok(true)
    }

    async fn remove_review_licence(
        &self,
        bill_run_id: Uuid,
        licence_id: Uuid,
    ) -> RepoResult<ReviewLicenceRemoval> {
        let mut tx = self.pool.begin().await?;

        match bill_run_repo::lock_status(&mut tx, bill_run_id).await? {
            None => {
                tx.rollback().await?;
                return Ok(ReviewLicenceRemoval::BillRunNotFound);
            }
            Some(BillRunStatus::Review) => {}
            Some(status) => {
                tx.rollback().await?;
                return Ok(ReviewLicenceRemoval::NotInReview(status));
            }
        }

        if !review_repo::review_licence_exists(&mut tx, bill_run_id, licence_id).await? {
            tx.rollback().await?;
            return Ok(ReviewLicenceRemoval::LicenceNotInReview);
        }

        let scope = ReviewScope::Licence {
            bill_run_id,
            licence_id,
        };
        for table in REVIEW_LICENCE_DELETION_STEPS {
            let deleted = review_repo::delete_step(&mut tx, table, &scope).await?;
            tracing::debug!(
                bill_run_id = %bill_run_id,
                licence_id = %licence_id,
                table = table.table_name(),
                deleted,
                "Deleted review rows"
            );
        }

        let Some(licence_ref) =
            licence_repo::flag_for_two_part_tariff_billing(&mut tx, licence_id).await?
        else {
            tx.rollback().await?;
            return Ok(ReviewLicenceRemoval::LicenceNotInReview);
        };

        let remaining = review_repo::count_for_bill_run_tx(&mut tx, bill_run_id).await?;

        tx.commit().await?;

        Ok(ReviewLicenceRemoval::Removed {
            licence_ref,
            remaining,
        })
    }

    async fn count_review_licences(&self, bill_run_id: Uuid) -> RepoResult<i64> {
        review_repo::count_for_bill_run(&self.pool, bill_run_id).await
    }

    async fn unflag_billed_licences(&self, bill_run: &BillRun) -> RepoResult<u64> {
        licence_repo::unflag_billed_licences(&self.pool, bill_run.id, bill_run.scheme).await
    }

    async fn unflag_unbilled_licences(&self, bill_run: &BillRun) -> RepoResult<u64> {
        licence_repo::unflag_unbilled_licences(
            &self.pool,
            bill_run.id,
            bill_run.region_id,
            bill_run.scheme,
            bill_run.created_at,
        )
        .await
    }
}
