//! Persistence for the bill run engine
//!
//! The engine talks to storage only through [`BillingRepository`]. Two
//! implementations ship with the module:
//!
//! - **PgBillingRepository**: PostgreSQL, built from the per-table functions
//!   in the sibling modules
//! - **InMemoryBillingRepository**: tests and local runs without a database

pub mod bill_repo;
pub mod bill_run_repo;
pub mod billing_account_repo;
pub mod licence_repo;
pub mod memory;
pub mod postgres;
pub mod review_repo;
pub mod transaction_repo;

pub use memory::InMemoryBillingRepository;
pub use postgres::PgBillingRepository;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    BillRun, BillRunErrorCode, BillingAccount, BillingPeriod, BillingPeriodOutput, NewBillRun,
    Scheme, Transaction,
};
use crate::state_machine::{BillRunStatus, StatusTransition};

/// Errors raised by repository implementations
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Referential integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Invalid stored value: {0}")]
    InvalidData(String),

    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Whether any bill run is building and whether any is cancelling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusyFlags {
    pub building: bool,
    pub cancelling: bool,
}

/// Key for the previously sent transactions of one licence on one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousTransactionQuery {
    pub billing_account_id: Uuid,
    pub licence_id: Uuid,
    pub financial_year_ending: i32,
    pub scheme: Scheme,
    pub two_part_tariff: bool,
}

/// Outcome of removing one licence from a two-part tariff review
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewLicenceRemoval {
    Removed { licence_ref: String, remaining: i64 },
    BillRunNotFound,
    NotInReview(BillRunStatus),
    LicenceNotInReview,
}

/// Review staging tables, in the order rows must be deleted when a licence
/// is removed from a two-part tariff review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviewTable {
    ChargeElementReturns,
    ChargeElements,
    ChargeReferences,
    ChargeVersions,
    Returns,
    Licences,
}

/// Deepest dependants first; each table only references tables later in the
/// list
pub const REVIEW_LICENCE_DELETION_STEPS: [ReviewTable; 6] = [
    ReviewTable::ChargeElementReturns,
    ReviewTable::ChargeElements,
    ReviewTable::ChargeReferences,
    ReviewTable::ChargeVersions,
    ReviewTable::Returns,
    ReviewTable::Licences,
];

impl ReviewTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            ReviewTable::ChargeElementReturns => "review_charge_element_returns",
            ReviewTable::ChargeElements => "review_charge_elements",
            ReviewTable::ChargeReferences => "review_charge_references",
            ReviewTable::ChargeVersions => "review_charge_versions",
            ReviewTable::Returns => "review_returns",
            ReviewTable::Licences => "review_licences",
        }
    }
}

/// Storage contract for the bill run engine
#[async_trait]
pub trait BillingRepository: Send + Sync {
    /// Building = any run queued, processing or sending; cancelling = any run
    /// in cancel
    async fn fetch_busy_flags(&self) -> RepoResult<BusyFlags>;

    async fn create_bill_run(&self, new_bill_run: &NewBillRun) -> RepoResult<BillRun>;

    async fn fetch_bill_run(&self, bill_run_id: Uuid) -> RepoResult<Option<BillRun>>;

    /// Oldest first
    async fn fetch_bill_run_ids_with_status(&self, status: BillRunStatus) -> RepoResult<Vec<Uuid>>;

    /// Apply a validated status change if the run is still in
    /// `transition.from()`. Returns false when the stored status differs.
    async fn apply_status_transition(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
        error_code: Option<BillRunErrorCode>,
    ) -> RepoResult<bool>;

    /// Billing accounts with the charge versions relevant to the run for one
    /// billing period. Two-part tariff runs attach reviewed allocations.
    async fn fetch_billing_accounts(
        &self,
        bill_run: &BillRun,
        billing_period: &BillingPeriod,
    ) -> RepoResult<Vec<BillingAccount>>;

    /// Transactions from `sent` bill runs only
    async fn fetch_previous_sent_transactions(
        &self,
        query: &PreviousTransactionQuery,
    ) -> RepoResult<Vec<Transaction>>;

    /// Bills, then bill licences, then transactions, atomically. The run row
    /// is locked first; nothing is written and false is returned unless the
    /// run is still processing.
    async fn persist_billing_period(
        &self,
        bill_run_id: Uuid,
        output: &BillingPeriodOutput,
    ) -> RepoResult<bool>;

    /// Apply `transition` and delete the run's review staging rows in
    /// [`REVIEW_LICENCE_DELETION_STEPS`] order, atomically. Returns false,
    /// deleting nothing, if the run is no longer in `transition.from()`.
    async fn complete_bill_run(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
        error_code: Option<BillRunErrorCode>,
    ) -> RepoResult<bool>;

    /// Remove every bill, bill licence, transaction and review row of a run
    /// and apply `transition`, atomically. Nothing is deleted and false is
    /// returned if the run is no longer in `transition.from()`.
    async fn delete_bill_run_output(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
    ) -> RepoResult<bool>;

    /// Lock the run, require `review`, run [`REVIEW_LICENCE_DELETION_STEPS`]
    /// for one licence and flag it for two-part tariff billing, atomically.
    async fn remove_review_licence(
        &self,
        bill_run_id: Uuid,
        licence_id: Uuid,
    ) -> RepoResult<ReviewLicenceRemoval>;

    async fn count_review_licences(&self, bill_run_id: Uuid) -> RepoResult<i64>;

    /// Clear the scheme's supplementary flag on every licence billed in the
    /// run. Returns the number of licences changed.
    async fn unflag_billed_licences(&self, bill_run: &BillRun) -> RepoResult<u64>;

    /// Clear the scheme's supplementary flag on licences in the run's region
    /// that were flagged before the run was created but got no bill licence.
    /// Returns the number of licences changed.
    async fn unflag_unbilled_licences(&self, bill_run: &BillRun) -> RepoResult<u64>;
}
