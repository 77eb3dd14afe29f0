//! In-memory implementation of the BillingRepository trait for tests and
//! local runs without a database
//!
//! Every write works on a snapshot of the state and only replaces it once
//! the whole operation succeeds, so a failed operation leaves nothing behind.
//! Foreign keys between the stored rows are checked after every step the way
//! Postgres would check them.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{
    BillingRepository, BusyFlags, PreviousTransactionQuery, RepoError, RepoResult,
    ReviewLicenceRemoval, ReviewTable, REVIEW_LICENCE_DELETION_STEPS,
};
use crate::models::{
    BatchType, Bill, BillLicence, BillRun, BillRunErrorCode, BillingAccount, BillingPeriod,
    BillingPeriodOutput, ChargeVersion, Licence, NewBillRun, ReviewedAllocation, Scheme,
    Transaction,
};
use crate::state_machine::{BillRunStatus, StatusTransition};

#[derive(Debug, Clone)]
struct ReviewLicenceRow {
    id: Uuid,
    bill_run_id: Uuid,
    licence_id: Uuid,
}

#[derive(Debug, Clone)]
struct ReviewChargeVersionRow {
    id: Uuid,
    review_licence_id: Uuid,
    charge_version_id: Uuid,
}

#[derive(Debug, Clone)]
struct ReviewChargeReferenceRow {
    id: Uuid,
    review_charge_version_id: Uuid,
}

#[derive(Debug, Clone)]
struct ReviewChargeElementRow {
    id: Uuid,
    review_charge_reference_id: Uuid,
    charge_element_id: Uuid,
    amended_allocated: Decimal,
}

#[derive(Debug, Clone)]
struct ReviewReturnRow {
    id: Uuid,
    review_licence_id: Uuid,
}

#[derive(Debug, Clone)]
struct ReviewChargeElementReturnRow {
    review_charge_element_id: Uuid,
    review_return_id: Uuid,
}

#[derive(Debug, Clone)]
struct StoredChargeVersion {
    billing_account_id: Uuid,
    charge_version: ChargeVersion,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    bill_runs: Vec<BillRun>,
    licences: HashMap<Uuid, Licence>,
    licence_updated_at: HashMap<Uuid, DateTime<Utc>>,
    billing_accounts: HashMap<Uuid, String>,
    charge_versions: Vec<StoredChargeVersion>,
    bills: Vec<Bill>,
    bill_licences: Vec<BillLicence>,
    transactions: Vec<Transaction>,
    review_licences: Vec<ReviewLicenceRow>,
    review_charge_versions: Vec<ReviewChargeVersionRow>,
    review_charge_references: Vec<ReviewChargeReferenceRow>,
    review_charge_elements: Vec<ReviewChargeElementRow>,
    review_returns: Vec<ReviewReturnRow>,
    review_charge_element_returns: Vec<ReviewChargeElementReturnRow>,
    fail_review_deletion_at: Option<ReviewTable>,
    fail_persist: bool,
}

/// Review licences a deletion applies to
#[derive(Debug, Clone, Copy)]
enum Scope {
    Licence { bill_run_id: Uuid, licence_id: Uuid },
    BillRun { bill_run_id: Uuid },
}

impl Scope {
    fn matches(&self, row: &ReviewLicenceRow) -> bool {
        match *self {
            Scope::Licence {
                bill_run_id,
                licence_id,
            } => row.bill_run_id == bill_run_id && row.licence_id == licence_id,
            Scope::BillRun { bill_run_id } => row.bill_run_id == bill_run_id,
        }
    }
}

impl MemoryState {
    fn bill_run_mut(&mut self, bill_run_id: Uuid) -> Option<&mut BillRun> {
        self.bill_runs.iter_mut().find(|r| r.id == bill_run_id)
    }

    fn apply_transition(
        &mut self,
        bill_run_id: Uuid,
        transition: StatusTransition,
        error_code: Option<BillRunErrorCode>,
    ) -> bool {
        match self.bill_run_mut(bill_run_id) {
            Some(bill_run) if bill_run.status == transition.from() => {
                bill_run.status = transition.to();
                if error_code.is_some() {
                    bill_run.error_code = error_code;
                }
                bill_run.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Delete the rows of one review table belonging to `scope`. Child rows
    /// are found through their parents, as a join-based DELETE would.
    fn delete_review_step(&mut self, table: ReviewTable, scope: Scope) {
        let licence_ids: HashSet<Uuid> = self
            .review_licences
            .iter()
            .filter(|r| scope.matches(r))
            .map(|r| r.id)
            .collect();
        let version_ids: HashSet<Uuid> = self
            .review_charge_versions
            .iter()
            .filter(|r| licence_ids.contains(&r.review_licence_id))
            .map(|r| r.id)
            .collect();
        let reference_ids: HashSet<Uuid> = self
            .review_charge_references
            .iter()
            .filter(|r| version_ids.contains(&r.review_charge_version_id))
            .map(|r| r.id)
            .collect();
        let element_ids: HashSet<Uuid> = self
            .review_charge_elements
            .iter()
            .filter(|r| reference_ids.contains(&r.review_charge_reference_id))
            .map(|r| r.id)
            .collect();
        let return_ids: HashSet<Uuid> = self
            .review_returns
            .iter()
            .filter(|r| licence_ids.contains(&r.review_licence_id))
            .map(|r| r.id)
            .collect();

        match table {
            ReviewTable::ChargeElementReturns => {
                self.review_charge_element_returns.retain(|r| {
                    !element_ids.contains(&r.review_charge_element_id)
                        && !return_ids.contains(&r.review_return_id)
                })
            }
            ReviewTable::ChargeElements => self
                .review_charge_elements
                .retain(|r| !element_ids.contains(&r.id)),
            ReviewTable::ChargeReferences => self
                .review_charge_references
                .retain(|r| !reference_ids.contains(&r.id)),
            ReviewTable::ChargeVersions => self
                .review_charge_versions
                .retain(|r| !version_ids.contains(&r.id)),
            ReviewTable::Returns => self.review_returns.retain(|r| !return_ids.contains(&r.id)),
            ReviewTable::Licences => self.review_licences.retain(|r| !scope.matches(r)),
        }
    }

    /// First dangling foreign key, if any
    fn integrity_violation(&self) -> Option<String> {
        let licence_ids: HashSet<Uuid> = self.review_licences.iter().map(|r| r.id).collect();
        let version_ids: HashSet<Uuid> = self.review_charge_versions.iter().map(|r| r.id).collect();
        let reference_ids: HashSet<Uuid> =
            self.review_charge_references.iter().map(|r| r.id).collect();
        let element_ids: HashSet<Uuid> = self.review_charge_elements.iter().map(|r| r.id).collect();
        let return_ids: HashSet<Uuid> = self.review_returns.iter().map(|r| r.id).collect();

        if let Some(row) = self.review_charge_element_returns.iter().find(|r| {
            !element_ids.contains(&r.review_charge_element_id)
                || !return_ids.contains(&r.review_return_id)
        }) {
            return Some(format!(
                "review_charge_element_returns references missing element {} or return {}",
                row.review_charge_element_id, row.review_return_id
            ));
        }
        if let Some(row) = self
            .review_charge_elements
            .iter()
            .find(|r| !reference_ids.contains(&r.review_charge_reference_id))
        {
            return Some(format!("review_charge_elements row {} has no parent reference", row.id));
        }
        if let Some(row) = self
            .review_charge_references
            .iter()
            .find(|r| !version_ids.contains(&r.review_charge_version_id))
        {
            return Some(format!("review_charge_references row {} has no parent version", row.id));
        }
        if let Some(row) = self
            .review_charge_versions
            .iter()
            .find(|r| !licence_ids.contains(&r.review_licence_id))
        {
            return Some(format!("review_charge_versions row {} has no parent licence", row.id));
        }
        if let Some(row) = self
            .review_returns
            .iter()
            .find(|r| !licence_ids.contains(&r.review_licence_id))
        {
            return Some(format!("review_returns row {} has no parent licence", row.id));
        }

        let bill_ids: HashSet<Uuid> = self.bills.iter().map(|b| b.id).collect();
        if let Some(row) = self
            .bill_licences
            .iter()
            .find(|bl| !bill_ids.contains(&bl.bill_id))
        {
            return Some(format!("bill_licences row {} references missing bill", row.id));
        }
        let bill_licence_ids: HashSet<Uuid> = self.bill_licences.iter().map(|bl| bl.id).collect();
        if let Some(row) = self
            .transactions
            .iter()
            .find(|t| !bill_licence_ids.contains(&t.bill_licence_id))
        {
            return Some(format!("transactions row {} references missing bill licence", row.id));
        }

        None
    }

    fn run_review_steps(&mut self, scope: Scope, steps: &[ReviewTable]) -> RepoResult<()> {
        for &table in steps {
            if self.fail_review_deletion_at == Some(table) {
                return Err(RepoError::Unavailable(format!(
                    "delete from {} failed",
                    table.table_name()
                )));
            }
            self.delete_review_step(table, scope);
            if let Some(violation) = self.integrity_violation() {
                return Err(RepoError::IntegrityViolation(violation));
            }
        }
        Ok(())
    }

    fn delete_bill_run_rows(&mut self, bill_run_id: Uuid) {
        let bill_ids: HashSet<Uuid> = self
            .bills
            .iter()
            .filter(|b| b.bill_run_id == bill_run_id)
            .map(|b| b.id)
            .collect();
        let bill_licence_ids: HashSet<Uuid> = self
            .bill_licences
            .iter()
            .filter(|bl| bill_ids.contains(&bl.bill_id))
            .map(|bl| bl.id)
            .collect();

        self.transactions
            .retain(|t| !bill_licence_ids.contains(&t.bill_licence_id));
        self.bill_licences.retain(|bl| !bill_ids.contains(&bl.bill_id));
        self.bills.retain(|b| !bill_ids.contains(&b.id));
    }

    fn store_licence(&mut self, licence: Licence) {
        self.licence_updated_at.insert(licence.id, Utc::now());
        self.licences.insert(licence.id, licence);
    }

    fn store_licence_if_missing(&mut self, licence: &Licence) {
        if !self.licences.contains_key(&licence.id) {
            self.store_licence(licence.clone());
        }
    }

    /// Whether the run's batch type picks up `licence`
    fn in_batch_scope(&self, bill_run: &BillRun, licence: &Licence) -> bool {
        match bill_run.batch_type {
            BatchType::Annual => true,
            BatchType::Supplementary => match bill_run.scheme {
                Scheme::Sroc => licence.include_in_sroc_billing,
                Scheme::Presroc => licence.include_in_presroc_billing,
            },
            BatchType::TwoPartTariff => self.in_review(bill_run.id, licence.id),
        }
    }

    /// (account id, account number, licence id) for every licence with
    /// transactions of the given kind on a bill of a sent run for the year
    fn sent_bill_licences(
        &self,
        scheme: Scheme,
        financial_year_ending: i32,
        two_part_tariff: bool,
    ) -> Vec<(Uuid, String, Uuid)> {
        let sent_runs: HashSet<Uuid> = self
            .bill_runs
            .iter()
            .filter(|r| r.status == BillRunStatus::Sent && r.scheme == scheme)
            .map(|r| r.id)
            .collect();

        let mut found = Vec::new();
        for bill in self
            .bills
            .iter()
            .filter(|b| sent_runs.contains(&b.bill_run_id))
            .filter(|b| b.financial_year_ending == financial_year_ending)
        {
            for bill_licence in self.bill_licences.iter().filter(|bl| bl.bill_id == bill.id) {
                let has_lines = self.transactions.iter().any(|t| {
                    t.bill_licence_id == bill_licence.id && t.two_part_tariff == two_part_tariff
                });
                if has_lines {
                    found.push((
                        bill.billing_account_id,
                        bill.account_number.clone(),
                        bill_licence.licence_id,
                    ));
                }
            }
        }
        found
    }

    fn in_review(&self, bill_run_id: Uuid, licence_id: Uuid) -> bool {
        self.review_licences
            .iter()
            .any(|r| r.bill_run_id == bill_run_id && r.licence_id == licence_id)
    }

    fn reviewed_allocation(
        &self,
        bill_run_id: Uuid,
        charge_version_id: Uuid,
    ) -> Option<ReviewedAllocation> {
        let licence_ids: HashSet<Uuid> = self
            .review_licences
            .iter()
            .filter(|r| r.bill_run_id == bill_run_id)
            .map(|r| r.id)
            .collect();
        let version_ids: HashSet<Uuid> = self
            .review_charge_versions
            .iter()
            .filter(|r| {
                licence_ids.contains(&r.review_licence_id) && r.charge_version_id == charge_version_id
            })
            .map(|r| r.id)
            .collect();
        if version_ids.is_empty() {
            return None;
        }
        let reference_ids: HashSet<Uuid> = self
            .review_charge_references
            .iter()
            .filter(|r| version_ids.contains(&r.review_charge_version_id))
            .map(|r| r.id)
            .collect();

        let amended_allocations = self
            .review_charge_elements
            .iter()
            .filter(|r| reference_ids.contains(&r.review_charge_reference_id))
            .map(|r| (r.charge_element_id, r.amended_allocated))
            .collect();

        Some(ReviewedAllocation {
            amended_allocations,
        })
    }
}

/// BillingRepository holding all rows in process memory
///
/// Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBillingRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryBillingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` against a copy of the state and keep the copy only on success
    fn atomically<T>(&self, op: impl FnOnce(&mut MemoryState) -> RepoResult<T>) -> RepoResult<T> {
        let mut state = self.state();
        let mut working = state.clone();
        let result = op(&mut working)?;
        *state = working;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Store or replace a licence, stamping it as updated now
    pub fn insert_licence(&self, licence: Licence) {
        self.state().store_licence(licence);
    }

    /// Set or clear the end date of a stored charge version
    pub fn set_charge_version_end_date(&self, charge_version_id: Uuid, end_date: Option<NaiveDate>) {
        let mut state = self.state();
        for stored in state
            .charge_versions
            .iter_mut()
            .filter(|s| s.charge_version.id == charge_version_id)
        {
            stored.charge_version.end_date = end_date;
        }
    }

    /// Store a billing account with its charge versions and their licences.
    /// Licences already stored keep their current flags.
    pub fn insert_billing_account(&self, account: &BillingAccount) {
        let mut state = self.state();
        state
            .billing_accounts
            .insert(account.id, account.account_number.clone());
        for charge_version in &account.charge_versions {
            state.store_licence_if_missing(&charge_version.licence);
            state.charge_versions.push(StoredChargeVersion {
                billing_account_id: account.id,
                charge_version: charge_version.clone(),
            });
        }
    }

    /// Store a bill run as-is, whatever its status
    pub fn insert_bill_run(&self, bill_run: BillRun) {
        self.state().bill_runs.push(bill_run);
    }

    /// Put a licence into a run's two-part tariff review with one review row
    /// per charge reference and element of `charge_version`, one return, and
    /// a match between the return and the first element. Elements missing
    /// from `allocations` are staged with zero allocated.
    pub fn seed_review_licence(
        &self,
        bill_run_id: Uuid,
        charge_version: &ChargeVersion,
        allocations: &HashMap<Uuid, Decimal>,
    ) -> Uuid {
        let mut state = self.state();

        let review_licence_id = Uuid::new_v4();
        state.review_licences.push(ReviewLicenceRow {
            id: review_licence_id,
            bill_run_id,
            licence_id: charge_version.licence.id,
        });
        state.store_licence_if_missing(&charge_version.licence);

        let review_charge_version_id = Uuid::new_v4();
        state.review_charge_versions.push(ReviewChargeVersionRow {
            id: review_charge_version_id,
            review_licence_id,
            charge_version_id: charge_version.id,
        });

        let mut first_element = None;
        for reference in &charge_version.charge_references {
            let review_reference_id = Uuid::new_v4();
            state.review_charge_references.push(ReviewChargeReferenceRow {
                id: review_reference_id,
                review_charge_version_id,
            });
            for element in &reference.charge_elements {
                let review_element_id = Uuid::new_v4();
                first_element.get_or_insert(review_element_id);
                state.review_charge_elements.push(ReviewChargeElementRow {
                    id: review_element_id,
                    review_charge_reference_id: review_reference_id,
                    charge_element_id: element.id,
                    amended_allocated: allocations.get(&element.id).copied().unwrap_or_default(),
                });
            }
        }

        let review_return_id = Uuid::new_v4();
        state.review_returns.push(ReviewReturnRow {
            id: review_return_id,
            review_licence_id,
        });
        if let Some(review_charge_element_id) = first_element {
            state
                .review_charge_element_returns
                .push(ReviewChargeElementReturnRow {
                    review_charge_element_id,
                    review_return_id,
                });
        }

        review_licence_id
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    /// Make review deletions fail when they reach `table`
    pub fn fail_review_deletion_at(&self, table: Option<ReviewTable>) {
        self.state().fail_review_deletion_at = table;
    }

    pub fn fail_persist(&self, fail: bool) {
        self.state().fail_persist = fail;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn bill_run(&self, bill_run_id: Uuid) -> Option<BillRun> {
        self.state()
            .bill_runs
            .iter()
            .find(|r| r.id == bill_run_id)
            .cloned()
    }

    pub fn licence(&self, licence_id: Uuid) -> Option<Licence> {
        self.state().licences.get(&licence_id).cloned()
    }

    pub fn bills(&self, bill_run_id: Uuid) -> Vec<Bill> {
        self.state()
            .bills
            .iter()
            .filter(|b| b.bill_run_id == bill_run_id)
            .cloned()
            .collect()
    }

    pub fn bill_licences(&self, bill_run_id: Uuid) -> Vec<BillLicence> {
        let state = self.state();
        let bill_ids: HashSet<Uuid> = state
            .bills
            .iter()
            .filter(|b| b.bill_run_id == bill_run_id)
            .map(|b| b.id)
            .collect();
        state
            .bill_licences
            .iter()
            .filter(|bl| bill_ids.contains(&bl.bill_id))
            .cloned()
            .collect()
    }

    pub fn transactions(&self, bill_run_id: Uuid) -> Vec<Transaction> {
        let bill_licence_ids: HashSet<Uuid> = self
            .bill_licences(bill_run_id)
            .iter()
            .map(|bl| bl.id)
            .collect();
        self.state()
            .transactions
            .iter()
            .filter(|t| bill_licence_ids.contains(&t.bill_licence_id))
            .cloned()
            .collect()
    }

    /// Licence ids currently in the run's review
    pub fn review_licence_ids(&self, bill_run_id: Uuid) -> Vec<Uuid> {
        self.state()
            .review_licences
            .iter()
            .filter(|r| r.bill_run_id == bill_run_id)
            .map(|r| r.licence_id)
            .collect()
    }

    /// Stored rows per review table, across all runs
    pub fn review_row_counts(&self) -> HashMap<ReviewTable, usize> {
        let state = self.state();
        HashMap::from([
            (
                ReviewTable::ChargeElementReturns,
                state.review_charge_element_returns.len(),
            ),
            (ReviewTable::ChargeElements, state.review_charge_elements.len()),
            (ReviewTable::ChargeReferences, state.review_charge_references.len()),
            (ReviewTable::ChargeVersions, state.review_charge_versions.len()),
            (ReviewTable::Returns, state.review_returns.len()),
            (ReviewTable::Licences, state.review_licences.len()),
        ])
    }

    /// Delete one licence's review rows table by table in `steps` order,
    /// checking foreign keys after each step. All or nothing.
    pub fn delete_review_rows_in_order(
        &self,
        bill_run_id: Uuid,
        licence_id: Uuid,
        steps: &[ReviewTable],
    ) -> RepoResult<()> {
        self.atomically(|state| {
            state.run_review_steps(
                Scope::Licence {
                    bill_run_id,
                    licence_id,
                },
                steps,
            )
        })
    }
}

#[async_trait]
impl BillingRepository for InMemoryBillingRepository {
    async fn fetch_busy_flags(&self) -> RepoResult<BusyFlags> {
        let state = self.state();
        Ok(BusyFlags {
            building: state.bill_runs.iter().any(|r| r.status.is_building()),
            cancelling: state.bill_runs.iter().any(|r| r.status.is_cancelling()),
        })
    }

    async fn create_bill_run(&self, new_bill_run: &NewBillRun) -> RepoResult<BillRun> {
        let now = Utc::now();
        let bill_run = BillRun {
            id: Uuid::new_v4(),
            region_id: new_bill_run.region_id,
            scheme: new_bill_run.scheme,
            batch_type: new_bill_run.batch_type,
            status: BillRunStatus::Queued,
            to_financial_year_ending: new_bill_run.to_financial_year_ending,
            error_code: None,
            created_at: now,
            updated_at: now,
        };
        self.state().bill_runs.push(bill_run.clone());
        Ok(bill_run)
    }

    async fn fetch_bill_run(&self, bill_run_id: Uuid) -> RepoResult<Option<BillRun>> {
        Ok(self.bill_run(bill_run_id))
    }

    async fn fetch_bill_run_ids_with_status(&self, status: BillRunStatus) -> RepoResult<Vec<Uuid>> {
        Ok(self
            .state()
            .bill_runs
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.id)
            .collect())
    }

    async fn apply_status_transition(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
        error_code: Option<BillRunErrorCode>,
    ) -> RepoResult<bool> {
        Ok(self
            .state()
            .apply_transition(bill_run_id, transition, error_code))
    }

    async fn fetch_billing_accounts(
        &self,
        bill_run: &BillRun,
        billing_period: &BillingPeriod,
    ) -> RepoResult<Vec<BillingAccount>> {
        let state = self.state();

        let mut selected: Vec<(String, Uuid, ChargeVersion)> = Vec::new();
        for stored in &state.charge_versions {
            let mut charge_version = stored.charge_version.clone();
            if let Some(licence) = state.licences.get(&charge_version.licence.id) {
                charge_version.licence = licence.clone();
            }
            let licence = &charge_version.licence;

            let overlaps = charge_version.start_date <= billing_period.end_date
                && charge_version
                    .end_date
                    .map_or(true, |end| end >= billing_period.start_date);
            if charge_version.scheme != bill_run.scheme
                || licence.region_id != bill_run.region_id
                || !overlaps
            {
                continue;
            }

            if !state.in_batch_scope(bill_run, licence) {
                continue;
            }

            if bill_run.batch_type == BatchType::TwoPartTariff {
                charge_version.reviewed_allocation =
                    state.reviewed_allocation(bill_run.id, charge_version.id);
            }

            let account_number = state
                .billing_accounts
                .get(&stored.billing_account_id)
                .cloned()
                .ok_or_else(|| {
                    RepoError::IntegrityViolation(format!(
                        "charge version {} references missing billing account {}",
                        charge_version.id, stored.billing_account_id
                    ))
                })?;
            selected.push((account_number, stored.billing_account_id, charge_version));
        }

        selected.sort_by(|a, b| {
            (&a.0, &a.2.licence.licence_ref, a.2.start_date).cmp(&(
                &b.0,
                &b.2.licence.licence_ref,
                b.2.start_date,
            ))
        });

        let mut accounts: Vec<BillingAccount> = Vec::new();
        for (account_number, billing_account_id, charge_version) in selected {
            match accounts.last_mut() {
                Some(account) if account.id == billing_account_id => {
                    account.charge_versions.push(charge_version)
                }
                _ => accounts.push(BillingAccount {
                    id: billing_account_id,
                    account_number,
                    charge_versions: vec![charge_version],
                    previously_billed_licences: Vec::new(),
                }),
            }
        }

        let sent = state.sent_bill_licences(
            bill_run.scheme,
            billing_period.financial_year_ending(),
            bill_run.batch_type.is_two_part_tariff(),
        );
        let mut appended = false;
        for (billing_account_id, account_number, licence_id) in sent {
            let Some(licence) = state.licences.get(&licence_id) else {
                continue;
            };
            if licence.region_id != bill_run.region_id || !state.in_batch_scope(bill_run, licence) {
                continue;
            }

            let index = match accounts.iter().position(|a| a.id == billing_account_id) {
                Some(index) => index,
                None => {
                    appended = true;
                    accounts.push(BillingAccount {
                        id: billing_account_id,
                        account_number,
                        charge_versions: Vec::new(),
                        previously_billed_licences: Vec::new(),
                    });
                    accounts.len() - 1
                }
            };
            let account = &mut accounts[index];
            let listed = account
                .charge_versions
                .iter()
                .any(|cv| cv.licence.id == licence_id)
                || account
                    .previously_billed_licences
                    .iter()
                    .any(|l| l.id == licence_id);
            if !listed {
                account.previously_billed_licences.push(licence.clone());
            }
        }
        if appended {
            accounts.sort_by(|a, b| a.account_number.cmp(&b.account_number));
        }

        Ok(accounts)
    }

    async fn fetch_previous_sent_transactions(
        &self,
        query: &PreviousTransactionQuery,
    ) -> RepoResult<Vec<Transaction>> {
        let state = self.state();

        let sent_runs: Vec<Uuid> = state
            .bill_runs
            .iter()
            .filter(|r| r.status == BillRunStatus::Sent && r.scheme == query.scheme)
            .map(|r| r.id)
            .collect();

        let mut previous = Vec::new();
        for bill_run_id in sent_runs {
            let bill_ids: HashSet<Uuid> = state
                .bills
                .iter()
                .filter(|b| {
                    b.bill_run_id == bill_run_id
                        && b.billing_account_id == query.billing_account_id
                        && b.financial_year_ending == query.financial_year_ending
                })
                .map(|b| b.id)
                .collect();
            let bill_licence_ids: HashSet<Uuid> = state
                .bill_licences
                .iter()
                .filter(|bl| bill_ids.contains(&bl.bill_id) && bl.licence_id == query.licence_id)
                .map(|bl| bl.id)
                .collect();
            previous.extend(
                state
                    .transactions
                    .iter()
                    .filter(|t| {
                        bill_licence_ids.contains(&t.bill_licence_id)
                            && t.two_part_tariff == query.two_part_tariff
                    })
                    .cloned(),
            );
        }

        Ok(previous)
    }

    async fn persist_billing_period(
        &self,
        bill_run_id: Uuid,
        output: &BillingPeriodOutput,
    ) -> RepoResult<bool> {
        self.atomically(|state| {
            if state.fail_persist {
                return Err(RepoError::Unavailable("persist failed".to_string()));
            }
            let processing = state
                .bill_runs
                .iter()
                .any(|r| r.id == bill_run_id && r.status == BillRunStatus::Processing);
            if !processing {
                return Ok(false);
            }
            state.bills.extend(output.bills.iter().cloned());
            state.bill_licences.extend(output.bill_licences.iter().cloned());
            state.transactions.extend(output.transactions.iter().cloned());
            match state.integrity_violation() {
                Some(violation) => Err(RepoError::IntegrityViolation(violation)),
                None => Ok(true),
            }
        })
    }

    async fn complete_bill_run(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
        error_code: Option<BillRunErrorCode>,
    ) -> RepoResult<bool> {
        self.atomically(|state| {
            if !state.apply_transition(bill_run_id, transition, error_code) {
                return Ok(false);
            }
            state.run_review_steps(Scope::BillRun { bill_run_id }, &REVIEW_LICENCE_DELETION_STEPS)?;
            Ok(true)
        })
    }

    async fn delete_bill_run_output(
        &self,
        bill_run_id: Uuid,
        transition: StatusTransition,
    ) -> RepoResult<bool> {
        self.atomically(|state| {
            if !state.apply_transition(bill_run_id, transition, None) {
                return Ok(false);
            }
            state.delete_bill_run_rows(bill_run_id);
            state.run_review_steps(Scope::BillRun { bill_run_id }, &REVIEW_LICENCE_DELETION_STEPS)?;
            Ok(true)
        })
    }

    async fn remove_review_licence(
        &self,
        bill_run_id: Uuid,
        licence_id: Uuid,
    ) -> RepoResult<ReviewLicenceRemoval> {
        self.atomically(|state| {
            let Some(bill_run) = state.bill_runs.iter().find(|r| r.id == bill_run_id) else {
                return Ok(ReviewLicenceRemoval::BillRunNotFound);
            };
            if bill_run.status != BillRunStatus::Review {
                return Ok(ReviewLicenceRemoval::NotInReview(bill_run.status));
            }
            if !state.in_review(bill_run_id, licence_id) {
                return Ok(ReviewLicenceRemoval::LicenceNotInReview);
            }
            state.run_review_steps(
                Scope::Licence {
                    bill_run_id,
                    licence_id,
                },
                &REVIEW_LICENCE_DELETION_STEPS,
            )?;
            let licence = state.licences.get_mut(&licence_id).ok_or_else(|| {
                RepoError::IntegrityViolation(format!("review licence {licence_id} has no licence"))
            })?;
            licence.include_in_sroc_tpt_billing = true;
            let licence_ref = licence.licence_ref.clone();
            state.licence_updated_at.insert(licence_id, Utc::now());

            let remaining = state
                .review_licences
                .iter()
                .filter(|r| r.bill_run_id == bill_run_id)
                .count();
            Ok(ReviewLicenceRemoval::Removed {
                licence_ref,
                remaining: remaining as i64,
            })
        })
    }

    async fn count_review_licences(&self, bill_run_id: Uuid) -> RepoResult<i64> {
        let count = self
            .state()
            .review_licences
            .iter()
            .filter(|r| r.bill_run_id == bill_run_id)
            .count();
        Ok(count as i64)
    }

    async fn unflag_billed_licences(&self, bill_run: &BillRun) -> RepoResult<u64> {
        let billed: HashSet<Uuid> = self
            .bill_licences(bill_run.id)
            .iter()
            .map(|bl| bl.licence_id)
            .collect();

        let mut guard = self.state();
        let state = &mut *guard;
        let now = Utc::now();
        let mut changed = 0;
        for licence_id in billed {
            if let Some(licence) = state.licences.get_mut(&licence_id) {
                let flag = match bill_run.scheme {
                    Scheme::Sroc => &mut licence.include_in_sroc_billing,
                    Scheme::Presroc => &mut licence.include_in_presroc_billing,
                };
                if *flag {
                    *flag = false;
                    state.licence_updated_at.insert(licence_id, now);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn unflag_unbilled_licences(&self, bill_run: &BillRun) -> RepoResult<u64> {
        let billed: HashSet<Uuid> = self
            .bill_licences(bill_run.id)
            .iter()
            .map(|bl| bl.licence_id)
            .collect();

        let mut guard = self.state();
        let state = &mut *guard;
        let now = Utc::now();
        let mut changed = 0;
        for licence in state.licences.values_mut() {
            let flagged_before_run = state
                .licence_updated_at
                .get(&licence.id)
                .is_some_and(|updated_at| *updated_at <= bill_run.created_at);
            if licence.region_id != bill_run.region_id
                || billed.contains(&licence.id)
                || !flagged_before_run
            {
                continue;
            }
            let flag = match bill_run.scheme {
                Scheme::Sroc => &mut licence.include_in_sroc_billing,
                Scheme::Presroc => &mut licence.include_in_presroc_billing,
            };
            if *flag {
                *flag = false;
                state.licence_updated_at.insert(licence.id, now);
                changed += 1;
            }
        }
        Ok(changed)
    }
}
