//! Billing period processor
//!
//! Turns the billing accounts of one billing period into bills, bill
//! licences and transactions:
//!
//! 1. Works out each charge version's charge period and generates its lines
//! 2. Nets each licence's lines against what was already sent
//! 3. Submits each licence's final lines to the charging service
//! 4. Persists everything for the period in one atomic write
//!
//! Nothing is written if any account fails.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::charge_period::determine_charge_period;
use super::reconciler::reconcile;
use super::transaction_generator::{generate_transactions, GenerationError};
use crate::gateway::{ChargeSubmissionGateway, GatewayError, SubmissionContext};
use crate::metrics::Metrics;
use crate::models::{
    Bill, BillLicence, BillRun, BillRunErrorCode, BillingAccount, BillingPeriod,
    BillingPeriodOutput, ChargeVersion, Licence, Transaction,
};
use crate::repos::{BillingRepository, PreviousTransactionQuery, RepoError};
use crate::run_log::RunLog;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to prepare transactions for licence {licence_ref}: {source}")]
    FailedToPrepareTransactions {
        licence_ref: String,
        source: GenerationError,
    },

    #[error("Failed to create charges for licence {licence_ref}: {source}")]
    Submission {
        licence_ref: String,
        source: GatewayError,
    },

    #[error("Bill run {0} left processing before its output was written")]
    NoLongerProcessing(Uuid),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),
}

impl ProcessError {
    /// Code recorded on the bill run when processing stops with this error
    pub fn error_code(&self) -> BillRunErrorCode {
        match self {
            ProcessError::FailedToPrepareTransactions { .. } => {
                BillRunErrorCode::FailedToPrepareTransactions
            }
            ProcessError::Submission { .. } => BillRunErrorCode::FailedToCreateCharge,
            ProcessError::NoLongerProcessing(_) | ProcessError::Repository(_) => {
                BillRunErrorCode::FailedToProcessChargeVersions
            }
        }
    }
}

#[derive(Clone)]
pub struct BillingPeriodProcessor {
    repo: Arc<dyn BillingRepository>,
    gateway: Arc<dyn ChargeSubmissionGateway>,
    submission_timeout: Duration,
    metrics: Metrics,
}

impl BillingPeriodProcessor {
    pub fn new(
        repo: Arc<dyn BillingRepository>,
        gateway: Arc<dyn ChargeSubmissionGateway>,
        submission_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            repo,
            gateway,
            submission_timeout,
            metrics,
        }
    }

    /// Process one billing period. Returns true if anything was persisted.
    pub async fn process(
        &self,
        bill_run: &BillRun,
        billing_period: &BillingPeriod,
        billing_accounts: &[BillingAccount],
        run_log: &RunLog,
    ) -> Result<bool, ProcessError> {
        let mut output = BillingPeriodOutput::default();

        for account in billing_accounts {
            self.process_account(bill_run, billing_period, account, &mut output)
                .await?;
        }

        if output.is_empty() {
            tracing::info!(
                financial_year_ending = billing_period.financial_year_ending(),
                accounts = billing_accounts.len(),
                elapsed_ms = run_log.elapsed_ms() as u64,
                "Billing period produced no transactions"
            );
            return Ok(false);
        }

        if !self.repo.persist_billing_period(bill_run.id, &output).await? {
            return Err(ProcessError::NoLongerProcessing(bill_run.id));
        }

        tracing::info!(
            financial_year_ending = billing_period.financial_year_ending(),
            accounts = billing_accounts.len(),
            bills = output.bills.len(),
            bill_licences = output.bill_licences.len(),
            transactions = output.transactions.len(),
            elapsed_ms = run_log.elapsed_ms() as u64,
            "Billing period processed"
        );

        Ok(true)
    }

    async fn process_account(
        &self,
        bill_run: &BillRun,
        billing_period: &BillingPeriod,
        account: &BillingAccount,
        output: &mut BillingPeriodOutput,
    ) -> Result<(), ProcessError> {
        let two_part_tariff = bill_run.batch_type.is_two_part_tariff();
        let financial_year_ending = billing_period.financial_year_ending();

        let mut bill: Option<Bill> = None;
        let mut bill_licences = Vec::new();
        let mut transactions = Vec::new();

        let mut licences: Vec<(&Licence, Vec<&ChargeVersion>)> =
            group_by_licence(&account.charge_versions)
                .into_iter()
                .filter_map(|(licence, charge_versions)| {
                    let charge_versions: Vec<&ChargeVersion> = if two_part_tariff {
                        charge_versions
                            .into_iter()
                            .filter(|cv| cv.reviewed_allocation.is_some())
                            .collect()
                    } else {
                        charge_versions
                    };
                    (!charge_versions.is_empty()).then_some((licence, charge_versions))
                })
                .collect();
        // Nothing to generate; whatever was sent for them is credited
        licences.extend(
            account
                .previously_billed_licences
                .iter()
                .map(|licence| (licence, Vec::new())),
        );

        for (licence, charge_versions) in licences {
            let bill_licence_id = Uuid::new_v4();

            let mut generated = Vec::new();
            for charge_version in charge_versions {
                let Some(charge_period) = determine_charge_period(charge_version, billing_period)
                else {
                    continue;
                };
                let lines = generate_transactions(
                    bill_licence_id,
                    charge_version,
                    billing_period,
                    &charge_period,
                    two_part_tariff,
                )
                .map_err(|source| ProcessError::FailedToPrepareTransactions {
                    licence_ref: licence.licence_ref.clone(),
                    source,
                })?;
                generated.extend(lines);
            }
            self.metrics
                .transactions_generated_total
                .inc_by(generated.len() as u64);

            let previous = self
                .repo
                .fetch_previous_sent_transactions(&PreviousTransactionQuery {
                    billing_account_id: account.id,
                    licence_id: licence.id,
                    financial_year_ending,
                    scheme: bill_run.scheme,
                    two_part_tariff,
                })
                .await?;

            let final_transactions = reconcile(&previous, generated, bill_licence_id);
            if final_transactions.is_empty() {
                tracing::debug!(
                    licence_ref = %licence.licence_ref,
                    previous = previous.len(),
                    "Licence nets to nothing"
                );
                continue;
            }

            let context = SubmissionContext {
                bill_run_id: bill_run.id,
                region_id: bill_run.region_id,
                account_number: account.account_number.clone(),
                licence_ref: licence.licence_ref.clone(),
                financial_year_ending,
            };
            let submitted = self.submit(&context, final_transactions).await?;

            let current_bill = bill.get_or_insert_with(|| Bill {
                id: Uuid::new_v4(),
                bill_run_id: bill_run.id,
                billing_account_id: account.id,
                account_number: account.account_number.clone(),
                financial_year_ending,
                credit: false,
                net_amount: 0,
            });
            bill_licences.push(BillLicence {
                id: bill_licence_id,
                bill_id: current_bill.id,
                licence_id: licence.id,
                licence_ref: licence.licence_ref.clone(),
            });
            transactions.extend(submitted);
        }

        if let Some(mut bill) = bill {
            bill.net_amount = transactions.iter().map(Transaction::signed_amount).sum();
            bill.credit = bill.net_amount < 0;
            output.bills.push(bill);
            output.bill_licences.extend(bill_licences);
            output.transactions.extend(transactions);
        }

        Ok(())
    }

    async fn submit(
        &self,
        context: &SubmissionContext,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>, ProcessError> {
        let expected = transactions.len();

        let result = match tokio::time::timeout(
            self.submission_timeout,
            self.gateway.submit(context, transactions),
        )
        .await
        {
            Ok(Ok(submitted)) if submitted.len() == expected => Ok(submitted),
            Ok(Ok(submitted)) => Err(GatewayError::Parse(format!(
                "submitted {} transactions, {} returned",
                expected,
                submitted.len()
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::Timeout(self.submission_timeout)),
        };

        match result {
            Ok(submitted) => {
                self.metrics
                    .gateway_submissions_total
                    .with_label_values(&["ok"])
                    .inc();
                Ok(submitted)
            }
            Err(source) => {
                self.metrics
                    .gateway_submissions_total
                    .with_label_values(&[source.kind()])
                    .inc();
                tracing::warn!(
                    licence_ref = %context.licence_ref,
                    account_number = %context.account_number,
                    error = %source,
                    "Charge submission failed"
                );
                Err(ProcessError::Submission {
                    licence_ref: context.licence_ref.clone(),
                    source,
                })
            }
        }
    }
}

/// Charge versions grouped by licence, in order of first appearance
fn group_by_licence(charge_versions: &[ChargeVersion]) -> Vec<(&Licence, Vec<&ChargeVersion>)> {
    let mut groups: Vec<(&Licence, Vec<&ChargeVersion>)> = Vec::new();
    for charge_version in charge_versions {
        match groups
            .iter_mut()
            .find(|(licence, _)| licence.id == charge_version.licence.id)
        {
            Some((_, group)) => group.push(charge_version),
            None => groups.push((&charge_version.licence, vec![charge_version])),
        }
    }
    groups
}
