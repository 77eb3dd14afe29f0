//! End-to-end bill run scenarios against the in-memory repository

mod common;

use async_trait::async_trait;
use bill_runs_rs::gateway::{
    ChargeSubmissionGateway, GatewayError, StubChargeGateway, SubmissionContext,
};
use bill_runs_rs::metrics::Metrics;
use bill_runs_rs::models::{
    BatchType, BillRunErrorCode, NewBillRun, ReviewedAllocation, Scheme, Transaction,
};
use bill_runs_rs::notifier::CollectingNotifier;
use bill_runs_rs::repos::{BillingRepository, InMemoryBillingRepository};
use bill_runs_rs::run_log::RunLog;
use bill_runs_rs::services::{BillRunError, BillRunService, ProcessError, ReviewLicenceRemover};
use bill_runs_rs::state_machine::BillRunStatus;
use common::{billing_account, charge_version, date, licence};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn service_with(
    repo: &InMemoryBillingRepository,
    gateway: Arc<dyn ChargeSubmissionGateway>,
) -> BillRunService {
    BillRunService::new(
        Arc::new(repo.clone()),
        gateway,
        Duration::from_secs(5),
        Metrics::new(),
    )
}

fn service(repo: &InMemoryBillingRepository) -> BillRunService {
    service_with(repo, Arc::new(StubChargeGateway::new()))
}

fn new_run(region_id: Uuid, batch_type: BatchType, to_financial_year_ending: i32) -> NewBillRun {
    NewBillRun {
        region_id,
        scheme: Scheme::Sroc,
        batch_type,
        to_financial_year_ending,
    }
}

/// Create, process, send and mark sent
async fn send_run(service: &BillRunService, request: &NewBillRun) -> Uuid {
    let bill_run = service.create_bill_run(request).await.unwrap();
    assert_eq!(
        service.process_bill_run(bill_run.id).await.unwrap(),
        BillRunStatus::Ready
    );
    service.mark_sending(bill_run.id).await.unwrap();
    service.mark_sent(bill_run.id).await.unwrap();
    bill_run.id
}

#[tokio::test]
async fn test_two_charge_versions_for_one_licence_make_one_bill() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let l = licence(region_id, "03/28/61/0021");
    repo.insert_billing_account(&billing_account(
        "A12345678A",
        vec![
            charge_version(&l, "4.5.6", 1000),
            charge_version(&l, "4.5.7", 1500),
        ],
    ));
    let service = service(&repo);

    let bill_run = service
        .create_bill_run(&new_run(region_id, BatchType::Annual, 2024))
        .await
        .unwrap();
    let status = service.process_bill_run(bill_run.id).await.unwrap();

    assert_eq!(status, BillRunStatus::Ready);
    let bills = repo.bills(bill_run.id);
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0].account_number, "A12345678A");
    assert_eq!(bills[0].financial_year_ending, 2024);
    assert_eq!(bills[0].net_amount, 2500);

    let bill_licences = repo.bill_licences(bill_run.id);
    assert_eq!(bill_licences.len(), 1);
    assert_eq!(bill_licences[0].licence_ref, "03/28/61/0021");

    let transactions = repo.transactions(bill_run.id);
    assert_eq!(transactions.len(), 2);
    assert!(transactions
        .iter()
        .all(|t| t.bill_licence_id == bill_licences[0].id));
    let total: i64 = transactions.iter().map(Transaction::signed_amount).sum();
    assert_eq!(total, 2500);
}

#[tokio::test]
async fn test_account_without_transactions_gets_no_bill() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let active = licence(region_id, "01/001");
    let mut expired = licence(region_id, "01/002");
    expired.expired_date = Some(common::date(2022, 3, 31));
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![charge_version(&active, "4.5.6", 1000)],
    ));
    repo.insert_billing_account(&billing_account(
        "B00000002A",
        vec![charge_version(&expired, "4.5.6", 1000)],
    ));
    let service = service(&repo);

    let bill_run = service
        .create_bill_run(&new_run(region_id, BatchType::Annual, 2024))
        .await
        .unwrap();
    service.process_bill_run(bill_run.id).await.unwrap();

    let bills = repo.bills(bill_run.id);
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0].account_number, "A00000001A");
}

#[tokio::test]
async fn test_rebilling_a_sent_period_is_empty() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let l = licence(region_id, "01/100");
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![charge_version(&l, "4.5.6", 1000)],
    ));
    let service = service(&repo);
    let request = new_run(region_id, BatchType::Annual, 2024);

    send_run(&service, &request).await;

    let second = service.create_bill_run(&request).await.unwrap();
    let status = service.process_bill_run(second.id).await.unwrap();

    assert_eq!(status, BillRunStatus::Empty);
    assert!(repo.bills(second.id).is_empty());
}

#[tokio::test]
async fn test_zero_allocation_after_sent_run_credits_previous_charge() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let l = licence(region_id, "01/200");
    let cv = charge_version(&l, "4.6.12", 2000);
    let element_id = cv.charge_references[0].charge_elements[0].id;
    repo.insert_billing_account(&billing_account("A00000001A", vec![cv.clone()]));
    let service = service(&repo);
    let request = new_run(region_id, BatchType::TwoPartTariff, 2024);

    // First run: full allocation, reviewed and sent
    let first = service.create_bill_run(&request).await.unwrap();
    repo.seed_review_licence(
        first.id,
        &cv,
        &HashMap::from([(element_id, Decimal::new(100, 0))]),
    );
    assert_eq!(
        service.process_bill_run(first.id).await.unwrap(),
        BillRunStatus::Review
    );
    assert_eq!(
        service.process_bill_run(first.id).await.unwrap(),
        BillRunStatus::Ready
    );
    assert_eq!(repo.transactions(first.id)[0].net_amount, 2000);
    service.mark_sending(first.id).await.unwrap();
    service.mark_sent(first.id).await.unwrap();

    // Second run: operator amends the allocation to zero
    let second = service.create_bill_run(&request).await.unwrap();
    repo.seed_review_licence(second.id, &cv, &HashMap::from([(element_id, Decimal::ZERO)]));
    assert_eq!(
        service.process_bill_run(second.id).await.unwrap(),
        BillRunStatus::Review
    );
    let status = service.process_bill_run(second.id).await.unwrap();

    assert_eq!(status, BillRunStatus::Ready);
    let transactions = repo.transactions(second.id);
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0].credit);
    assert_eq!(transactions[0].net_amount, 2000);
    assert!(transactions[0].two_part_tariff);

    let bills = repo.bills(second.id);
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0].net_amount, -2000);
    assert!(bills[0].credit);

    // Staged review rows go once a run leaves review for good
    assert!(repo.review_licence_ids(first.id).is_empty());
    assert!(repo.review_licence_ids(second.id).is_empty());
    assert!(repo.review_row_counts().values().all(|&n| n == 0));
}

#[tokio::test]
async fn test_removing_review_licences_until_run_is_empty() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let first = licence(region_id, "01/301");
    let second = licence(region_id, "01/302");
    let first_cv = charge_version(&first, "4.6.12", 1000);
    let second_cv = charge_version(&second, "4.6.12", 1000);
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![first_cv.clone(), second_cv.clone()],
    ));
    let service = service(&repo);
    let remover = ReviewLicenceRemover::new(Arc::new(repo.clone()), Metrics::new());

    let bill_run = service
        .create_bill_run(&new_run(region_id, BatchType::TwoPartTariff, 2024))
        .await
        .unwrap();
    repo.seed_review_licence(bill_run.id, &first_cv, &HashMap::new());
    repo.seed_review_licence(bill_run.id, &second_cv, &HashMap::new());
    service.process_bill_run(bill_run.id).await.unwrap();
    assert_eq!(repo.bill_run(bill_run.id).unwrap().status, BillRunStatus::Review);

    let notifier = CollectingNotifier::new();
    let run_log = RunLog::new(&bill_run);
    let emptied = remover
        .remove(bill_run.id, first.id, &notifier, &run_log)
        .await
        .unwrap();
    assert!(!emptied);
    assert_eq!(repo.bill_run(bill_run.id).unwrap().status, BillRunStatus::Review);
    assert_eq!(
        notifier.messages(),
        vec!["Licence 01/301 removed from the bill run.".to_string()]
    );
    assert!(repo.licence(first.id).unwrap().include_in_sroc_tpt_billing);

    let emptied = remover
        .remove(bill_run.id, second.id, &notifier, &run_log)
        .await
        .unwrap();
    assert!(emptied);
    assert_eq!(repo.bill_run(bill_run.id).unwrap().status, BillRunStatus::Empty);
    assert_eq!(notifier.messages().len(), 1);
    assert!(repo.review_licence_ids(bill_run.id).is_empty());
    assert!(repo.review_row_counts().values().all(|&n| n == 0));
}

#[tokio::test]
async fn test_unreviewed_licence_is_left_out_of_two_part_tariff_bill() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let reviewed = licence(region_id, "01/401");
    let other = licence(region_id, "01/402");
    let reviewed_cv = charge_version(&reviewed, "4.6.12", 1000);
    let element_id = reviewed_cv.charge_references[0].charge_elements[0].id;
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![reviewed_cv.clone(), charge_version(&other, "4.6.12", 1000)],
    ));
    let service = service(&repo);

    let bill_run = service
        .create_bill_run(&new_run(region_id, BatchType::TwoPartTariff, 2024))
        .await
        .unwrap();
    repo.seed_review_licence(
        bill_run.id,
        &reviewed_cv,
        &HashMap::from([(element_id, Decimal::new(25, 0))]),
    );
    service.process_bill_run(bill_run.id).await.unwrap();
    service.process_bill_run(bill_run.id).await.unwrap();

    let bill_licences = repo.bill_licences(bill_run.id);
    assert_eq!(bill_licences.len(), 1);
    assert_eq!(bill_licences[0].licence_id, reviewed.id);
    assert_eq!(repo.bills(bill_run.id)[0].net_amount, 250);
}

#[tokio::test]
async fn test_supplementary_run_bills_each_year_and_clears_flags() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let mut flagged = licence(region_id, "01/500");
    flagged.include_in_sroc_billing = true;
    let unflagged = licence(region_id, "01/501");
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![
            charge_version(&flagged, "4.5.6", 1000),
            charge_version(&unflagged, "4.5.6", 1000),
        ],
    ));
    let service = service(&repo);

    let bill_run_id = send_run(&service, &new_run(region_id, BatchType::Supplementary, 2025)).await;

    let mut years: Vec<i32> = repo
        .bills(bill_run_id)
        .iter()
        .map(|b| b.financial_year_ending)
        .collect();
    years.sort();
    assert_eq!(years, vec![2023, 2024, 2025]);
    assert!(repo
        .bill_licences(bill_run_id)
        .iter()
        .all(|bl| bl.licence_id == flagged.id));
    assert!(!repo.licence(flagged.id).unwrap().include_in_sroc_billing);
    assert_eq!(repo.bill_run(bill_run_id).unwrap().status, BillRunStatus::Sent);
}

#[tokio::test]
async fn test_submission_failure_marks_run_as_error() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let l = licence(region_id, "01/600");
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![charge_version(&l, "4.5.6", 1000)],
    ));
    let service = service_with(&repo, Arc::new(StubChargeGateway::rejecting("service down")));

    let bill_run = service
        .create_bill_run(&new_run(region_id, BatchType::Annual, 2024))
        .await
        .unwrap();
    let err = service.process_bill_run(bill_run.id).await.unwrap_err();

    assert!(matches!(
        err,
        BillRunError::Processing(ProcessError::Submission { .. })
    ));
    let stored = repo.bill_run(bill_run.id).unwrap();
    assert_eq!(stored.status, BillRunStatus::Error);
    assert_eq!(stored.error_code, Some(BillRunErrorCode::FailedToCreateCharge));
    assert!(repo.bills(bill_run.id).is_empty());
}

#[tokio::test]
async fn test_busy_checker_blocks_new_runs_until_cancel_is_finalized() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let service = service(&repo);
    let request = new_run(region_id, BatchType::Annual, 2024);

    let bill_run = service.create_bill_run(&request).await.unwrap();
    service.request_cancel(bill_run.id).await.unwrap();

    assert!(matches!(
        service.create_bill_run(&request).await,
        Err(BillRunError::Busy(_))
    ));

    service.finalize_cancelled().await.unwrap();
    assert!(service.create_bill_run(&request).await.is_ok());
}

/// Cancels the run from inside the first submission, as an operator would
/// while the run is processing
struct CancellingGateway {
    repo: InMemoryBillingRepository,
    inner: StubChargeGateway,
}

#[async_trait]
impl ChargeSubmissionGateway for CancellingGateway {
    async fn submit(
        &self,
        context: &SubmissionContext,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>, GatewayError> {
        let transition = BillRunStatus::Processing
            .transition(BillRunStatus::Cancel)
            .unwrap();
        self.repo
            .apply_status_transition(context.bill_run_id, transition, None)
            .await
            .unwrap();
        self.inner.submit(context, transactions).await
    }
}

#[tokio::test]
async fn test_cancel_during_processing_stops_and_is_cleared() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let mut l = licence(region_id, "01/700");
    l.include_in_sroc_billing = true;
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![charge_version(&l, "4.5.6", 1000)],
    ));
    let service = service_with(
        &repo,
        Arc::new(CancellingGateway {
            repo: repo.clone(),
            inner: StubChargeGateway::new(),
        }),
    );

    let bill_run = service
        .create_bill_run(&new_run(region_id, BatchType::Supplementary, 2025))
        .await
        .unwrap();
    let status = service.process_bill_run(bill_run.id).await.unwrap();

    assert_eq!(status, BillRunStatus::Cancel);
    assert!(repo.bills(bill_run.id).is_empty());
    assert!(repo.licence(l.id).unwrap().include_in_sroc_billing);

    assert_eq!(service.finalize_cancelled().await.unwrap(), 1);
    assert_eq!(repo.bill_run(bill_run.id).unwrap().status, BillRunStatus::Empty);
    assert!(repo.bills(bill_run.id).is_empty());
    assert!(repo.transactions(bill_run.id).is_empty());
}

/// Cancels the run and clears it, as the cancel sweep would, while the
/// first submission is in flight
struct CancelAndSweepGateway {
    repo: InMemoryBillingRepository,
    inner: StubChargeGateway,
}

#[async_trait]
impl ChargeSubmissionGateway for CancelAndSweepGateway {
    async fn submit(
        &self,
        context: &SubmissionContext,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>, GatewayError> {
        let cancel = BillRunStatus::Processing
            .transition(BillRunStatus::Cancel)
            .unwrap();
        let sweep = BillRunStatus::Cancel.transition(BillRunStatus::Empty).unwrap();
        self.repo
            .apply_status_transition(context.bill_run_id, cancel, None)
            .await
            .unwrap();
        assert!(self
            .repo
            .delete_bill_run_output(context.bill_run_id, sweep)
            .await
            .unwrap());
        self.inner.submit(context, transactions).await
    }
}

#[tokio::test]
async fn test_run_swept_during_submission_is_left_empty() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let l = licence(region_id, "01/750");
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![charge_version(&l, "4.5.6", 1000)],
    ));
    let service = service_with(
        &repo,
        Arc::new(CancelAndSweepGateway {
            repo: repo.clone(),
            inner: StubChargeGateway::new(),
        }),
    );

    let bill_run = service
        .create_bill_run(&new_run(region_id, BatchType::Annual, 2024))
        .await
        .unwrap();
    let status = service.process_bill_run(bill_run.id).await.unwrap();

    assert_eq!(status, BillRunStatus::Empty);
    assert_eq!(repo.bill_run(bill_run.id).unwrap().status, BillRunStatus::Empty);
    assert!(repo.bills(bill_run.id).is_empty());
    assert!(repo.bill_licences(bill_run.id).is_empty());
    assert!(repo.transactions(bill_run.id).is_empty());
    assert_eq!(service.finalize_cancelled().await.unwrap(), 0);
}

#[tokio::test]
async fn test_licence_whose_charge_version_ended_is_credited_for_later_years() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let mut l = licence(region_id, "01/900");
    l.include_in_sroc_billing = true;
    let mut cv = charge_version(&l, "4.5.6", 2000);
    cv.start_date = date(2022, 4, 1);
    repo.insert_billing_account(&billing_account("A00000001A", vec![cv.clone()]));
    let service = service(&repo);
    let request = new_run(region_id, BatchType::Supplementary, 2024);

    let first = send_run(&service, &request).await;
    let mut first_years: Vec<i32> = repo
        .bills(first)
        .iter()
        .map(|b| b.financial_year_ending)
        .collect();
    first_years.sort();
    assert_eq!(first_years, vec![2023, 2024]);

    // Charge version ended after the first year was billed; licence flagged again
    repo.set_charge_version_end_date(cv.id, Some(date(2023, 3, 31)));
    let mut reflagged = repo.licence(l.id).unwrap();
    assert!(!reflagged.include_in_sroc_billing);
    reflagged.include_in_sroc_billing = true;
    repo.insert_licence(reflagged);

    let second = service.create_bill_run(&request).await.unwrap();
    let status = service.process_bill_run(second.id).await.unwrap();

    assert_eq!(status, BillRunStatus::Ready);
    let bills = repo.bills(second.id);
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0].financial_year_ending, 2024);
    assert_eq!(bills[0].net_amount, -2000);
    assert!(bills[0].credit);

    let transactions = repo.transactions(second.id);
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0].credit);
    assert_eq!(transactions[0].net_amount, 2000);
    assert_eq!(repo.bill_licences(second.id)[0].licence_id, l.id);
}

#[tokio::test]
async fn test_flagged_licence_that_nets_to_nothing_is_unflagged() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let mut l = licence(region_id, "01/950");
    l.include_in_sroc_billing = true;
    repo.insert_billing_account(&billing_account(
        "A00000001A",
        vec![charge_version(&l, "4.5.6", 1000)],
    ));
    let service = service(&repo);
    let request = new_run(region_id, BatchType::Supplementary, 2024);

    send_run(&service, &request).await;

    // Flagged again without any change to its charges
    let mut reflagged = repo.licence(l.id).unwrap();
    reflagged.include_in_sroc_billing = true;
    repo.insert_licence(reflagged);

    let second = service.create_bill_run(&request).await.unwrap();
    let status = service.process_bill_run(second.id).await.unwrap();

    assert_eq!(status, BillRunStatus::Empty);
    assert!(repo.bills(second.id).is_empty());
    assert!(!repo.licence(l.id).unwrap().include_in_sroc_billing);
}

#[tokio::test]
async fn test_reviewed_allocation_is_attached_only_for_two_part_tariff() {
    let repo = InMemoryBillingRepository::new();
    let region_id = Uuid::new_v4();
    let l = licence(region_id, "01/800");
    let cv = charge_version(&l, "4.6.12", 1000);
    let element_id = cv.charge_references[0].charge_elements[0].id;
    repo.insert_billing_account(&billing_account("A00000001A", vec![cv.clone()]));

    let run = common::bill_run(
        region_id,
        BatchType::TwoPartTariff,
        BillRunStatus::Processing,
        2024,
    );
    repo.insert_bill_run(run.clone());
    repo.seed_review_licence(run.id, &cv, &HashMap::from([(element_id, Decimal::new(40, 0))]));

    let period = bill_runs_rs::models::BillingPeriod::for_financial_year_ending(2024).unwrap();
    let accounts = repo.fetch_billing_accounts(&run, &period).await.unwrap();

    assert_eq!(accounts.len(), 1);
    assert_eq!(
        accounts[0].charge_versions[0].reviewed_allocation,
        Some(ReviewedAllocation {
            amended_allocations: HashMap::from([(element_id, Decimal::new(40, 0))]),
        })
    );
}
