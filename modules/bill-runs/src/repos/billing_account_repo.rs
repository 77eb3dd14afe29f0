//! Loads billing accounts with their charge data for one billing period
//!
//! Charge versions, references and elements are read with one query per
//! level and assembled in memory, keeping round trips constant regardless of
//! account count.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{review_repo, RepoError, RepoResult};
use crate::models::{
    AbstractionPeriod, BatchType, BillRun, BillingAccount, BillingPeriod, ChargeElement,
    ChargeFactors, ChargeReference, ChargeVersion, Licence, ReviewedAllocation, Scheme,
};

#[derive(Debug, Clone, FromRow)]
struct ChargeVersionRow {
    id: Uuid,
    scheme: String,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    billing_account_id: Uuid,
    account_number: String,
    licence_id: Uuid,
    licence_ref: String,
    region_id: Uuid,
    revoked_date: Option<NaiveDate>,
    lapsed_date: Option<NaiveDate>,
    expired_date: Option<NaiveDate>,
    include_in_sroc_billing: bool,
    include_in_presroc_billing: bool,
    include_in_sroc_tpt_billing: bool,
}

#[derive(Debug, Clone, FromRow)]
struct PreviouslyBilledRow {
    billing_account_id: Uuid,
    account_number: String,
    licence_id: Uuid,
    licence_ref: String,
    region_id: Uuid,
    revoked_date: Option<NaiveDate>,
    lapsed_date: Option<NaiveDate>,
    expired_date: Option<NaiveDate>,
    include_in_sroc_billing: bool,
    include_in_presroc_billing: bool,
    include_in_sroc_tpt_billing: bool,
}

impl From<PreviouslyBilledRow> for Licence {
    fn from(row: PreviouslyBilledRow) -> Self {
        Licence {
            id: row.licence_id,
            licence_ref: row.licence_ref,
            region_id: row.region_id,
            revoked_date: row.revoked_date,
            lapsed_date: row.lapsed_date,
            expired_date: row.expired_date,
            include_in_sroc_billing: row.include_in_sroc_billing,
            include_in_presroc_billing: row.include_in_presroc_billing,
            include_in_sroc_tpt_billing: row.include_in_sroc_tpt_billing,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct ChargeReferenceRow {
    id: Uuid,
    charge_version_id: Uuid,
    charge_category_code: String,
    description: String,
    aggregate_factor: Decimal,
    adjustment_factor: Decimal,
    section_126_factor: Decimal,
    section_127_agreement: bool,
    section_130_agreement: bool,
    winter_only: bool,
    supported_source_name: Option<String>,
    water_company_charge: bool,
}

#[derive(Debug, Clone, FromRow)]
struct ChargeElementRow {
    id: Uuid,
    charge_reference_id: Uuid,
    description: String,
    authorised_annual_quantity: Decimal,
    abstraction_period_start_day: i32,
    abstraction_period_start_month: i32,
    abstraction_period_end_day: i32,
    abstraction_period_end_month: i32,
    annual_charge: i64,
}

fn day_or_month(value: i32, column: &str, element_id: Uuid) -> RepoResult<u32> {
    u32::try_from(value).map_err(|_| {
        RepoError::InvalidData(format!("{column} = {value} on charge element {element_id}"))
    })
}

impl TryFrom<ChargeElementRow> for ChargeElement {
    type Error = RepoError;

    fn try_from(row: ChargeElementRow) -> Result<Self, Self::Error> {
        let abstraction_period = AbstractionPeriod {
            start_day: day_or_month(row.abstraction_period_start_day, "abstraction_period_start_day", row.id)?,
            start_month: day_or_month(row.abstraction_period_start_month, "abstraction_period_start_month", row.id)?,
            end_day: day_or_month(row.abstraction_period_end_day, "abstraction_period_end_day", row.id)?,
            end_month: day_or_month(row.abstraction_period_end_month, "abstraction_period_end_month", row.id)?,
        };

        Ok(ChargeElement {
            id: row.id,
            description: row.description,
            authorised_annual_quantity: row.authorised_annual_quantity,
            abstraction_period,
            annual_charge: row.annual_charge,
        })
    }
}

/// Billing accounts, in account number order, with the charge versions the
/// run should consider for `billing_period`:
///
/// - annual: every current charge version of the scheme in the region
/// - supplementary: only licences flagged for the scheme's supplementary billing
/// - two-part tariff: only licences in the run's review, with amended
///   allocations attached
///
/// Licences in the same scope that were billed to an account in a sent run
/// for the period but no longer have a charge version in it are attached as
/// `previously_billed_licences`.
pub async fn fetch_for_billing_period(
    pool: &PgPool,
    bill_run: &BillRun,
    billing_period: &BillingPeriod,
) -> RepoResult<Vec<BillingAccount>> {
    let charge_versions = sqlx::query_as::<_, ChargeVersionRow>(
        r#"
        SELECT cv.id, cv.scheme, cv.start_date, cv.end_date,
               cv.billing_account_id, ba.account_number,
               l.id AS licence_id, l.licence_ref, l.region_id,
               l.revoked_date, l.lapsed_date, l.expired_date,
               l.include_in_sroc_billing, l.include_in_presroc_billing,
               l.include_in_sroc_tpt_billing
        FROM charge_versions cv
        INNER JOIN licences l ON l.id = cv.licence_id
        INNER JOIN billing_accounts ba ON ba.id = cv.billing_account_id
        WHERE cv.scheme = $1
          AND l.region_id = $2
          AND cv.status = 'current'
          AND cv.start_date <= $4
          AND (cv.end_date IS NULL OR cv.end_date >= $3)
          AND (
            $5 = 'annual'
            OR ($5 = 'supplementary' AND (
                (cv.scheme = 'sroc' AND l.include_in_sroc_billing)
                OR (cv.scheme = 'presroc' AND l.include_in_presroc_billing)
            ))
            OR ($5 = 'two_part_tariff' AND EXISTS (
                SELECT 1 FROM review_licences rl
                WHERE rl.bill_run_id = $6 AND rl.licence_id = l.id
            ))
          )
        ORDER BY ba.account_number, l.licence_ref, cv.start_date
        "#,
    )
    .bind(bill_run.scheme.as_str())
    .bind(bill_run.region_id)
    .bind(billing_period.start_date)
    .bind(billing_period.end_date)
    .bind(bill_run.batch_type.as_str())
    .bind(bill_run.id)
    .fetch_all(pool)
    .await?;

    let previously_billed = sqlx::query_as::<_, PreviouslyBilledRow>(
        r#"
        SELECT DISTINCT b.billing_account_id, b.account_number,
               l.id AS licence_id, l.licence_ref, l.region_id,
               l.revoked_date, l.lapsed_date, l.expired_date,
               l.include_in_sroc_billing, l.include_in_presroc_billing,
               l.include_in_sroc_tpt_billing
        FROM transactions t
        INNER JOIN bill_licences bl ON bl.id = t.bill_licence_id
        INNER JOIN bills b ON b.id = bl.bill_id
        INNER JOIN bill_runs br ON br.id = b.bill_run_id
        INNER JOIN licences l ON l.id = bl.licence_id
        WHERE br.status = 'sent'
          AND br.scheme = $1
          AND l.region_id = $2
          AND b.financial_year_ending = $3
          AND t.two_part_tariff = $4
          AND (
            $5 = 'annual'
            OR ($5 = 'supplementary' AND (
                ($1 = 'sroc' AND l.include_in_sroc_billing)
                OR ($1 = 'presroc' AND l.include_in_presroc_billing)
            ))
            OR ($5 = 'two_part_tariff' AND EXISTS (
                SELECT 1 FROM review_licences rl
                WHERE rl.bill_run_id = $6 AND rl.licence_id = l.id
            ))
          )
        ORDER BY b.account_number, l.licence_ref
        "#,
    )
    .bind(bill_run.scheme.as_str())
    .bind(bill_run.region_id)
    .bind(billing_period.financial_year_ending())
    .bind(bill_run.batch_type == BatchType::TwoPartTariff)
    .bind(bill_run.batch_type.as_str())
    .bind(bill_run.id)
    .fetch_all(pool)
    .await?;

    if charge_versions.is_empty() && previously_billed.is_empty() {
        return Ok(Vec::new());
    }

    let charge_version_ids: Vec<Uuid> = charge_versions.iter().map(|cv| cv.id).collect();

    let reference_rows = sqlx::query_as::<_, ChargeReferenceRow>(
        r#"
        SELECT id, charge_version_id, charge_category_code, description,
               aggregate_factor, adjustment_factor, section_126_factor,
               section_127_agreement, section_130_agreement, winter_only,
               supported_source_name, water_company_charge
        FROM charge_references
        WHERE charge_version_id = ANY($1)
        ORDER BY charge_category_code, id
        "#,
    )
    .bind(&charge_version_ids)
    .fetch_all(pool)
    .await?;

    let reference_ids: Vec<Uuid> = reference_rows.iter().map(|r| r.id).collect();

    let element_rows = sqlx::query_as::<_, ChargeElementRow>(
        r#"
        SELECT id, charge_reference_id, description, authorised_annual_quantity,
               abstraction_period_start_day, abstraction_period_start_month,
               abstraction_period_end_day, abstraction_period_end_month,
               annual_charge
        FROM charge_elements
        WHERE charge_reference_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(&reference_ids)
    .fetch_all(pool)
    .await?;

    let mut reviewed: HashMap<Uuid, ReviewedAllocation> = HashMap::new();
    if bill_run.batch_type == BatchType::TwoPartTariff {
        for row in review_repo::fetch_amended_allocations(pool, bill_run.id).await? {
            reviewed
                .entry(row.charge_version_id)
                .or_default()
                .amended_allocations
                .insert(row.charge_element_id, row.amended_allocated);
        }
    }

    assemble(charge_versions, previously_billed, reference_rows, element_rows, reviewed)
}

fn assemble(
    charge_versions: Vec<ChargeVersionRow>,
    previously_billed: Vec<PreviouslyBilledRow>,
    reference_rows: Vec<ChargeReferenceRow>,
    element_rows: Vec<ChargeElementRow>,
    mut reviewed: HashMap<Uuid, ReviewedAllocation>,
) -> RepoResult<Vec<BillingAccount>> {
    let mut elements_by_reference: HashMap<Uuid, Vec<ChargeElement>> = HashMap::new();
    for row in element_rows {
        let reference_id = row.charge_reference_id;
        elements_by_reference
            .entry(reference_id)
            .or_default()
            .push(row.try_into()?);
    }

    let mut references_by_version: HashMap<Uuid, Vec<ChargeReference>> = HashMap::new();
    for row in reference_rows {
        let charge_elements = elements_by_reference.remove(&row.id).unwrap_or_default();
        references_by_version
            .entry(row.charge_version_id)
            .or_default()
            .push(ChargeReference {
                id: row.id,
                charge_category_code: row.charge_category_code,
                description: row.description,
                factors: ChargeFactors {
                    aggregate_factor: row.aggregate_factor,
                    adjustment_factor: row.adjustment_factor,
                    section_126_factor: row.section_126_factor,
                    section_127_agreement: row.section_127_agreement,
                    section_130_agreement: row.section_130_agreement,
                    winter_only: row.winter_only,
                    supported_source_name: row.supported_source_name,
                    water_company_charge: row.water_company_charge,
                },
                charge_elements,
            });
    }

    let mut accounts: Vec<BillingAccount> = Vec::new();
    let mut account_index: HashMap<Uuid, usize> = HashMap::new();

    for row in charge_versions {
        let scheme = Scheme::from_str(&row.scheme).ok_or_else(|| {
            RepoError::InvalidData(format!("charge version scheme '{}'", row.scheme))
        })?;

        let charge_version = ChargeVersion {
            id: row.id,
            scheme,
            start_date: row.start_date,
            end_date: row.end_date,
            licence: Licence {
                id: row.licence_id,
                licence_ref: row.licence_ref,
                region_id: row.region_id,
                revoked_date: row.revoked_date,
                lapsed_date: row.lapsed_date,
                expired_date: row.expired_date,
                include_in_sroc_billing: row.include_in_sroc_billing,
                include_in_presroc_billing: row.include_in_presroc_billing,
                include_in_sroc_tpt_billing: row.include_in_sroc_tpt_billing,
            },
            charge_references: references_by_version.remove(&row.id).unwrap_or_default(),
            reviewed_allocation: reviewed.remove(&row.id),
        };

        let index = *account_index.entry(row.billing_account_id).or_insert_with(|| {
            accounts.push(BillingAccount {
                id: row.billing_account_id,
                account_number: row.account_number.clone(),
                charge_versions: Vec::new(),
                previously_billed_licences: Vec::new(),
            });
            accounts.len() - 1
        });
        accounts[index].charge_versions.push(charge_version);
    }

    let mut appended = false;
    for row in previously_billed {
        let index = match account_index.get(&row.billing_account_id) {
            Some(index) => *index,
            None => {
                appended = true;
                accounts.push(BillingAccount {
                    id: row.billing_account_id,
                    account_number: row.account_number.clone(),
                    charge_versions: Vec::new(),
                    previously_billed_licences: Vec::new(),
                });
                account_index.insert(row.billing_account_id, accounts.len() - 1);
                accounts.len() - 1
            }
        };

        let account = &mut accounts[index];
        let has_charge_version = account
            .charge_versions
            .iter()
            .any(|cv| cv.licence.id == row.licence_id);
        let already_listed = account
            .previously_billed_licences
            .iter()
            .any(|licence| licence.id == row.licence_id);
        if !has_charge_version && !already_listed {
            account.previously_billed_licences.push(row.into());
        }
    }

    if appended {
        accounts.sort_by(|a, b| a.account_number.cmp(&b.account_number));
    }

    Ok(accounts)
}
