//! Repository for charge transactions

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction as PgTransaction};
use uuid::Uuid;

use super::bill_repo::INSERT_CHUNK_SIZE;
use super::{PreviousTransactionQuery, RepoError, RepoResult};
use crate::models::{ChargeFactors, Scheme, Transaction};
use crate::state_machine::BillRunStatus;

#[derive(Debug, Clone, FromRow)]
struct TransactionRow {
    id: Uuid,
    bill_licence_id: Uuid,
    charge_reference_id: Option<Uuid>,
    charge_element_id: Option<Uuid>,
    charge_category_code: String,
    description: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    authorised_days: i32,
    billable_days: i32,
    volume: Decimal,
    credit: bool,
    net_amount: i64,
    aggregate_factor: Decimal,
    adjustment_factor: Decimal,
    section_126_factor: Decimal,
    section_127_agreement: bool,
    section_130_agreement: bool,
    winter_only: bool,
    supported_source_name: Option<String>,
    water_company_charge: bool,
    two_part_tariff: bool,
    scheme: String,
    external_id: Option<String>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = RepoError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let scheme = Scheme::from_str(&row.scheme)
            .ok_or_else(|| RepoError::InvalidData(format!("transaction scheme '{}'", row.scheme)))?;

        Ok(Transaction {
            id: row.id,
            bill_licence_id: row.bill_licence_id,
            charge_reference_id: row.charge_reference_id,
            charge_element_id: row.charge_element_id,
            charge_category_code: row.charge_category_code,
            description: row.description,
            start_date: row.start_date,
            end_date: row.end_date,
            authorised_days: row.authorised_days,
            billable_days: row.billable_days,
            volume: row.volume,
            credit: row.credit,
            net_amount: row.net_amount,
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
            two_part_tariff: row.two_part_tariff,
            scheme,
            external_id: row.external_id,
        })
    }
}

/// Bulk insert transactions
pub async fn insert_transactions(
    tx: &mut PgTransaction<'_, Postgres>,
    transactions: &[Transaction],
) -> RepoResult<()> {
    for chunk in transactions.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO transactions (id, bill_licence_id, charge_reference_id, charge_element_id, \
             charge_category_code, description, start_date, end_date, authorised_days, billable_days, \
             volume, credit, net_amount, aggregate_factor, adjustment_factor, section_126_factor, \
             section_127_agreement, section_130_agreement, winter_only, supported_source_name, \
             water_company_charge, two_part_tariff, scheme, external_id) ",
        );
        builder.push_values(chunk, |mut row, transaction| {
            let factors = &transaction.factors;
            row.push_bind(transaction.id)
                .push_bind(transaction.bill_licence_id)
                .push_bind(transaction.charge_reference_id)
                .push_bind(transaction.charge_element_id)
                .push_bind(transaction.charge_category_code.clone())
                .push_bind(transaction.description.clone())
                .push_bind(transaction.start_date)
                .push_bind(transaction.end_date)
                .push_bind(transaction.authorised_days)
                .push_bind(transaction.billable_days)
                .push_bind(transaction.volume)
                .push_bind(transaction.credit)
                .push_bind(transaction.net_amount)
                .push_bind(factors.aggregate_factor)
                .push_bind(factors.adjustment_factor)
                .push_bind(factors.section_126_factor)
                .push_bind(factors.section_127_agreement)
                .push_bind(factors.section_130_agreement)
                .push_bind(factors.winter_only)
                .push_bind(factors.supported_source_name.clone())
                .push_bind(factors.water_company_charge)
                .push_bind(transaction.two_part_tariff)
                .push_bind(transaction.scheme.as_str())
                .push_bind(transaction.external_id.clone());
        });
        builder.build().execute(&mut **tx).await?;
    }

    Ok(())
}

/// Transactions already charged to the customer for a licence on a billing
/// account in one financial year. Runs that never reached `sent` are ignored.
pub async fn fetch_previous_sent(
    pool: &PgPool,
    query: &PreviousTransactionQuery,
) -> RepoResult<Vec<Transaction>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT t.id, t.bill_licence_id, t.charge_reference_id, t.charge_element_id,
               t.charge_category_code, t.description, t.start_date, t.end_date,
               t.authorised_days, t.billable_days, t.volume, t.credit, t.net_amount,
               t.aggregate_factor, t.adjustment_factor, t.section_126_factor,
               t.section_127_agreement, t.section_130_agreement, t.winter_only,
               t.supported_source_name, t.water_company_charge, t.two_part_tariff,
               t.scheme, t.external_id
        FROM transactions t
        INNER JOIN bill_licences bl ON bl.id = t.bill_licence_id
        INNER JOIN bills b ON b.id = bl.bill_id
        INNER JOIN bill_runs br ON br.id = b.bill_run_id
        WHERE br.status = $1
          AND br.scheme = $2
          AND b.billing_account_id = $3
          AND bl.licence_id = $4
          AND b.financial_year_ending = $5
          AND t.two_part_tariff = $6
        ORDER BY br.created_at ASC, t.created_at ASC
        "#,
    )
    .bind(BillRunStatus::Sent.as_str())
    .bind(query.scheme.as_str())
    .bind(query.billing_account_id)
    .bind(query.licence_id)
    .bind(query.financial_year_ending)
    .bind(query.two_part_tariff)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Transaction::try_from).collect()
}
