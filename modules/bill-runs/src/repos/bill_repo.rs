//! Repository for bills and bill licences

use sqlx::{Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::RepoResult;
use crate::models::{Bill, BillLicence};

/// Rows per multi-row INSERT; keeps bind parameters well under the
/// Postgres limit of 65535
pub(crate) const INSERT_CHUNK_SIZE: usize = 1000;

/// Bulk insert bills
pub async fn insert_bills(tx: &mut Transaction<'_, Postgres>, bills: &[Bill]) -> RepoResult<()> {
    for chunk in bills.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO bills (id, bill_run_id, billing_account_id, account_number, \
             financial_year_ending, credit, net_amount) ",
        );
        builder.push_values(chunk, |mut row, bill| {
            row.push_bind(bill.id)
                .push_bind(bill.bill_run_id)
                .push_bind(bill.billing_account_id)
                .push_bind(bill.account_number.clone())
                .push_bind(bill.financial_year_ending)
                .push_bind(bill.credit)
                .push_bind(bill.net_amount);
        });
        builder.build().execute(&mut **tx).await?;
    }

    Ok(())
}

/// Bulk insert bill licences
pub async fn insert_bill_licences(
    tx: &mut Transaction<'_, Postgres>,
    bill_licences: &[BillLicence],
) -> RepoResult<()> {
    for chunk in bill_licences.chunks(INSERT_CHUNK_SIZE) {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO bill_licences (id, bill_id, licence_id, licence_ref) ");
        builder.push_values(chunk, |mut row, bill_licence| {
            row.push_bind(bill_licence.id)
                .push_bind(bill_licence.bill_id)
                .push_bind(bill_licence.licence_id)
                .push_bind(bill_licence.licence_ref.clone());
        });
        builder.build().execute(&mut **tx).await?;
    }

    Ok(())
}

/// Delete every transaction, bill licence and bill of a bill run, children
/// first
pub async fn delete_for_bill_run(
    tx: &mut Transaction<'_, Postgres>,
    bill_run_id: Uuid,
) -> RepoResult<()> {
    sqlx::query(
        r#"
        DELETE FROM transactions
        WHERE bill_licence_id IN (
            SELECT bl.id
            FROM bill_licences bl
            INNER JOIN bills b ON b.id = bl.bill_id
            WHERE b.bill_run_id = $1
        )
        "#,
    )
    .bind(bill_run_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM bill_licences
        WHERE bill_id IN (SELECT id FROM bills WHERE bill_run_id = $1)
        "#,
    )
    .bind(bill_run_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM bills WHERE bill_run_id = $1")
        .bind(bill_run_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
