//! Repository for two-part tariff review staging rows

use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{RepoResult, ReviewTable};

/// Which review licences a deletion step applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewScope {
    /// One licence within one bill run
    Licence { bill_run_id: Uuid, licence_id: Uuid },
    /// Every licence of a bill run
    BillRun { bill_run_id: Uuid },
}

impl ReviewScope {
    fn filter(&self) -> &'static str {
        match self {
            ReviewScope::Licence { .. } => "rl.bill_run_id = $1 AND rl.licence_id = $2",
            ReviewScope::BillRun { .. } => "rl.bill_run_id = $1",
        }
    }
}

/// DELETE statement for one step of the review cascade
pub fn delete_statement(table: ReviewTable, scope: &ReviewScope) -> String {
    let filter = scope.filter();

    match table {
        ReviewTable::ChargeElementReturns => format!(
            r#"
            DELETE FROM review_charge_element_returns
            WHERE review_return_id IN (
                SELECT rr.id
                FROM review_returns rr
                INNER JOIN review_licences rl ON rl.id = rr.review_licence_id
                WHERE {filter}
            )
            OR review_charge_element_id IN (
                SELECT rce.id
                FROM review_charge_elements rce
                INNER JOIN review_charge_references rcr ON rcr.id = rce.review_charge_reference_id
                INNER JOIN review_charge_versions rcv ON rcv.id = rcr.review_charge_version_id
                INNER JOIN review_licences rl ON rl.id = rcv.review_licence_id
                WHERE {filter}
            )
            "#
        ),
        ReviewTable::ChargeElements => format!(
            r#"
            DELETE FROM review_charge_elements
            WHERE review_charge_reference_id IN (
                SELECT rcr.id
                FROM review_charge_references rcr
                INNER JOIN review_charge_versions rcv ON rcv.id = rcr.review_charge_version_id
                INNER JOIN review_licences rl ON rl.id = rcv.review_licence_id
                WHERE {filter}
            )
            "#
        ),
        ReviewTable::ChargeReferences => format!(
            r#"
            DELETE FROM review_charge_references
            WHERE review_charge_version_id IN (
                SELECT rcv.id
                FROM review_charge_versions rcv
                INNER JOIN review_licences rl ON rl.id = rcv.review_licence_id
                WHERE {filter}
            )
            "#
        ),
        ReviewTable::ChargeVersions => format!(
            r#"
            DELETE FROM review_charge_versions
            WHERE review_licence_id IN (
                SELECT rl.id FROM review_licences rl WHERE {filter}
            )
            "#
        ),
        ReviewTable::Returns => format!(
            r#"
            DELETE FROM review_returns
            WHERE review_licence_id IN (
                SELECT rl.id FROM review_licences rl WHERE {filter}
            )
            "#
        ),
        ReviewTable::Licences => format!("DELETE FROM review_licences AS rl WHERE {filter}"),
    }
}

/// Execute one deletion step. Returns rows deleted.
pub async fn delete_step(
    tx: &mut Transaction<'_, Postgres>,
    table: ReviewTable,
    scope: &ReviewScope,
) -> RepoResult<u64> {
    let sql = delete_statement(table, scope);
    let query = match *scope {
        ReviewScope::Licence {
            bill_run_id,
            licence_id,
        } => sqlx::query(&sql).bind(bill_run_id).bind(licence_id),
        ReviewScope::BillRun { bill_run_id } => sqlx::query(&sql).bind(bill_run_id),
    };

    let result = query.execute(&mut **tx).await?;

    Ok(result.rows_affected())
}

pub async fn review_licence_exists(
    tx: &mut Transaction<'_, Postgres>,
    bill_run_id: Uuid,
    licence_id: Uuid,
) -> RepoResult<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM review_licences WHERE bill_run_id = $1 AND licence_id = $2
        )
        "#,
    )
    .bind(bill_run_id)
    .bind(licence_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(exists)
}

pub async fn count_for_bill_run(pool: &PgPool, bill_run_id: Uuid) -> RepoResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM review_licences WHERE bill_run_id = $1",
    )
    .bind(bill_run_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

pub async fn count_for_bill_run_tx(
    tx: &mut Transaction<'_, Postgres>,
    bill_run_id: Uuid,
) -> RepoResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM review_licences WHERE bill_run_id = $1",
    )
    .bind(bill_run_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(count)
}

/// Operator-amended allocation for one charge element of one charge version
#[derive(Debug, Clone, FromRow)]
pub struct AmendedAllocationRow {
    pub charge_version_id: Uuid,
    pub charge_element_id: Uuid,
    pub amended_allocated: Decimal,
}

pub async fn fetch_amended_allocations(
    pool: &PgPool,
    bill_run_id: Uuid,
) -> RepoResult<Vec<AmendedAllocationRow>> {
    let rows = sqlx::query_as::<_, AmendedAllocationRow>(
        r#"
        SELECT rcv.charge_version_id, rce.charge_element_id, rce.amended_allocated
        FROM review_charge_elements rce
        INNER JOIN review_charge_references rcr ON rcr.id = rce.review_charge_reference_id
        INNER JOIN review_charge_versions rcv ON rcv.id = rcr.review_charge_version_id
        INNER JOIN review_licences rl ON rl.id = rcv.review_licence_id
        WHERE rl.bill_run_id = $1
        "#,
    )
    .bind(bill_run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
