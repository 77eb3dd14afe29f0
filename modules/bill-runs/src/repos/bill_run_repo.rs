//! Repository for bill run rows and their status

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{BusyFlags, RepoError, RepoResult};
use crate::models::{BatchType, BillRun, BillRunErrorCode, NewBillRun, Scheme};
use crate::state_machine::{BillRunStatus, StatusTransition};

#[derive(Debug, Clone, FromRow)]
struct BillRunRow {
    id: Uuid,
    region_id: Uuid,
    scheme: String,
    batch_type: String,
    status: String,
    to_financial_year_ending: i32,
    error_code: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BillRunRow> for BillRun {
    type Error = RepoError;

    fn try_from(row: BillRunRow) -> Result<Self, Self::Error> {
        let scheme = Scheme::from_str(&row.scheme)
            .ok_or_else(|| RepoError::InvalidData(format!("bill run scheme '{}'", row.scheme)))?;
        let batch_type = BatchType::from_str(&row.batch_type).ok_or_else(|| {
            RepoError::InvalidData(format!("bill run batch type '{}'", row.batch_type))
        })?;
        let status = BillRunStatus::from_str(&row.status)
            .ok_or_else(|| RepoError::InvalidData(format!("bill run status '{}'", row.status)))?;

        Ok(BillRun {
            id: row.id,
            region_id: row.region_id,
            scheme,
            batch_type,
            status,
            to_financial_year_ending: row.to_financial_year_ending,
            error_code: row.error_code.and_then(BillRunErrorCode::from_code),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const BILL_RUN_COLUMNS: &str = "id, region_id, scheme, batch_type, status, \
    to_financial_year_ending, error_code, created_at, updated_at";

/// Insert a new bill run in `queued`
pub async fn insert(pool: &PgPool, new_bill_run: &NewBillRun) -> RepoResult<BillRun> {
    let row = sqlx::query_as::<_, BillRunRow>(&format!(
        r#"
        INSERT INTO bill_runs (id, region_id, scheme, batch_type, status, to_financial_year_ending)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {BILL_RUN_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(new_bill_run.region_id)
    .bind(new_bill_run.scheme.as_str())
    .bind(new_bill_run.batch_type.as_str())
    .bind(BillRunStatus::Queued.as_str())
    .bind(new_bill_run.to_financial_year_ending)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

pub async fn find_by_id(pool: &PgPool, bill_run_id: Uuid) -> RepoResult<Option<BillRun>> {
    let row = sqlx::query_as::<_, BillRunRow>(&format!(
        "SELECT {BILL_RUN_COLUMNS} FROM bill_runs WHERE id = $1"
    ))
    .bind(bill_run_id)
    .fetch_optional(pool)
    .await?;

    row.map(BillRun::try_from).transpose()
}

pub async fn ids_with_status(pool: &PgPool, status: BillRunStatus) -> RepoResult<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT id
        FROM bill_runs
        WHERE status = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

pub async fn fetch_busy_flags(pool: &PgPool) -> RepoResult<BusyFlags> {
    let building_statuses: Vec<String> = BillRunStatus::BUILDING
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();

    let (building, cancelling) = sqlx::query_as::<_, (bool, bool)>(
        r#"
        SELECT
            EXISTS (SELECT 1 FROM bill_runs WHERE status = ANY($1)) AS building,
            EXISTS (SELECT 1 FROM bill_runs WHERE status = $2) AS cancelling
        "#,
    )
    .bind(&building_statuses)
    .bind(BillRunStatus::Cancel.as_str())
    .fetch_one(pool)
    .await?;

    Ok(BusyFlags {
        building,
        cancelling,
    })
}

/// Compare-and-set the status. Returns false if the run was not in
/// `transition.from()`.
pub async fn apply_transition(
    pool: &PgPool,
    bill_run_id: Uuid,
    transition: StatusTransition,
    error_code: Option<BillRunErrorCode>,
) -> RepoResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE bill_runs
        SET status = $3,
            error_code = COALESCE($4, error_code),
            updated_at = NOW()
        WHERE id = $1
          AND status = $2
        "#,
    )
    .bind(bill_run_id)
    .bind(transition.from().as_str())
    .bind(transition.to().as_str())
    .bind(error_code.map(|c| c.code()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Same as [`apply_transition`] inside an open transaction
pub async fn apply_transition_tx(
    tx: &mut Transaction<'_, Postgres>,
    bill_run_id: Uuid,
    transition: StatusTransition,
    error_code: Option<BillRunErrorCode>,
) -> RepoResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE bill_runs
        SET status = $3,
            error_code = COALESCE($4, error_code),
            updated_at = NOW()
        WHERE id = $1
          AND status = $2
        "#,
    )
    .bind(bill_run_id)
    .bind(transition.from().as_str())
    .bind(transition.to().as_str())
    .bind(error_code.map(|c| c.code()))
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Lock the run row for the rest of the transaction and return its status
pub async fn lock_status(
    tx: &mut Transaction<'_, Postgres>,
    bill_run_id: Uuid,
) -> RepoResult<Option<BillRunStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM bill_runs WHERE id = $1 FOR UPDATE")
            .bind(bill_run_id)
            .fetch_optional(&mut **tx)
            .await?;

    status
        .map(|s| {
            BillRunStatus::from_str(&s)
                .ok_or_else(|| RepoError::InvalidData(format!("bill run status '{s}'")))
        })
        .transpose()
}
