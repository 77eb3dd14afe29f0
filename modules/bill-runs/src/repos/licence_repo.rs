//! Repository for licence rebill flags
//!
//! The engine never owns a licence; it only raises or clears the flags that
//! put a licence into the next run of a given kind.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::RepoResult;
use crate::models::Scheme;

/// Flag a licence for the next two-part tariff run. Returns the licence
/// reference, or None if the licence does not exist.
pub async fn flag_for_two_part_tariff_billing(
    tx: &mut Transaction<'_, Postgres>,
    licence_id: Uuid,
) -> RepoResult<Option<String>> {
    let licence_ref = sqlx::query_scalar::<_, String>(
        r#"
        UPDATE licences
        SET include_in_sroc_tpt_billing = TRUE,
            updated_at = NOW()
        WHERE id = $1
        RETURNING licence_ref
        "#,
    )
    .bind(licence_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(licence_ref)
}

/// Clear the supplementary flag of the given scheme on every licence with a
/// bill licence in the run
pub async fn unflag_billed_licences(
    pool: &PgPool,
    bill_run_id: Uuid,
    scheme: Scheme,
) -> RepoResult<u64> {
    let sql = match scheme {
        Scheme::Sroc => {
            r#"
            UPDATE licences
            SET include_in_sroc_billing = FALSE,
                updated_at = NOW()
            WHERE include_in_sroc_billing
              AND id IN (
                SELECT bl.licence_id
                FROM bill_licences bl
                INNER JOIN bills b ON b.id = bl.bill_id
                WHERE b.bill_run_id = $1
              )
            "#
        }
        Scheme::Presroc => {
            r#"
            UPDATE licences
            SET include_in_presroc_billing = FALSE,
                updated_at = NOW()
            WHERE include_in_presroc_billing
              AND id IN (
                SELECT bl.licence_id
                FROM bill_licences bl
                INNER JOIN bills b ON b.id = bl.bill_id
                WHERE b.bill_run_id = $1
              )
            "#
        }
    };

    let result = sqlx::query(sql).bind(bill_run_id).execute(pool).await?;

    Ok(result.rows_affected())
}

/// Clear the supplementary flag of the given scheme on licences in the
/// region that were flagged before `flagged_before` and have no bill
/// licence in the run. These licences were considered by the run but netted
/// to nothing.
pub async fn unflag_unbilled_licences(
    pool: &PgPool,
    bill_run_id: Uuid,
    region_id: Uuid,
    scheme: Scheme,
    flagged_before: DateTime<Utc>,
) -> RepoResult<u64> {
    let sql = match scheme {
        Scheme::Sroc => {
            r#"
            UPDATE licences
            SET include_in_sroc_billing = FALSE,
                updated_at = NOW()
            WHERE include_in_sroc_billing
              AND region_id = $2
              AND updated_at <= $3
              AND id NOT IN (
                SELECT bl.licence_id
                FROM bill_licences bl
                INNER JOIN bills b ON b.id = bl.bill_id
                WHERE b.bill_run_id = $1
              )
            "#
        }
        Scheme::Presroc => {
            r#"
            UPDATE licences
            SET include_in_presroc_billing = FALSE,
                updated_at = NOW()
            WHERE include_in_presroc_billing
              AND region_id = $2
              AND updated_at <= $3
              AND id NOT IN (
                SELECT bl.licence_id
                FROM bill_licences bl
                INNER JOIN bills b ON b.id = bl.bill_id
                WHERE b.bill_run_id = $1
              )
            "#
        }
    };

    let result = sqlx::query(sql)
        .bind(bill_run_id)
        .bind(region_id)
        .bind(flagged_before)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
