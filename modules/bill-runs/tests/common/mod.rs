//! Common test utilities for bill run integration tests
//!
//! Builders for charge data shared by the scenario tests, and a singleton
//! Postgres pool for the repository tests. The pool is only created when
//! `DATABASE_URL` is set; Postgres tests return early otherwise.

#![allow(dead_code)]

use bill_runs_rs::db::{init_pool, PoolSettings};
use bill_runs_rs::models::{
    AbstractionPeriod, BatchType, BillRun, BillingAccount, ChargeElement, ChargeFactors,
    ChargeReference, ChargeVersion, Licence, Scheme,
};
use bill_runs_rs::state_machine::BillRunStatus;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use uuid::Uuid;

static TEST_POOL: OnceCell<Option<PgPool>> = OnceCell::const_new();

/// Shared pool with migrations applied, or None without `DATABASE_URL`
pub async fn get_test_pool() -> Option<PgPool> {
    TEST_POOL
        .get_or_init(|| async {
            let database_url = std::env::var("DATABASE_URL").ok()?;
            let settings = PoolSettings {
                max_connections: 2,
                ..PoolSettings::default()
            };
            let pool = init_pool(&database_url, &settings)
                .await
                .expect("Failed to initialize test pool");
            sqlx::migrate!("./db/migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");
            Some(pool)
        })
        .await
        .clone()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn licence(region_id: Uuid, licence_ref: &str) -> Licence {
    Licence {
        id: Uuid::new_v4(),
        licence_ref: licence_ref.to_string(),
        region_id,
        revoked_date: None,
        lapsed_date: None,
        expired_date: None,
        include_in_sroc_billing: false,
        include_in_presroc_billing: false,
        include_in_sroc_tpt_billing: false,
    }
}

pub fn element(annual_charge: i64) -> ChargeElement {
    ChargeElement {
        id: Uuid::new_v4(),
        description: "Spray irrigation direct".to_string(),
        authorised_annual_quantity: Decimal::new(100, 0),
        abstraction_period: AbstractionPeriod::ALL_YEAR,
        annual_charge,
    }
}

/// Current-scheme charge version open from April 2020 with one reference
/// and one all-year element
pub fn charge_version(licence: &Licence, category: &str, annual_charge: i64) -> ChargeVersion {
    ChargeVersion {
        id: Uuid::new_v4(),
        scheme: Scheme::Sroc,
        start_date: date(2020, 4, 1),
        end_date: None,
        licence: licence.clone(),
        charge_references: vec![ChargeReference {
            id: Uuid::new_v4(),
            charge_category_code: category.to_string(),
            description: format!("Charge reference {category}"),
            factors: ChargeFactors::default(),
            charge_elements: vec![element(annual_charge)],
        }],
        reviewed_allocation: None,
    }
}

pub fn billing_account(account_number: &str, charge_versions: Vec<ChargeVersion>) -> BillingAccount {
    BillingAccount {
        id: Uuid::new_v4(),
        account_number: account_number.to_string(),
        charge_versions,
        previously_billed_licences: Vec::new(),
    }
}

pub fn bill_run(
    region_id: Uuid,
    batch_type: BatchType,
    status: BillRunStatus,
    to_financial_year_ending: i32,
) -> BillRun {
    BillRun {
        id: Uuid::new_v4(),
        region_id,
        scheme: Scheme::Sroc,
        batch_type,
        status,
        to_financial_year_ending,
        error_code: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
