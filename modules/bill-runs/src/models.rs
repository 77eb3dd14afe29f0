use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::state_machine::BillRunStatus;

// ============================================================================
// Bill Run
// ============================================================================

/// Charging scheme a bill run, charge version or transaction belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// Legacy scheme, financial years ending 2022 and earlier
    Presroc,
    /// Current scheme, financial years ending 2023 onwards
    Sroc,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Presroc => "presroc",
            Scheme::Sroc => "sroc",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "presroc" => Some(Scheme::Presroc),
            "sroc" => Some(Scheme::Sroc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Annual,
    Supplementary,
    TwoPartTariff,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Annual => "annual",
            BatchType::Supplementary => "supplementary",
            BatchType::TwoPartTariff => "two_part_tariff",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "annual" => Some(BatchType::Annual),
            "supplementary" => Some(BatchType::Supplementary),
            "two_part_tariff" => Some(BatchType::TwoPartTariff),
            _ => None,
        }
    }

    pub fn is_two_part_tariff(&self) -> bool {
        matches!(self, BatchType::TwoPartTariff)
    }
}

/// Classified reasons a bill run ends in `error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillRunErrorCode {
    FailedToPopulateChargeVersions,
    FailedToProcessChargeVersions,
    FailedToPrepareTransactions,
    FailedToCreateCharge,
}

impl BillRunErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            BillRunErrorCode::FailedToPopulateChargeVersions => 10,
            BillRunErrorCode::FailedToProcessChargeVersions => 20,
            BillRunErrorCode::FailedToPrepareTransactions => 30,
            BillRunErrorCode::FailedToCreateCharge => 40,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            10 => Some(BillRunErrorCode::FailedToPopulateChargeVersions),
            20 => Some(BillRunErrorCode::FailedToProcessChargeVersions),
            30 => Some(BillRunErrorCode::FailedToPrepareTransactions),
            40 => Some(BillRunErrorCode::FailedToCreateCharge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillRun {
    pub id: Uuid,
    pub region_id: Uuid,
    pub scheme: Scheme,
    pub batch_type: BatchType,
    pub status: BillRunStatus,
    pub to_financial_year_ending: i32,
    pub error_code: Option<BillRunErrorCode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBillRun {
    pub region_id: Uuid,
    pub scheme: Scheme,
    pub batch_type: BatchType,
    pub to_financial_year_ending: i32,
}

// ============================================================================
// Periods
// ============================================================================

/// A financial year (1 April to 31 March) being billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl BillingPeriod {
    /// Billing period for the financial year ending 31 March of `year`
    pub fn for_financial_year_ending(year: i32) -> Option<Self> {
        Some(Self {
            start_date: NaiveDate::from_ymd_opt(year - 1, 4, 1)?,
            end_date: NaiveDate::from_ymd_opt(year, 3, 31)?,
        })
    }

    pub fn financial_year_ending(&self) -> i32 {
        self.end_date.year()
    }
}

/// The part of a billing period a charge version is chargeable for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargePeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Yearly window a licence may abstract in, by day and month. May wrap the
/// year end (e.g. 1 November to 31 March).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractionPeriod {
    pub start_day: u32,
    pub start_month: u32,
    pub end_day: u32,
    pub end_month: u32,
}

impl AbstractionPeriod {
    pub const ALL_YEAR: AbstractionPeriod = AbstractionPeriod {
        start_day: 1,
        start_month: 1,
        end_day: 31,
        end_month: 12,
    };
}

// ============================================================================
// Licences and charge data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Licence {
    pub id: Uuid,
    pub licence_ref: String,
    pub region_id: Uuid,
    pub revoked_date: Option<NaiveDate>,
    pub lapsed_date: Option<NaiveDate>,
    pub expired_date: Option<NaiveDate>,
    pub include_in_sroc_billing: bool,
    pub include_in_presroc_billing: bool,
    pub include_in_sroc_tpt_billing: bool,
}

/// Pre-computed adjustments carried from the charge reference onto each
/// transaction. Their effect on the charge is already reflected in the
/// element's annual charge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChargeFactors {
    pub aggregate_factor: Decimal,
    pub adjustment_factor: Decimal,
    pub section_126_factor: Decimal,
    pub section_127_agreement: bool,
    pub section_130_agreement: bool,
    pub winter_only: bool,
    pub supported_source_name: Option<String>,
    pub water_company_charge: bool,
}

impl Default for ChargeFactors {
    fn default() -> Self {
        Self {
            aggregate_factor: Decimal::ONE,
            adjustment_factor: Decimal::ONE,
            section_126_factor: Decimal::ONE,
            section_127_agreement: false,
            section_130_agreement: false,
            winter_only: false,
            supported_source_name: None,
            water_company_charge: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeElement {
    pub id: Uuid,
    pub description: String,
    pub authorised_annual_quantity: Decimal,
    pub abstraction_period: AbstractionPeriod,
    /// Full-year charge for the element in pence
    pub annual_charge: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeReference {
    pub id: Uuid,
    pub charge_category_code: String,
    pub description: String,
    pub factors: ChargeFactors,
    pub charge_elements: Vec<ChargeElement>,
}

/// Operator-reviewed two-part tariff allocation for one charge version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewedAllocation {
    /// Amended allocated volume keyed by charge element id
    pub amended_allocations: HashMap<Uuid, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeVersion {
    pub id: Uuid,
    pub scheme: Scheme,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub licence: Licence,
    pub charge_references: Vec<ChargeReference>,
    pub reviewed_allocation: Option<ReviewedAllocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingAccount {
    pub id: Uuid,
    pub account_number: String,
    pub charge_versions: Vec<ChargeVersion>,
    /// Licences charged to this account in a sent run for the period that
    /// no longer have a charge version in it. Their sent lines are credited.
    #[serde(default)]
    pub previously_billed_licences: Vec<Licence>,
}

// ============================================================================
// Bills, bill licences and transactions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: Uuid,
    pub bill_run_id: Uuid,
    pub billing_account_id: Uuid,
    pub account_number: String,
    pub financial_year_ending: i32,
    pub credit: bool,
    /// Debits minus credits, in pence
    pub net_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillLicence {
    pub id: Uuid,
    pub bill_id: Uuid,
    pub licence_id: Uuid,
    pub licence_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub bill_licence_id: Uuid,
    pub charge_reference_id: Option<Uuid>,
    pub charge_element_id: Option<Uuid>,
    pub charge_category_code: String,
    pub description: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub authorised_days: i32,
    pub billable_days: i32,
    pub volume: Decimal,
    pub credit: bool,
    /// Always non-negative; `credit` carries the sign
    pub net_amount: i64,
    pub factors: ChargeFactors,
    pub two_part_tariff: bool,
    pub scheme: Scheme,
    pub external_id: Option<String>,
}

impl Transaction {
    /// Signed value in pence: debits positive, credits negative
    pub fn signed_amount(&self) -> i64 {
        if self.credit {
            -self.net_amount
        } else {
            self.net_amount
        }
    }
}

/// Everything one billing period of a bill run produced, ready to persist
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BillingPeriodOutput {
    pub bills: Vec<Bill>,
    pub bill_licences: Vec<BillLicence>,
    pub transactions: Vec<Transaction>,
}

impl BillingPeriodOutput {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
