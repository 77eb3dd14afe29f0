//! Transaction generation
//!
//! Pure functions turning one charge version into transaction lines for a
//! billing period: one line per charge reference and charge element, with
//! the element's full-year charge proportioned by billable days and, for
//! two-part tariff, by the reviewed allocated volume.

use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use crate::models::{
    AbstractionPeriod, BillingPeriod, ChargeElement, ChargePeriod, ChargeReference, ChargeVersion,
    Transaction,
};

/// Malformed charge data found while generating transactions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("Charge reference {0} has no charge category code")]
    MissingChargeCategory(Uuid),

    #[error("Charge element {0} has an invalid abstraction period")]
    InvalidAbstractionPeriod(Uuid),

    #[error("Charge element {element_id} has a negative {field}")]
    NegativeValue { element_id: Uuid, field: &'static str },

    #[error("Charge version {0} has no reviewed allocation")]
    MissingReviewedAllocation(Uuid),

    #[error("Charge element {0} has no reviewed allocation")]
    MissingElementAllocation(Uuid),

    #[error("Charge element {0} has an allocation but no authorised quantity")]
    ZeroAuthorisedQuantity(Uuid),

    #[error("Charge for element {0} is out of range")]
    AmountOutOfRange(Uuid),
}

impl AbstractionPeriod {
    pub fn is_valid(&self) -> bool {
        // 2024 is a leap year, so 29 February is accepted
        NaiveDate::from_ymd_opt(2024, self.start_month, self.start_day).is_some()
            && NaiveDate::from_ymd_opt(2024, self.end_month, self.end_day).is_some()
    }

    /// Whether `date` falls inside the period in its year
    pub fn contains(&self, date: NaiveDate) -> bool {
        let day = (date.month(), date.day());
        let start = (self.start_month, self.start_day);
        let end = (self.end_month, self.end_day);

        if start <= end {
            start <= day && day <= end
        } else {
            day >= start || day <= end
        }
    }

    /// Days between `start` and `end` inclusive that fall inside the period
    pub fn days_within(&self, start: NaiveDate, end: NaiveDate) -> i32 {
        start
            .iter_days()
            .take_while(|date| *date <= end)
            .filter(|date| self.contains(*date))
            .count() as i32
    }
}

/// Generate the transactions for one charge version
///
/// Elements with no billable days, and two-part tariff elements with a
/// zero allocation, produce no line. Every line is a debit.
pub fn generate_transactions(
    bill_licence_id: Uuid,
    charge_version: &ChargeVersion,
    billing_period: &BillingPeriod,
    charge_period: &ChargePeriod,
    two_part_tariff: bool,
) -> Result<Vec<Transaction>, GenerationError> {
    let allocation = if two_part_tariff {
        Some(
            charge_version
                .reviewed_allocation
                .as_ref()
                .ok_or(GenerationError::MissingReviewedAllocation(charge_version.id))?,
        )
    } else {
        None
    };

    let mut transactions = Vec::new();

    for reference in &charge_version.charge_references {
        if reference.charge_category_code.trim().is_empty() {
            return Err(GenerationError::MissingChargeCategory(reference.id));
        }

        for element in &reference.charge_elements {
            validate_element(element)?;

            let authorised_days = element
                .abstraction_period
                .days_within(billing_period.start_date, billing_period.end_date);
            let billable_days = element
                .abstraction_period
                .days_within(charge_period.start_date, charge_period.end_date);
            if billable_days == 0 {
                continue;
            }

            let time_portion = Decimal::from(billable_days) / Decimal::from(authorised_days);

            let (volume, portion) = match allocation {
                None => (element.authorised_annual_quantity, time_portion),
                Some(allocation) => {
                    let allocated = *allocation
                        .amended_allocations
                        .get(&element.id)
                        .ok_or(GenerationError::MissingElementAllocation(element.id))?;
                    if allocated.is_sign_negative() {
                        return Err(GenerationError::NegativeValue {
                            element_id: element.id,
                            field: "allocated volume",
                        });
                    }
                    if allocated.is_zero() {
                        continue;
                    }
                    if element.authorised_annual_quantity.is_zero() {
                        return Err(GenerationError::ZeroAuthorisedQuantity(element.id));
                    }
                    let volume_portion = allocated / element.authorised_annual_quantity;
                    (allocated, time_portion * volume_portion)
                }
            };

            let net_amount = proportion_charge(element, portion)?;

            transactions.push(build_transaction(
                bill_licence_id,
                charge_version,
                reference,
                element,
                charge_period,
                authorised_days,
                billable_days,
                volume,
                net_amount,
                two_part_tariff,
            ));
        }
    }

    Ok(transactions)
}

fn validate_element(element: &ChargeElement) -> Result<(), GenerationError> {
    if !element.abstraction_period.is_valid() {
        return Err(GenerationError::InvalidAbstractionPeriod(element.id));
    }
    if element.annual_charge < 0 {
        return Err(GenerationError::NegativeValue {
            element_id: element.id,
            field: "annual charge",
        });
    }
    if element.authorised_annual_quantity.is_sign_negative() {
        return Err(GenerationError::NegativeValue {
            element_id: element.id,
            field: "authorised annual quantity",
        });
    }
    Ok(())
}

/// Full-year charge times `portion`, rounded half away from zero to pence
fn proportion_charge(element: &ChargeElement, portion: Decimal) -> Result<i64, GenerationError> {
    Decimal::from(element.annual_charge)
        .checked_mul(portion)
        .map(|amount| amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|amount| amount.to_i64())
        .ok_or(GenerationError::AmountOutOfRange(element.id))
}

fn build_transaction(
    bill_licence_id: Uuid,
    charge_version: &ChargeVersion,
    reference: &ChargeReference,
    element: &ChargeElement,
    charge_period: &ChargePeriod,
    authorised_days: i32,
    billable_days: i32,
    volume: Decimal,
    net_amount: i64,
    two_part_tariff: bool,
) -> Transaction {
    let description = if two_part_tariff {
        format!(
            "Two-part tariff second part water abstraction charge: {}",
            reference.description
        )
    } else {
        format!("Water abstraction charge: {}", reference.description)
    };

    Transaction {
        id: Uuid::new_v4(),
        bill_licence_id,
        charge_reference_id: Some(reference.id),
        charge_element_id: Some(element.id),
        charge_category_code: reference.charge_category_code.clone(),
        description,
        start_date: charge_period.start_date,
        end_date: charge_period.end_date,
        authorised_days,
        billable_days,
        volume,
        credit: false,
        net_amount,
        factors: reference.factors.clone(),
        two_part_tariff,
        scheme: charge_version.scheme,
        external_id: None,
    }
}
