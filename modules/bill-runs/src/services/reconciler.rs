//! Previous transaction reconciliation
//!
//! Nets newly generated transactions for a licence against the ones already
//! sent to the customer for the same billing account and financial year, so
//! a supplementary rerun only charges the difference.

use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::models::{ChargeFactors, Transaction};

/// What makes two transaction lines "the same charge"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChargeShape {
    charge_category_code: String,
    authorised_days: i32,
    billable_days: i32,
    volume: Decimal,
    factors: ChargeFactors,
    two_part_tariff: bool,
    net_amount: i64,
}

impl ChargeShape {
    fn of(transaction: &Transaction) -> Self {
        Self {
            charge_category_code: transaction.charge_category_code.clone(),
            authorised_days: transaction.authorised_days,
            billable_days: transaction.billable_days,
            volume: transaction.volume.normalize(),
            factors: transaction.factors.clone(),
            two_part_tariff: transaction.two_part_tariff,
            net_amount: transaction.net_amount,
        }
    }
}

/// Final transactions for a licence after netting
///
/// 1. Previous credits first cancel previous debits of the same shape.
/// 2. Each new line cancels one outstanding previous debit of the same shape.
/// 3. Unmatched new lines are returned unchanged, followed by one reversal
///    per outstanding previous line, attached to `bill_licence_id`.
pub fn reconcile(
    previous_sent: &[Transaction],
    generated: Vec<Transaction>,
    bill_licence_id: Uuid,
) -> Vec<Transaction> {
    let mut outstanding: Vec<Option<&Transaction>> = previous_sent.iter().map(Some).collect();
    let mut open_debits: HashMap<ChargeShape, VecDeque<usize>> = HashMap::new();

    for (index, transaction) in previous_sent.iter().enumerate() {
        if !transaction.credit {
            open_debits
                .entry(ChargeShape::of(transaction))
                .or_default()
                .push_back(index);
        }
    }

    for (index, transaction) in previous_sent.iter().enumerate() {
        if transaction.credit {
            if let Some(debit) = take_match(&mut open_debits, &ChargeShape::of(transaction)) {
                outstanding[debit] = None;
                outstanding[index] = None;
            }
        }
    }

    let mut result = Vec::new();
    for transaction in generated {
        match take_match(&mut open_debits, &ChargeShape::of(&transaction)) {
            Some(debit) => outstanding[debit] = None,
            None => result.push(transaction),
        }
    }

    result.extend(
        outstanding
            .into_iter()
            .flatten()
            .map(|previous| reverse(previous, bill_licence_id)),
    );

    result
}

fn take_match(open: &mut HashMap<ChargeShape, VecDeque<usize>>, shape: &ChargeShape) -> Option<usize> {
    open.get_mut(shape).and_then(|indexes| indexes.pop_front())
}

fn reverse(previous: &Transaction, bill_licence_id: Uuid) -> Transaction {
    Transaction {
        id: Uuid::new_v4(),
        bill_licence_id,
        credit: !previous.credit,
        external_id: None,
        ..previous.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scheme;
    use chrono::NaiveDate;

    fn debit(category: &str, net_amount: i64) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            bill_licence_id: Uuid::new_v4(),
            charge_reference_id: Some(Uuid::new_v4()),
            charge_element_id: Some(Uuid::new_v4()),
            charge_category_code: category.to_string(),
            description: "Water abstraction charge".to_string(),
            start_date: NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            authorised_days: 366,
            billable_days: 366,
            volume: Decimal::new(100, 0),
            credit: false,
            net_amount,
            factors: ChargeFactors::default(),
            two_part_tariff: false,
            scheme: Scheme::Sroc,
            external_id: Some("ext".to_string()),
        }
    }

    #[test]
    fn test_identical_sets_cancel_out() {
        let previous = vec![debit("4.5.6", 1000), debit("4.5.7", 1500)];
        let generated = vec![debit("4.5.7", 1500), debit("4.5.6", 1000)];

        let result = reconcile(&previous, generated, Uuid::new_v4());

        assert!(result.is_empty());
    }

    #[test]
    fn test_missing_previous_line_is_reversed() {
        let bill_licence_id = Uuid::new_v4();
        let previous = vec![debit("4.5.6", 1000), debit("4.5.7", 2000)];
        let generated = vec![debit("4.5.6", 1000)];

        let result = reconcile(&previous, generated, bill_licence_id);

        assert_eq!(result.len(), 1);
        let credit = &result[0];
        assert!(credit.credit);
        assert_eq!(credit.net_amount, 2000);
        assert_eq!(credit.charge_category_code, "4.5.7");
        assert_eq!(credit.bill_licence_id, bill_licence_id);
        assert_ne!(credit.id, previous[1].id);
        assert!(credit.external_id.is_none());
    }

    #[test]
    fn test_changed_amount_emits_new_debit_and_credit() {
        let previous = vec![debit("4.5.6", 1000)];
        let generated = vec![debit("4.5.6", 1200)];

        let result = reconcile(&previous, generated, Uuid::new_v4());

        assert_eq!(result.len(), 2);
        assert!(!result[0].credit);
        assert_eq!(result[0].net_amount, 1200);
        assert!(result[1].credit);
        assert_eq!(result[1].net_amount, 1000);
        let net: i64 = result.iter().map(Transaction::signed_amount).sum();
        assert_eq!(net, 200);
    }

    #[test]
    fn test_previously_credited_debit_is_not_reversed_again() {
        let original = debit("4.5.6", 1000);
        let mut credited = original.clone();
        credited.id = Uuid::new_v4();
        credited.credit = true;

        let result = reconcile(&[original, credited], vec![], Uuid::new_v4());

        assert!(result.is_empty());
    }

    #[test]
    fn test_duplicate_lines_match_one_for_one() {
        let previous = vec![debit("4.5.6", 1000)];
        let generated = vec![debit("4.5.6", 1000), debit("4.5.6", 1000)];

        let result = reconcile(&previous, generated, Uuid::new_v4());

        assert_eq!(result.len(), 1);
        assert!(!result[0].credit);
    }

    #[test]
    fn test_volume_scale_does_not_affect_matching() {
        let previous = vec![debit("4.5.6", 1000)];
        let mut generated = debit("4.5.6", 1000);
        generated.volume = Decimal::new(10000, 2);

        let result = reconcile(&previous, vec![generated], Uuid::new_v4());

        assert!(result.is_empty());
    }
}
