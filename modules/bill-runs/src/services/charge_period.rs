use crate::models::{BillingPeriod, ChargePeriod, ChargeVersion};

/// The part of `billing_period` a charge version is chargeable for
///
/// Starts at the later of the charge version and billing period starts. Ends
/// at the earliest of the billing period end, the charge version end and the
/// licence's revoked, lapsed and expired dates. None when that range is
/// empty.
pub fn determine_charge_period(
    charge_version: &ChargeVersion,
    billing_period: &BillingPeriod,
) -> Option<ChargePeriod> {
    let start_date = charge_version.start_date.max(billing_period.start_date);

    let licence = &charge_version.licence;
    let end_date = [
        Some(billing_period.end_date),
        charge_version.end_date,
        licence.revoked_date,
        licence.lapsed_date,
        licence.expired_date,
    ]
    .into_iter()
    .flatten()
    .min()?;

    if start_date > end_date {
        return None;
    }

    Some(ChargePeriod {
        start_date,
        end_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Licence, Scheme};
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn charge_version(start: NaiveDate, end: Option<NaiveDate>) -> ChargeVersion {
        ChargeVersion {
            id: Uuid::new_v4(),
            scheme: Scheme::Sroc,
            start_date: start,
            end_date: end,
            licence: Licence {
                id: Uuid::new_v4(),
                licence_ref: "01/123".to_string(),
                region_id: Uuid::new_v4(),
                revoked_date: None,
                lapsed_date: None,
                expired_date: None,
                include_in_sroc_billing: false,
                include_in_presroc_billing: false,
                include_in_sroc_tpt_billing: false,
            },
            charge_references: vec![],
            reviewed_allocation: None,
        }
    }

    fn period() -> BillingPeriod {
        BillingPeriod::for_financial_year_ending(2024).unwrap()
    }

    #[test]
    fn test_open_ended_version_covers_whole_period() {
        let cv = charge_version(date(2020, 1, 1), None);
        let charge_period = determine_charge_period(&cv, &period()).unwrap();
        assert_eq!(charge_period.start_date, date(2023, 4, 1));
        assert_eq!(charge_period.end_date, date(2024, 3, 31));
    }

    #[test]
    fn test_clipped_by_version_dates() {
        let cv = charge_version(date(2023, 6, 1), Some(date(2023, 9, 30)));
        let charge_period = determine_charge_period(&cv, &period()).unwrap();
        assert_eq!(charge_period.start_date, date(2023, 6, 1));
        assert_eq!(charge_period.end_date, date(2023, 9, 30));
    }

    #[test]
    fn test_clipped_by_earliest_licence_end() {
        let mut cv = charge_version(date(2020, 1, 1), None);
        cv.licence.lapsed_date = Some(date(2023, 12, 31));
        cv.licence.revoked_date = Some(date(2023, 10, 31));
        let charge_period = determine_charge_period(&cv, &period()).unwrap();
        assert_eq!(charge_period.end_date, date(2023, 10, 31));
    }

    #[test]
    fn test_licence_ended_before_period_is_empty() {
        let mut cv = charge_version(date(2020, 1, 1), None);
        cv.licence.expired_date = Some(date(2023, 3, 31));
        assert!(determine_charge_period(&cv, &period()).is_none());
    }

    #[test]
    fn test_version_starting_after_period_is_empty() {
        let cv = charge_version(date(2024, 4, 1), None);
        assert!(determine_charge_period(&cv, &period()).is_none());
    }
}
