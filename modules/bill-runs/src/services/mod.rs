pub mod bill_run_service;
pub mod billing_period_processor;
pub mod busy_checker;
pub mod charge_period;
pub mod reconciler;
pub mod review_licence_remover;
pub mod transaction_generator;

pub use bill_run_service::{billing_periods, BillRunError, BillRunService};
pub use billing_period_processor::{BillingPeriodProcessor, ProcessError};
pub use busy_checker::{BillRunBusyChecker, BusyStatus};
pub use review_licence_remover::{ReviewError, ReviewLicenceRemover};
