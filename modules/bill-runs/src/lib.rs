pub mod config;
pub mod db;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod models;
pub mod notifier;
pub mod repos;
pub mod run_log;
pub mod services;
pub mod state_machine;
pub mod worker;

pub use services::{BillRunService, ReviewLicenceRemover};
