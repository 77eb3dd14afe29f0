//! Charge submission gateway
//!
//! Every licence's final transactions are handed to an external charging
//! service before anything is persisted. The service answers with one
//! external reference per transaction.

pub mod http;
pub mod stub;

pub use http::{HttpChargeGateway, HttpGatewayConfig};
pub use stub::StubChargeGateway;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Transaction;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status_code}): {message}")]
    Api { status_code: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Submission timed out after {0:?}")]
    Timeout(Duration),

    #[error("Submission rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::Http(_) => "http",
            GatewayError::Api { .. } => "api",
            GatewayError::Parse(_) => "parse",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Rejected(_) => "rejected",
        }
    }
}

/// Who a batch of transactions is being charged to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionContext {
    pub bill_run_id: Uuid,
    pub region_id: Uuid,
    pub account_number: String,
    pub licence_ref: String,
    pub financial_year_ending: i32,
}

#[async_trait]
pub trait ChargeSubmissionGateway: Send + Sync {
    /// Submit one licence's transactions in order. Returns the same
    /// transactions, in the same order, with `external_id` set.
    async fn submit(
        &self,
        context: &SubmissionContext,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>, GatewayError>;
}
