use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{ChargeSubmissionGateway, GatewayError, SubmissionContext};
use crate::models::Transaction;

/// Gateway that assigns external ids locally
///
/// Used when no charging service is configured and in tests, where it can
/// also be told to reject or stall every submission.
#[derive(Clone, Default)]
pub struct StubChargeGateway {
    reject_with: Option<String>,
    delay: Option<Duration>,
    submissions: Arc<Mutex<Vec<(SubmissionContext, usize)>>>,
}

impl StubChargeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every submission with `message`
    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            reject_with: Some(message.into()),
            ..Self::default()
        }
    }

    /// Wait `delay` before answering
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Contexts submitted so far, with the number of transactions in each
    pub fn submissions(&self) -> Vec<(SubmissionContext, usize)> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChargeSubmissionGateway for StubChargeGateway {
    async fn submit(
        &self,
        context: &SubmissionContext,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>, GatewayError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((context.clone(), transactions.len()));

        if let Some(message) = &self.reject_with {
            return Err(GatewayError::Rejected(message.clone()));
        }

        Ok(transactions
            .into_iter()
            .map(|mut transaction| {
                transaction.external_id = Some(format!("stub-{}", transaction.id));
                transaction
            })
            .collect())
    }
}
