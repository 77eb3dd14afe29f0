use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{ChargeSubmissionGateway, GatewayError, SubmissionContext};
use crate::config::Config;
use crate::models::Transaction;

/// Connection settings for the external charging service
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

impl HttpGatewayConfig {
    /// None when no gateway URL is configured
    pub fn from_config(config: &Config) -> Result<Option<Self>, GatewayError> {
        let Some(base_url) = config.charge_gateway_url.clone() else {
            return Ok(None);
        };
        let token = config.charge_gateway_token.clone().ok_or_else(|| {
            GatewayError::Config("CHARGE_GATEWAY_TOKEN must be set with CHARGE_GATEWAY_URL".to_string())
        })?;

        Ok(Some(HttpGatewayConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            timeout: config.charge_gateway_timeout,
        }))
    }
}

#[derive(Debug, Serialize)]
struct SubmissionRequest<'a> {
    region_id: Uuid,
    account_number: &'a str,
    licence_ref: &'a str,
    financial_year_ending: i32,
    transactions: &'a [Transaction],
}

#[derive(Debug, Deserialize)]
struct SubmissionResponse {
    charges: Vec<ChargeAck>,
}

#[derive(Debug, Deserialize)]
struct ChargeAck {
    transaction_id: Uuid,
    external_id: String,
}

/// Gateway posting each licence's transactions to the charging service
#[derive(Clone)]
pub struct HttpChargeGateway {
    config: Arc<HttpGatewayConfig>,
    http_client: Client,
}

impl HttpChargeGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        Ok(HttpChargeGateway {
            config: Arc::new(config),
            http_client,
        })
    }

    fn licences_url(&self, bill_run_id: Uuid) -> String {
        format!("{}/bill-runs/{}/licences", self.config.base_url, bill_run_id)
    }
}

#[async_trait]
impl ChargeSubmissionGateway for HttpChargeGateway {
    async fn submit(
        &self,
        context: &SubmissionContext,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>, GatewayError> {
        let body = SubmissionRequest {
            region_id: context.region_id,
            account_number: &context.account_number,
            licence_ref: &context.licence_ref,
            financial_year_ending: context.financial_year_ending,
            transactions: &transactions,
        };

        let response = self
            .http_client
            .post(self.licences_url(context.bill_run_id))
            .header("Authorization", format!("Bearer {}", self.config.token))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.timeout)
                } else {
                    GatewayError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(GatewayError::Api {
                status_code: status.as_u16(),
                message,
            });
        }

        let parsed = response
            .json::<SubmissionResponse>()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;

        attach_external_ids(transactions, parsed)
    }
}

/// Every submitted transaction must come back acknowledged exactly once
fn attach_external_ids(
    transactions: Vec<Transaction>,
    response: SubmissionResponse,
) -> Result<Vec<Transaction>, GatewayError> {
    if response.charges.len() != transactions.len() {
        return Err(GatewayError::Parse(format!(
            "expected {} charges, received {}",
            transactions.len(),
            response.charges.len()
        )));
    }

    let mut external_ids: HashMap<Uuid, String> = response
        .charges
        .into_iter()
        .map(|ack| (ack.transaction_id, ack.external_id))
        .collect();

    transactions
        .into_iter()
        .map(|mut transaction| {
            let external_id = external_ids.remove(&transaction.id).ok_or_else(|| {
                GatewayError::Parse(format!("no charge returned for transaction {}", transaction.id))
            })?;
            transaction.external_id = Some(external_id);
            Ok(transaction)
        })
        .collect()
}
