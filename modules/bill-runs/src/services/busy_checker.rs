//! Bill run busy check
//!
//! New bill runs are refused while another run is being built or cancelled.

use serde::Serialize;
use std::sync::Arc;

use crate::repos::{BillingRepository, BusyFlags, RepoResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyStatus {
    None,
    Building,
    Cancelling,
    Both,
}

impl BusyStatus {
    pub fn from_flags(flags: BusyFlags) -> Self {
        match (flags.building, flags.cancelling) {
            (true, true) => BusyStatus::Both,
            (true, false) => BusyStatus::Building,
            (false, true) => BusyStatus::Cancelling,
            (false, false) => BusyStatus::None,
        }
    }

    pub fn is_busy(&self) -> bool {
        *self != BusyStatus::None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BusyStatus::None => "none",
            BusyStatus::Building => "building",
            BusyStatus::Cancelling => "cancelling",
            BusyStatus::Both => "both",
        }
    }
}

impl std::fmt::Display for BusyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone)]
pub struct BillRunBusyChecker {
    repo: Arc<dyn BillingRepository>,
}

impl BillRunBusyChecker {
    pub fn new(repo: Arc<dyn BillingRepository>) -> Self {
        Self { repo }
    }

    pub async fn status(&self) -> RepoResult<BusyStatus> {
        let flags = self.repo.fetch_busy_flags().await?;
        Ok(BusyStatus::from_flags(flags))
    }
}
