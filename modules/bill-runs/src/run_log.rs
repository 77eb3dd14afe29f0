//! Per-run logging context
//!
//! A [`RunLog`] is created when a bill run starts processing and handed to
//! every component that works on the run. Events emitted inside its span
//! carry the run id, batch type and scheme.

use std::time::{Duration, Instant};
use tracing::Span;

use crate::models::BillRun;

#[derive(Debug, Clone)]
pub struct RunLog {
    span: Span,
    started: Instant,
}

impl RunLog {
    pub fn new(bill_run: &BillRun) -> Self {
        let span = tracing::info_span!(
            "bill_run",
            bill_run_id = %bill_run.id,
            batch_type = bill_run.batch_type.as_str(),
            scheme = bill_run.scheme.as_str(),
        );

        Self {
            span,
            started: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}
