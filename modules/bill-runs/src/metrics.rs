use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub bill_runs_total: IntCounterVec,
    pub transactions_generated_total: IntCounter,
    pub gateway_submissions_total: IntCounterVec,
    pub review_licences_removed_total: IntCounter,

    // Histograms
    pub bill_run_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bill_runs_total = IntCounterVec::new(
            Opts::new("bill_runs_total", "Bill runs finished processing"),
            &["batch_type", "outcome"], // outcome: ready|review|empty|error|cancelled
        )
        .expect("metric");

        let transactions_generated_total = IntCounter::new(
            "bill_run_transactions_generated_total",
            "Transactions generated before reconciliation",
        )
        .expect("metric");

        let gateway_submissions_total = IntCounterVec::new(
            Opts::new(
                "bill_run_gateway_submissions_total",
                "Licence submissions to the charging service",
            ),
            &["result"], // ok|timeout|rejected|http|api|parse|config
        )
        .expect("metric");

        let review_licences_removed_total = IntCounter::new(
            "bill_run_review_licences_removed_total",
            "Licences removed from two-part tariff reviews",
        )
        .expect("metric");

        let bill_run_duration_seconds = HistogramVec::new(
            HistogramOpts::new("bill_run_duration_seconds", "Bill run processing duration seconds"),
            &["batch_type"],
        )
        .expect("metric");

        registry
            .register(Box::new(bill_runs_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(transactions_generated_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(gateway_submissions_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(review_licences_removed_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(bill_run_duration_seconds.clone()))
            .expect("metric");

        Self {
            registry,
            bill_runs_total,
            transactions_generated_total,
            gateway_submissions_total,
            review_licences_removed_total,
            bill_run_duration_seconds,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new();
        metrics
            .bill_runs_total
            .with_label_values(&["annual", "ready"])
            .inc();
        metrics.transactions_generated_total.inc_by(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("bill_runs_total"));
        assert!(text.contains("bill_run_transactions_generated_total 3"));
    }
}
