use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    // HTTP metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"]
    ).expect("metric can be created");

    pub static ref HTTP_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("http_request_duration_seconds", "HTTP request duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("metric can be created");

    // Business metrics
    pub static ref TRANSACTIONS_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("transactions_submitted_total", "Transactions submitted by outcome"),
        &["outcome"]
    ).expect("metric can be created");

    pub static ref SETTLEMENT_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("settlement_duration_seconds", "Settlement gateway call duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");

    pub static ref INSUFFICIENT_BALANCE_REJECTIONS: IntCounter = IntCounter::new(
        "insufficient_balance_rejections_total",
        "Submissions rejected for insufficient fund balance"
    ).expect("metric can be created");

    pub static ref AUDIT_WRITE_FAILURES: IntCounter = IntCounter::new(
        "audit_write_failures_total",
        "Audit entries that could not be written"
    ).expect("metric can be created");

    pub static ref LEDGER_INCONSISTENCIES: IntCounter = IntCounter::new(
        "ledger_inconsistencies_total",
        "Settlements that succeeded but could not be committed to the ledger"
    ).expect("metric can be created");
}

/// Register all metrics with the given registry
pub fn register_metrics(registry: &Registry) -> Result<(), Box<dyn std::error::Error>> {
    // HTTP metrics
    registry.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;

    // Business metrics
    registry.register(Box::new(TRANSACTIONS_SUBMITTED.clone()))?;
    registry.register(Box::new(SETTLEMENT_DURATION.clone()))?;
    registry.register(Box::new(INSUFFICIENT_BALANCE_REJECTIONS.clone()))?;
    registry.register(Box::new(AUDIT_WRITE_FAILURES.clone()))?;
    registry.register(Box::new(LEDGER_INCONSISTENCIES.clone()))?;

    Ok(())
}

/// Generate metrics output in Prometheus text format
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let registry = Registry::new();
        assert!(register_metrics(&registry).is_ok());
    }

    #[test]
    fn test_metrics_handler() {
        let registry = prometheus::default_registry();
        // Another test may have registered already
        let _ = register_metrics(registry);

        INSUFFICIENT_BALANCE_REJECTIONS.inc();
        let output = metrics_handler().unwrap();
        assert!(output.contains("insufficient_balance_rejections_total"));
    }
}
