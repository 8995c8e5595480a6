//! Grounded in `hyperlight-js::sandbox::metrics` — a gauge/counter pair per
//! lifecycle stage plus an RAII drop guard so the gauge can't drift from the
//! actual live count on an early return or panic unwind.

use tracing::{instrument, Level};

static METRIC_ACTIVE_RUNTIMES: &str = "active_js_runtimes";
static METRIC_TOTAL_RUNTIMES: &str = "js_runtimes_total";

pub(crate) static METRIC_EXECUTIONS: &str = "executions_total";
pub(crate) static METRIC_EXECUTION_ERRORS: &str = "execution_errors_total";
pub(crate) static METRIC_EXECUTION_DURATION_MICROS: &str = "execution_duration_micros";
pub(crate) static METRIC_ERROR_CODE_LABEL: &str = "error_code";

/// RAII guard tracking how many `JsRuntime` instances are alive.
pub(crate) struct RuntimeMetricsGuard;

impl RuntimeMetricsGuard {
    #[instrument(skip_all, level = Level::DEBUG)]
    pub(crate) fn new() -> Self {
        metrics::gauge!(METRIC_ACTIVE_RUNTIMES).increment(1);
        metrics::counter!(METRIC_TOTAL_RUNTIMES).increment(1);
        Self
    }
}

impl Drop for RuntimeMetricsGuard {
    #[instrument(skip_all, level = Level::DEBUG)]
    fn drop(&mut self) {
        metrics::gauge!(METRIC_ACTIVE_RUNTIMES).decrement(1);
    }
}

/// Times one `execute()` call and records its outcome on drop.
pub(crate) struct ExecutionMetricGuard {
    start: std::time::Instant,
    outcome: Option<&'static str>,
}

impl ExecutionMetricGuard {
    pub(crate) fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
            outcome: None,
        }
    }

    pub(crate) fn record_error(&mut self, code: &'static str) {
        self.outcome = Some(code);
    }
}

impl Drop for ExecutionMetricGuard {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        metrics::counter!(METRIC_EXECUTIONS).increment(1);
        metrics::histogram!(METRIC_EXECUTION_DURATION_MICROS)
            .record(duration.as_micros() as f64);
        if let Some(code) = self.outcome {
            metrics::counter!(METRIC_EXECUTION_ERRORS, METRIC_ERROR_CODE_LABEL => code)
                .increment(1);
        }
    }
}
