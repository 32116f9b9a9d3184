use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::{Once, OnceLock};

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
pub static CREDITS_GRANTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CREDITS_CONSUMED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static SLOT_REJECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static PURCHASES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static JOB_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

static INIT: Once = Once::new();

/// Install the HTTP metrics recorder and register ledger counters.
///
/// Safe to call more than once; only the first call does anything. A
/// recorder that cannot be installed (another one already owns the global
/// slot) is logged and HTTP metrics are skipped.
pub fn init_metrics() {
    INIT.call_once(|| {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(e) => tracing::warn!(error = %e, "Prometheus recorder not installed"),
        }

        let registry = Registry::new();

        let counters = [
            (
                &CREDITS_GRANTED_TOTAL,
                "credits_granted_total",
                "Credits added to ledgers by grant source",
                &["source"][..],
            ),
            (
                &CREDITS_CONSUMED_TOTAL,
                "credits_consumed_total",
                "Credits deducted from ledgers by operation",
                &["operation"][..],
            ),
            (
                &SLOT_REJECTIONS_TOTAL,
                "generation_slot_rejections_total",
                "Generation slot requests rejected by reason",
                &["reason"][..],
            ),
            (
                &PURCHASES_TOTAL,
                "purchases_total",
                "Purchase validations by kind and outcome",
                &["kind", "outcome"][..],
            ),
            (
                &JOB_RUNS_TOTAL,
                "job_runs_total",
                "Scheduled job runs by job and outcome",
                &["job", "outcome"][..],
            ),
        ];

        for (cell, name, help, labels) in counters {
            let counter = match IntCounterVec::new(Opts::new(name, help), labels) {
                Ok(counter) => counter,
                Err(e) => {
                    tracing::error!(metric = name, error = %e, "Failed to create metric");
                    continue;
                }
            };
            if let Err(e) = registry.register(Box::new(counter.clone())) {
                tracing::error!(metric = name, error = %e, "Failed to register metric");
                continue;
            }
            let _ = cell.set(counter);
        }

        let _ = PROMETHEUS_REGISTRY.set(registry);
    });
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_credits_granted(source: &str, amount: i64) {
    if amount <= 0 {
        return;
    }
    if let Some(counter) = CREDITS_GRANTED_TOTAL.get() {
        counter.with_label_values(&[source]).inc_by(amount as u64);
    }
}

pub fn record_credits_consumed(operation: &str, amount: i64) {
    if amount <= 0 {
        return;
    }
    if let Some(counter) = CREDITS_CONSUMED_TOTAL.get() {
        counter.with_label_values(&[operation]).inc_by(amount as u64);
    }
}

pub fn record_slot_rejection(reason: &str) {
    if let Some(counter) = SLOT_REJECTIONS_TOTAL.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

pub fn record_purchase(kind: &str, outcome: &str) {
    if let Some(counter) = PURCHASES_TOTAL.get() {
        counter.with_label_values(&[kind, outcome]).inc();
    }
}

pub fn record_job_run(job: &str, outcome: &str) {
    if let Some(counter) = JOB_RUNS_TOTAL.get() {
        counter.with_label_values(&[job, outcome]).inc();
    }
}
