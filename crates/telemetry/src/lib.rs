//! Structured JSON logging entry point and in-process sync metrics.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Initialize structured logging (JSON) with env filter.
/// Set RUST_LOG, e.g., "info,soledad_sync=debug".
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Initialize OpenTelemetry tracer (optional; behind `otel` feature). No tracing subscriber hookup.
#[cfg(feature = "otel")]
pub fn init_otel(service_name: &str) -> Result<(), TelemetryError> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace as sdktrace;
    use opentelemetry_sdk::{runtime, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_owned())]);
    let _tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http())
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::Otel(e.to_string()))?;
    Ok(())
}

#[cfg(feature = "otel")]
pub mod metrics {
    //! OTel metrics (OTLP) for sync activity.
    use super::TelemetryError;
    use once_cell::sync::OnceCell;
    use opentelemetry::global;
    use opentelemetry::metrics::{Counter, Meter};

    static METRICS_INIT: OnceCell<()> = OnceCell::new();

    fn detect_service_name() -> String {
        std::env::var("OTEL_SERVICE_NAME")
            .or_else(|_| std::env::var("SOLEDAD_SERVICE_NAME"))
            .unwrap_or_else(|_| "soledad-sync".to_string())
    }

    fn init_metrics_from_env() -> Result<(), TelemetryError> {
        let _svc = detect_service_name();
        let provider = opentelemetry_otlp::new_pipeline()
            .metrics(opentelemetry_sdk::runtime::Tokio)
            .with_exporter(opentelemetry_otlp::new_exporter().http())
            .build()
            .map_err(|e| TelemetryError::Otel(e.to_string()))?;
        global::set_meter_provider(provider);
        Ok(())
    }

    fn ensure_metrics_provider() {
        let _ = METRICS_INIT.get_or_init(|| {
            let _ = init_metrics_from_env();
        });
    }

    #[derive(Clone)]
    pub struct SyncInstruments {
        uploads: Counter<u64>,
        downloads: Counter<u64>,
        retries: Counter<u64>,
        failures: Counter<u64>,
    }

    impl SyncInstruments {
        pub fn record_upload(&self) {
            self.uploads.add(1, &[]);
        }
        pub fn record_download(&self) {
            self.downloads.add(1, &[]);
        }
        pub fn record_retry(&self) {
            self.retries.add(1, &[]);
        }
        pub fn record_failure(&self) {
            self.failures.add(1, &[]);
        }
    }

    /// Initialize (idempotent) OTel counters for uploads/downloads/retries/failures.
    pub fn init_sync_instruments() -> SyncInstruments {
        ensure_metrics_provider();
        let meter: Meter = global::meter("soledad.sync");
        SyncInstruments {
            uploads: meter.u64_counter("soledad.sync.uploads").with_description("Blobs uploaded").init(),
            downloads: meter.u64_counter("soledad.sync.downloads").with_description("Blobs downloaded").init(),
            retries: meter.u64_counter("soledad.sync.retries").with_description("Transfer retries").init(),
            failures: meter.u64_counter("soledad.sync.failures").with_description("Terminal transfer failures").init(),
        }
    }
}

/// Returns whether telemetry is initialized (stubbed).
pub fn is_initialized() -> bool {
    true
}

/// In-process counters for sync activity, independent of any exporter.
/// Cheap to clone (shares the underlying atomics) and safe to hand to
/// multiple concurrent transfer tasks.
#[derive(Clone, Default)]
pub struct SyncMetrics {
    uploads: Arc<AtomicU64>,
    downloads: Arc<AtomicU64>,
    retries: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// `(uploads, downloads, retries, failures)`.
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.uploads.load(Ordering::Relaxed),
            self.downloads.load(Ordering::Relaxed),
            self.retries.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_metrics_accumulate_independently() {
        let metrics = SyncMetrics::new();
        metrics.record_upload();
        metrics.record_upload();
        metrics.record_download();
        metrics.record_retry();
        metrics.record_failure();
        assert_eq!(metrics.snapshot(), (2, 1, 1, 1));
    }

    #[test]
    fn sync_metrics_clone_shares_counters() {
        let metrics = SyncMetrics::new();
        let clone = metrics.clone();
        clone.record_upload();
        assert_eq!(metrics.snapshot().0, 1);
    }
}
