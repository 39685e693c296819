//! Tracing setup, persisted warn+ logs, and the metrics recorder.

mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module overrides appended to the filter (e.g. `helm_store` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// Persist WARN+ records to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub metrics_enabled: bool,
    pub metrics_db_path: PathBuf,
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let dir = home_fallback();
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_to_sqlite: true,
            log_db_path: dir.join("logs.db"),
            metrics_enabled: true,
            metrics_db_path: dir.join("metrics.db"),
            metrics_retention_days: 7,
        }
    }
}

impl TelemetryConfig {
    /// The `EnvFilter` directive used when `RUST_LOG` is unset.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the log sink and metrics recorder alive for the process lifetime.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
    retention_days: u32,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }

    /// Persist a metrics snapshot and drop rows past the retention window.
    pub fn snapshot_metrics(&self) {
        let Some(recorder) = &self.metrics_recorder else {
            return;
        };
        match recorder.snapshot() {
            Ok(n) => tracing::debug!(rows = n, "metrics snapshot written"),
            Err(e) => tracing::warn!(error = %e, "metrics snapshot failed"),
        }
        if let Err(e) = recorder.prune(self.retention_days) {
            tracing::warn!(error = %e, "metrics prune failed");
        }
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("helm-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(sqlite_layer)
        .init();

    let metrics_recorder = if config.metrics_enabled {
        match MetricsRecorder::new(&config.metrics_db_path) {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics DB, using in-memory recorder");
                MetricsRecorder::in_memory().ok().map(Arc::new)
            }
        }
    } else {
        None
    };

    TelemetryGuard {
        log_sink: sqlite_sink,
        metrics_recorder,
        retention_days: config.metrics_retention_days,
    }
}

fn home_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".helm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_includes_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("helm_hub".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "warn,helm_hub=debug");
    }

    #[test]
    fn default_paths_live_under_helm_dir() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.ends_with(".helm/logs.db"));
        assert!(config.metrics_db_path.ends_with(".helm/metrics.db"));
    }
}
