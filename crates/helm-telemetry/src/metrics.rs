use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "gauge" => Self::Gauge,
            "histogram" => Self::Histogram,
            _ => Self::Counter,
        }
    }
}

/// A persisted metric value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

struct Counter(AtomicU64);

impl Counter {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }
}

/// f64 stored as raw bits.
struct Gauge(AtomicU64);

impl Gauge {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Keeps every observation; fine at hub volumes.
struct Histogram(Mutex<Vec<f64>>);

impl Histogram {
    fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    fn summary(&self) -> HistogramSummary {
        let mut obs = self.0.lock();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.total_cmp(b));
        let count = obs.len();
        let at = |q: f64| obs[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: obs.iter().sum(),
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric name plus labels sorted by key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// Run `f` on the entry for `key`, creating it on first use. The read lock
/// covers the common path.
fn with_entry<T>(
    map: &RwLock<HashMap<MetricKey, T>>,
    key: MetricKey,
    make: fn() -> T,
    f: impl FnOnce(&T),
) {
    if let Some(entry) = map.read().get(&key) {
        f(entry);
        return;
    }
    let mut map = map.write();
    f(map.entry(key).or_insert_with(make));
}

/// In-memory counters, gauges and histograms with SQLite snapshots.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_entry(&self.counters, MetricKey::new(name, labels), Counter::new, |c| {
            c.0.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_entry(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| {
            g.set(value)
        });
    }

    /// Add `delta` (may be negative) to a gauge.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        with_entry(&self.gauges, MetricKey::new(name, labels), Gauge::new, |g| {
            g.add(delta)
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_entry(
            &self.histograms,
            MetricKey::new(name, labels),
            Histogram::new,
            |h| h.0.lock().push(value),
        );
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&MetricKey::new(name, labels))
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0, |c| c.0.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0.0, Gauge::get)
    }

    /// Persist every current value in one transaction. Histograms store
    /// their p50. Returns the number of rows written.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let mut rows: Vec<(MetricKey, f64, MetricType)> = Vec::new();
        for (key, c) in self.counters.read().iter() {
            rows.push((key.clone(), c.0.load(Ordering::Relaxed) as f64, MetricType::Counter));
        }
        for (key, g) in self.gauges.read().iter() {
            rows.push((key.clone(), g.get(), MetricType::Gauge));
        }
        for (key, h) in self.histograms.read().iter() {
            rows.push((key.clone(), h.summary().p50, MetricType::Histogram));
        }

        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (key, value, kind) in &rows {
                stmt.execute(rusqlite::params![
                    now,
                    key.name,
                    value,
                    key.labels_json(),
                    kind.as_str()
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Newest first, 100 rows unless a limit is given.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let db = self.db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(name) = &q.name {
            sql.push_str(&format!(" AND name = ?{}", params.len() + 1));
            params.push(Box::new(name.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let kind: String = row.get(5)?;
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type: MetricType::parse(&kind),
            })
        })?;
        rows.collect()
    }

    /// Delete snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        self.db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            rusqlite::params![cutoff],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::in_memory().unwrap()
    }

    #[test]
    fn counters_are_keyed_by_labels() {
        let r = recorder();
        r.counter_inc("hub.turns.completed", &[("reason", "completed")], 1);
        r.counter_inc("hub.turns.completed", &[("reason", "completed")], 1);
        r.counter_inc("hub.turns.completed", &[("reason", "error")], 1);

        assert_eq!(r.counter_get("hub.turns.completed", &[("reason", "completed")]), 2);
        assert_eq!(r.counter_get("hub.turns.completed", &[("reason", "error")]), 1);
        assert_eq!(r.counter_get("hub.turns.completed", &[("reason", "interrupted")]), 0);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let r = recorder();
        r.gauge_inc("hub.sessions.streaming", &[], 1.0);
        r.gauge_inc("hub.sessions.streaming", &[], 1.0);
        r.gauge_inc("hub.sessions.streaming", &[], -1.0);
        assert_eq!(r.gauge_get("hub.sessions.streaming", &[]), 1.0);

        r.gauge_set("hub.sessions.streaming", &[], -2.5);
        assert_eq!(r.gauge_get("hub.sessions.streaming", &[]), -2.5);
    }

    #[test]
    fn histogram_percentiles() {
        let r = recorder();
        for v in 1..=10 {
            r.histogram_observe("hub.turn.duration_ms", &[], f64::from(v * 10));
        }
        let s = r.histogram_summary("hub.turn.duration_ms", &[]);
        assert_eq!(s.count, 10);
        assert_eq!(s.sum, 550.0);
        assert_eq!(s.p50, 60.0);
        assert_eq!(s.p99, 100.0);

        assert_eq!(r.histogram_summary("missing", &[]), HistogramSummary::default());
    }

    #[test]
    fn snapshot_then_query() {
        let r = recorder();
        r.counter_inc("hub.turns.started", &[], 42);
        r.gauge_set("hub.sessions.streaming", &[], 3.0);
        r.histogram_observe("hub.turn.duration_ms", &[], 120.0);
        assert_eq!(r.snapshot().unwrap(), 3);

        let rows = r
            .query(&MetricsQuery {
                name: Some("hub.turns.started".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 42.0);
        assert_eq!(rows[0].metric_type, MetricType::Counter);
        assert!(rows[0].labels.is_none());

        let future = r
            .query(&MetricsQuery {
                since: Some("2099-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn prune_with_zero_retention_clears_everything() {
        let r = recorder();
        r.counter_inc("c", &[], 1);
        r.snapshot().unwrap();
        assert_eq!(r.prune(0).unwrap(), 1);
        assert!(r.query(&MetricsQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn label_order_does_not_matter() {
        let r = recorder();
        r.counter_inc("x", &[("a", "1"), ("b", "2")], 1);
        r.counter_inc("x", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(r.counter_get("x", &[("a", "1"), ("b", "2")]), 2);

        let key = MetricKey::new("x", &[("b", "2"), ("a", "1")]);
        assert_eq!(key.labels_json().as_deref(), Some(r#"{"a":"1","b":"2"}"#));
    }

    #[test]
    fn file_backed_recorder_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m/metrics.db");
        let r = MetricsRecorder::new(&path).unwrap();
        r.counter_inc("c", &[], 5);
        r.snapshot().unwrap();
        drop(r);

        let reopened = MetricsRecorder::new(&path).unwrap();
        let rows = reopened.query(&MetricsQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 5.0);
    }

    #[test]
    fn concurrent_increments() {
        let r = Arc::new(recorder());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("concurrent", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(r.counter_get("concurrent", &[]), 8000);
    }
}
