use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

/// Metric names recorded by the monitor, scheduler and recovery loop.
pub mod names {
    pub const ACTIVITY_STATE_CHANGES: &str = "activity_state_changes_total";
    pub const QUEUE_PROMOTIONS: &str = "queue_promotions_total";
    pub const QUEUE_PROMOTION_FAILURES: &str = "queue_promotion_failures_total";
    pub const QUEUE_BLOCKED: &str = "queue_blocked";
    pub const RECOVERY_MESSAGES: &str = "recovery_messages_total";
    pub const RECOVERY_SEND_SECONDS: &str = "recovery_send_duration_seconds";
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs distinguishing series of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    /// `{key="value",key2="value2"}`, or nothing for an empty set.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

type SeriesKey = (String, Labels);

fn key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    (name.to_string(), Labels::new(labels))
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Cumulative-bucket histogram. The sum is kept as `f64` bits.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (boundary, count) in self.buckets.iter().zip(&self.counts) {
            if value <= *boundary {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Buckets for sub-second to tens-of-seconds operations (tmux round trips).
fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges and histograms behind `RwLock`ed maps; values are atomics
/// so the common path only takes a read lock.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<SeriesKey, AtomicU64>>,
    gauges: RwLock<AHashMap<SeriesKey, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = key(name, labels);
        {
            let map = self.counters.read().expect("metrics lock poisoned");
            if let Some(c) = map.get(&key) {
                c.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().expect("metrics lock poisoned");
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = key(name, labels);
        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            if let Some(g) = map.get(&key) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().expect("metrics lock poisoned");
        map.entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    // -- Histograms ---------------------------------------------------------

    /// Record a value; unknown histograms are created with duration buckets.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().expect("metrics lock poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, metric families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().expect("metrics lock poisoned");
            let series = map
                .iter()
                .map(|((n, l), v)| (n.as_str(), l, v.load(Ordering::Relaxed).to_string()));
            write_families(&mut out, "counter", series);
        }
        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            let series = map
                .iter()
                .map(|((n, l), v)| (n.as_str(), l, v.load(Ordering::Relaxed).to_string()));
            write_families(&mut out, "gauge", series);
        }
        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {name} histogram\n"));
                for (boundary, count) in h.buckets.iter().zip(&h.counts) {
                    out.push_str(&format!(
                        "{name}_bucket{{le=\"{boundary}\"}} {}\n",
                        count.load(Ordering::Relaxed)
                    ));
                }
                out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.count()));
                out.push_str(&format!("{name}_sum {}\n", h.sum()));
                out.push_str(&format!("{name}_count {}\n", h.count()));
            }
        }

        out
    }
}

fn write_families<'a>(
    out: &mut String,
    kind: &str,
    series: impl Iterator<Item = (&'a str, &'a Labels, String)>,
) {
    let mut grouped: AHashMap<&str, Vec<(&Labels, String)>> = AHashMap::new();
    for (name, labels, value) in series {
        grouped.entry(name).or_default().push((labels, value));
    }
    let mut names: Vec<&str> = grouped.keys().copied().collect();
    names.sort_unstable();
    for name in names {
        out.push_str(&format!("# TYPE {name} {kind}\n"));
        let mut entries = grouped.remove(name).unwrap_or_default();
        entries.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        for (labels, value) in entries {
            out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
        }
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// Process-wide collector shared by every component.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}
