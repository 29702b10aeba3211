//! Process-wide telemetry counters.
//!
//! A [`Metrics`] registry is created once and injected (`Arc`) into the
//! coordinator and the HTTP surface; the core never reaches for a global.
//! Counters are keyed maps (by module or by route) and render to the
//! Prometheus text format on demand.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Mutex;

/// A named map of monotonically increasing counters.
pub struct CounterMap {
    name: &'static str,
    values: Mutex<HashMap<String, u64>>,
}

impl CounterMap {
    fn new(name: &'static str) -> Self {
        CounterMap {
            name,
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Increment the counter for `key` by `n`.
    pub fn add(&self, key: &str, n: u64) {
        let mut values = self.values.lock().unwrap();
        *values.entry(key.to_string()).or_insert(0) += n;
    }

    /// The current value for `key` (zero when never incremented).
    pub fn get(&self, key: &str) -> u64 {
        self.values.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self
            .values
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort();
        entries
    }
}

/// A named map of gauges holding the most recent observation.
pub struct GaugeMap {
    name: &'static str,
    values: Mutex<HashMap<String, f64>>,
}

impl GaugeMap {
    fn new(name: &'static str) -> Self {
        GaugeMap {
            name,
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Record the latest observation for `key`.
    pub fn set(&self, key: &str, value: f64) {
        let mut values = self.values.lock().unwrap();
        values.insert(key.to_string(), value);
    }

    fn snapshot(&self) -> Vec<(String, f64)> {
        let mut entries: Vec<_> = self
            .values
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// The proxy's counter registry.
pub struct Metrics {
    pub cache_hits: CounterMap,
    pub cache_misses: CounterMap,
    pub http_requests: CounterMap,
    pub http_errors: CounterMap,
    pub http_request_durations: GaugeMap,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            cache_hits: CounterMap::new("cache_hits_total"),
            cache_misses: CounterMap::new("cache_misses_total"),
            http_requests: CounterMap::new("http_requests_total"),
            http_errors: CounterMap::new("http_errors_total"),
            http_request_durations: GaugeMap::new("http_request_duration_seconds"),
        }
    }

    /// Render every counter in the Prometheus text exposition format.
    ///
    /// Map keys are folded into the metric name, with the `_total` suffix
    /// kept at the end for counters.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for map in [
            &self.cache_hits,
            &self.cache_misses,
            &self.http_requests,
            &self.http_errors,
        ] {
            let base = map.name.trim_end_matches("_total");
            for (key, value) in map.snapshot() {
                let name = format!("{}_{}_total", base, sanitize(&key));
                let _ = writeln!(out, "# TYPE {} counter", name);
                let _ = writeln!(out, "{} {}", name, value);
            }
        }
        for (key, value) in self.http_request_durations.snapshot() {
            let name = format!("{}_{}", self.http_request_durations.name, sanitize(&key));
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

/// Replace everything outside `[a-z0-9]` with underscores.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add() {
        let metrics = Metrics::new();
        metrics.cache_hits.add("github.com/foo", 1);
        metrics.cache_hits.add("github.com/foo", 2);
        assert_eq!(metrics.cache_hits.get("github.com/foo"), 3);
        assert_eq!(metrics.cache_hits.get("unknown"), 0);
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = Metrics::new();
        metrics.cache_misses.add("github.com/foo/Bar", 1);
        metrics.http_requests.add("list", 2);
        metrics.http_request_durations.set("list", 0.25);

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE cache_misses_github_com_foo_bar_total counter"));
        assert!(text.contains("cache_misses_github_com_foo_bar_total 1"));
        assert!(text.contains("http_requests_list_total 2"));
        assert!(text.contains("# TYPE http_request_duration_seconds_list gauge"));
        assert!(text.contains("http_request_duration_seconds_list 0.25"));
    }
}
