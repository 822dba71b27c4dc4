use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    note_repairs_total: Mutex<HashMap<String, u64>>,
    reconcile_runs_total: AtomicU64,
    reconcile_note_failures_total: AtomicU64,
    reconcile_timeouts_total: AtomicU64,
    docs_hydrated_total: AtomicU64,
    docs_evicted_total: AtomicU64,
    resident_docs: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            note_repairs_total: Mutex::new(HashMap::new()),
            reconcile_runs_total: AtomicU64::new(0),
            reconcile_note_failures_total: AtomicU64::new(0),
            reconcile_timeouts_total: AtomicU64::new(0),
            docs_hydrated_total: AtomicU64::new(0),
            docs_evicted_total: AtomicU64::new(0),
            resident_docs: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_note_repair(field: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_note_repair(field);
    }
}

pub fn record_reconcile(failed_notes: u64, timed_out: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_reconcile(failed_notes, timed_out);
    }
}

pub fn increment_docs_hydrated() {
    if let Some(metrics) = global_metrics() {
        metrics.docs_hydrated_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_docs_evicted(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.docs_evicted_total.fetch_add(count, Ordering::SeqCst);
    }
}

pub fn set_resident_docs(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.resident_docs.store(count, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_note_repair(&self, field: &str) {
        increment_label_counter(&self.note_repairs_total, field, 1);
    }

    pub fn record_reconcile(&self, failed_notes: u64, timed_out: bool) {
        self.reconcile_runs_total.fetch_add(1, Ordering::SeqCst);
        self.reconcile_note_failures_total.fetch_add(failed_notes, Ordering::SeqCst);
        if timed_out {
            self.reconcile_timeouts_total.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str(
            "# HELP fieldnotes_note_repairs_total Stored notes repaired by the validator, by field.\n",
        );
        output.push_str("# TYPE fieldnotes_note_repairs_total counter\n");
        append_label_counter_lines(
            &mut output,
            "fieldnotes_note_repairs_total",
            "field",
            &self.note_repairs_total,
        );

        append_plain_counter(
            &mut output,
            "fieldnotes_reconcile_runs_total",
            "Reconcile passes against the relational mirror.",
            "counter",
            &self.reconcile_runs_total,
        );
        append_plain_counter(
            &mut output,
            "fieldnotes_reconcile_note_failures_total",
            "Individual note writes that failed during reconcile.",
            "counter",
            &self.reconcile_note_failures_total,
        );
        append_plain_counter(
            &mut output,
            "fieldnotes_reconcile_timeouts_total",
            "Reconcile passes that hit the persistence deadline.",
            "counter",
            &self.reconcile_timeouts_total,
        );
        append_plain_counter(
            &mut output,
            "fieldnotes_docs_hydrated_total",
            "Documents hydrated from the relational mirror.",
            "counter",
            &self.docs_hydrated_total,
        );
        append_plain_counter(
            &mut output,
            "fieldnotes_docs_evicted_total",
            "Documents evicted from the in-memory store.",
            "counter",
            &self.docs_evicted_total,
        );
        append_plain_counter(
            &mut output,
            "fieldnotes_resident_docs",
            "Documents currently resident in memory.",
            "gauge",
            &self.resident_docs,
        );

        output
    }
}

/// Collapse per-parcel and per-note path segments so label cardinality stays
/// bounded.
fn normalize_endpoint(path: &str) -> String {
    let mut normalized_segments = Vec::new();
    let mut previous: Option<&str> = None;
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        let normalized = match previous {
            Some("parcels") => "{parcel_id}",
            Some("notes") => "{note_id}",
            _ => segment,
        };
        normalized_segments.push(normalized.to_string());
        previous = Some(segment);
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_plain_counter(
    output: &mut String,
    metric_name: &str,
    help: &str,
    kind: &str,
    value: &AtomicU64,
) {
    output.push_str(&format!("# HELP {metric_name} {help}\n"));
    output.push_str(&format!("# TYPE {metric_name} {kind}\n"));
    output.push_str(&format!("{metric_name} {}\n", value.load(Ordering::SeqCst)));
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::{normalize_endpoint, RelayMetrics};

    #[test]
    fn render_prometheus_includes_request_and_engine_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("GET", "/v1/parcels/P-100/notes", 200, 15);
        metrics.record_http_request("get", "/v1/parcels/P-200/notes", 500, 25);
        metrics.record_note_repair("createdBy");
        metrics.record_note_repair("createdBy");
        metrics.record_reconcile(3, false);
        metrics.record_reconcile(0, true);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains(
            "relay_request_rate_total{method=\"GET\",endpoint=\"/v1/parcels/{parcel_id}/notes\"} 2"
        ));
        assert!(rendered.contains(
            "relay_request_errors_total{method=\"GET\",endpoint=\"/v1/parcels/{parcel_id}/notes\"} 1"
        ));
        assert!(rendered.contains("fieldnotes_note_repairs_total{field=\"createdBy\"} 2"));
        assert!(rendered.contains("fieldnotes_reconcile_runs_total 2"));
        assert!(rendered.contains("fieldnotes_reconcile_note_failures_total 3"));
        assert!(rendered.contains("fieldnotes_reconcile_timeouts_total 1"));
        assert!(rendered.contains("# TYPE fieldnotes_resident_docs gauge"));
    }

    #[test]
    fn normalize_endpoint_hides_parcel_and_note_ids() {
        assert_eq!(
            normalize_endpoint("/v1/parcels/abc/notes/n-1"),
            "/v1/parcels/{parcel_id}/notes/{note_id}"
        );
        assert_eq!(normalize_endpoint("/v1/parcels/abc/sync"), "/v1/parcels/{parcel_id}/sync");
        assert_eq!(normalize_endpoint("/healthz"), "/healthz");
        assert_eq!(normalize_endpoint(""), "/");
    }
}
