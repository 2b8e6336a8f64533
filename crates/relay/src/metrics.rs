use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
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
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    live_connections: AtomicI64,
    responses_total: Mutex<HashMap<String, u64>>,
    reactions_total: Mutex<HashMap<String, u64>>,
    questions_total: AtomicU64,
    interactions_activated_total: AtomicU64,
    webhook_deliveries_total: Mutex<HashMap<String, u64>>,
}

const RESPONSE_OUTCOMES: [&str; 3] = ["created", "updated", "late"];
const WEBHOOK_OUTCOMES: [&str; 3] = ["delivered", "failed", "dropped"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_rate_total: Mutex::new(HashMap::new()),
            live_connections: AtomicI64::new(0),
            responses_total: Mutex::new(zeroed(&RESPONSE_OUTCOMES)),
            reactions_total: Mutex::new(HashMap::new()),
            questions_total: AtomicU64::new(0),
            interactions_activated_total: AtomicU64::new(0),
            webhook_deliveries_total: Mutex::new(zeroed(&WEBHOOK_OUTCOMES)),
        }
    }
}

fn zeroed(labels: &[&str]) -> HashMap<String, u64> {
    labels.iter().map(|label| (label.to_string(), 0)).collect()
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(endpoint: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(endpoint, is_error, latency_ms);
    }
}

pub fn adjust_live_connections(delta: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.adjust_live_connections(delta);
    }
}

pub fn record_response(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_response(outcome);
    }
}

pub fn record_reactions(kind: &str, count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_reactions(kind, count);
    }
}

pub fn increment_questions_total() {
    if let Some(metrics) = global_metrics() {
        metrics.questions_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_interactions_activated_total() {
    if let Some(metrics) = global_metrics() {
        metrics.interactions_activated_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_webhook_delivery(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_webhook_delivery(outcome);
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

    pub fn record_ws_request(&self, endpoint: &str, is_error: bool, latency_ms: u64) {
        let normalized_endpoint = normalize_label(endpoint);
        increment_label_counter(&self.ws_rate_total, &normalized_endpoint, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &normalized_endpoint, latency_ms);
        increment_label_counter(&self.ws_duration_count, &normalized_endpoint, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &normalized_endpoint, 1);
        }
    }

    pub fn adjust_live_connections(&self, delta: i64) {
        self.live_connections.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn record_response(&self, outcome: &str) {
        let label = normalize_known(outcome, &RESPONSE_OUTCOMES);
        increment_label_counter(&self.responses_total, &label, 1);
    }

    pub fn record_reactions(&self, kind: &str, count: u64) {
        increment_label_counter(&self.reactions_total, &normalize_label(kind), count);
    }

    pub fn record_webhook_delivery(&self, outcome: &str) {
        let label = normalize_known(outcome, &WEBHOOK_OUTCOMES);
        increment_label_counter(&self.webhook_deliveries_total, &label, 1);
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

        output.push_str("# HELP relay_ws_rate_total Total websocket frames by type.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", "endpoint", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket frame errors by type.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_errors_total",
            "endpoint",
            &self.ws_errors_total,
        );

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of websocket frame handling latency in milliseconds by type.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            "endpoint",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_duration_ms_count Count of websocket latency samples by type.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            "endpoint",
            &self.ws_duration_count,
        );

        output.push_str("# HELP live_connections Currently open live sockets.\n");
        output.push_str("# TYPE live_connections gauge\n");
        output.push_str(&format!(
            "live_connections {}\n",
            self.live_connections.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP responses_total Stored interaction responses by outcome.\n");
        output.push_str("# TYPE responses_total counter\n");
        append_label_counter_lines(&mut output, "responses_total", "outcome", &self.responses_total);

        output.push_str("# HELP reactions_total Accepted reactions by kind.\n");
        output.push_str("# TYPE reactions_total counter\n");
        append_label_counter_lines(&mut output, "reactions_total", "kind", &self.reactions_total);

        output.push_str("# HELP questions_total Submitted questions.\n");
        output.push_str("# TYPE questions_total counter\n");
        output.push_str(&format!("questions_total {}\n", self.questions_total.load(Ordering::SeqCst)));

        output.push_str("# HELP interactions_activated_total Interaction activations.\n");
        output.push_str("# TYPE interactions_activated_total counter\n");
        output.push_str(&format!(
            "interactions_activated_total {}\n",
            self.interactions_activated_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP webhook_deliveries_total Webhook deliveries by outcome.\n");
        output.push_str("# TYPE webhook_deliveries_total counter\n");
        append_label_counter_lines(
            &mut output,
            "webhook_deliveries_total",
            "outcome",
            &self.webhook_deliveries_total,
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_known(label: &str, known: &[&str]) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if known.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
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

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::RelayMetrics;

    #[test]
    fn render_prometheus_includes_red_and_engine_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request(
            "POST",
            "/v1/webinars/00000000-0000-0000-0000-000000000001/participants",
            200,
            15,
        );
        metrics.record_http_request("GET", "/v1/webinars/42", 500, 25);
        metrics.record_ws_request("submit_response", false, 11);
        metrics.record_ws_request("submit_response", true, 19);
        metrics.adjust_live_connections(2);
        metrics.adjust_live_connections(-1);
        metrics.record_response("created");
        metrics.record_response("late");
        metrics.record_response("bogus");
        metrics.record_reactions("clap", 7);
        metrics.record_webhook_delivery("failed");

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("relay_request_rate_total"));
        assert!(rendered.contains("relay_request_errors_total"));
        assert!(rendered.contains("relay_request_duration_ms_sum"));
        assert!(rendered.contains("endpoint=\"/v1/webinars/{uuid}/participants\""));
        assert!(rendered.contains("endpoint=\"/v1/webinars/{number}\""));
        assert!(rendered.contains("relay_ws_rate_total{endpoint=\"submit_response\"} 2"));
        assert!(rendered.contains("relay_ws_errors_total{endpoint=\"submit_response\"} 1"));
        assert!(rendered.contains("live_connections 1"));
        assert!(rendered.contains("responses_total{outcome=\"created\"} 1"));
        assert!(rendered.contains("responses_total{outcome=\"updated\"} 0"));
        assert!(rendered.contains("responses_total{outcome=\"late\"} 1"));
        assert!(rendered.contains("responses_total{outcome=\"unknown\"} 1"));
        assert!(rendered.contains("reactions_total{kind=\"clap\"} 7"));
        assert!(rendered.contains("webhook_deliveries_total{outcome=\"failed\"} 1"));
        assert!(rendered.contains("questions_total 0"));
    }
}
