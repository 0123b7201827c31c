use std::sync::OnceLock;

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Process-wide metrics registry with Prometheus rendering.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    queries_total: CounterVec,
    query_errors_total: CounterVec,
    fork_dispatches_total: CounterVec,
    cells_run_total: CounterVec,
    query_seconds: HistogramVec,
    intake_queue_depth: GaugeVec,
    running_queries: GaugeVec,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish()
    }
}

impl MetricsRegistry {
    /// Build a registry with all EVQ collectors registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let queries_total = CounterVec::new(
            Opts::new("evq_queries_total", "Queries handled, by kind and table"),
            &["kind", "table"],
        )
        .expect("metric opts are static");
        let query_errors_total = CounterVec::new(
            Opts::new("evq_query_errors_total", "Query errors, by class and code"),
            &["class", "code"],
        )
        .expect("metric opts are static");
        let fork_dispatches_total = CounterVec::new(
            Opts::new("evq_fork_dispatches_total", "Fork sub-requests dispatched, by kind"),
            &["kind"],
        )
        .expect("metric opts are static");
        let cells_run_total = CounterVec::new(
            Opts::new("evq_cells_run_total", "Cell run() invocations, by role"),
            &["role"],
        )
        .expect("metric opts are static");
        let query_seconds = HistogramVec::new(
            HistogramOpts::new("evq_query_seconds", "Originator query latency, by kind"),
            &["kind"],
        )
        .expect("metric opts are static");
        let intake_queue_depth = GaugeVec::new(
            Opts::new("evq_intake_queue_depth", "Messages waiting in intake queues"),
            &["queue"],
        )
        .expect("metric opts are static");
        let running_queries = GaugeVec::new(
            Opts::new("evq_running_queries", "Currently admitted originator queries"),
            &["node"],
        )
        .expect("metric opts are static");

        for c in [
            &queries_total,
            &query_errors_total,
            &fork_dispatches_total,
            &cells_run_total,
        ] {
            registry
                .register(Box::new(c.clone()))
                .expect("collector registers once");
        }
        registry
            .register(Box::new(query_seconds.clone()))
            .expect("collector registers once");
        for g in [&intake_queue_depth, &running_queries] {
            registry
                .register(Box::new(g.clone()))
                .expect("collector registers once");
        }

        Self {
            registry,
            queries_total,
            query_errors_total,
            fork_dispatches_total,
            cells_run_total,
            query_seconds,
            intake_queue_depth,
            running_queries,
        }
    }

    /// Count one handled query.
    pub fn inc_query(&self, kind: &str, table: &str) {
        self.queries_total.with_label_values(&[kind, table]).inc();
    }

    /// Count one error reply.
    pub fn inc_query_error(&self, class: &str, code: &str) {
        self.query_errors_total
            .with_label_values(&[class, code])
            .inc();
    }

    /// Count one fork sub-request.
    pub fn inc_fork_dispatch(&self, kind: &str) {
        self.fork_dispatches_total.with_label_values(&[kind]).inc();
    }

    /// Count one cell `run()` invocation.
    pub fn inc_cell_run(&self, role: &str) {
        self.cells_run_total.with_label_values(&[role]).inc();
    }

    /// Observe originator latency in seconds.
    pub fn observe_query_seconds(&self, kind: &str, secs: f64) {
        self.query_seconds
            .with_label_values(&[kind])
            .observe(secs.max(0.0));
    }

    /// Record intake queue depth.
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.intake_queue_depth
            .with_label_values(&[queue])
            .set(depth as f64);
    }

    /// Record admitted-query count.
    pub fn set_running_queries(&self, node: &str, running: usize) {
        self.running_queries
            .with_label_values(&[node])
            .set(running as f64);
    }

    /// Render all collectors in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry accessor.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_counters() {
        let m = MetricsRegistry::new();
        m.inc_query("event", "sales");
        m.set_queue_depth("query", 2);
        let text = m.render_prometheus();
        assert!(text.contains("evq_queries_total"));
        assert!(text.contains("evq_intake_queue_depth"));
    }
}
