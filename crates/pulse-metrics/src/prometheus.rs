//! Prometheus text exposition format.
//!
//! Renders a metrics snapshot into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use crate::collector::MetricsSnapshot;

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

/// Render a snapshot into Prometheus text format.
///
/// Service-wide counters and gauges are unlabeled; per-route series carry a
/// `route` label.
pub fn render_prometheus(s: &MetricsSnapshot) -> String {
    let mut out = String::new();

    let counters = [
        ("pulse_batches_accepted_total", "Ingestion batches accepted.", s.batches_accepted),
        ("pulse_batches_rejected_total", "Ingestion batches rejected by validation.", s.batches_rejected),
        ("pulse_points_ingested_total", "Metric points written.", s.points_ingested),
        ("pulse_system_points_ingested_total", "System telemetry points written.", s.system_points_ingested),
        ("pulse_storage_errors_total", "Storage operations that failed.", s.storage_errors),
        ("pulse_published_batches_total", "Batches published to live subscribers.", s.published_batches),
        ("pulse_stream_messages_dropped_total", "Stream messages dropped from full subscriber queues.", s.stream_messages_dropped),
        ("pulse_subscriptions_opened_total", "Stream subscriptions opened.", s.subscriptions_opened),
        ("pulse_subscriptions_closed_total", "Stream subscriptions closed.", s.subscriptions_closed),
        ("pulse_rollups_materialized_total", "Rollup buckets recomputed.", s.rollups_materialized),
        ("pulse_points_evicted_total", "Raw points removed by retention.", s.points_evicted),
        ("pulse_partitions_dropped_total", "Partitions dropped by retention.", s.partitions_dropped),
        ("pulse_maintenance_failures_total", "Background maintenance passes that failed.", s.maintenance_failures),
        ("pulse_cache_hits_total", "Cache lookups served from cache.", s.cache_hits),
        ("pulse_cache_misses_total", "Cache lookups that fell through to storage.", s.cache_misses),
        ("pulse_cache_errors_total", "Cache operations that failed.", s.cache_errors),
    ];
    for (name, help, value) in counters {
        metric(&mut out, name, "counter", help, value);
    }

    metric(&mut out, "pulse_uptime_seconds", "gauge", "Seconds since the service started.", s.uptime_secs);
    metric(&mut out, "pulse_active_subscribers", "gauge", "Live stream subscribers.", s.active_subscribers);
    metric(&mut out, "pulse_active_topics", "gauge", "Runs with at least one live subscriber.", s.active_topics);

    out.push_str("# HELP pulse_requests_total Requests handled per route.\n");
    out.push_str("# TYPE pulse_requests_total counter\n");
    for r in &s.routes {
        let _ = writeln!(out, "pulse_requests_total{{route=\"{}\"}} {}", r.route, r.requests);
    }

    out.push_str("# HELP pulse_request_errors_total Failed requests per route.\n");
    out.push_str("# TYPE pulse_request_errors_total counter\n");
    for r in &s.routes {
        let _ = writeln!(out, "pulse_request_errors_total{{route=\"{}\"}} {}", r.route, r.errors);
    }

    out.push_str("# HELP pulse_latency_p50_ms P50 latency in milliseconds.\n");
    out.push_str("# TYPE pulse_latency_p50_ms gauge\n");
    for r in &s.routes {
        let _ = writeln!(out, "pulse_latency_p50_ms{{route=\"{}\"}} {:.2}", r.route, r.latency_p50_ms);
    }

    out.push_str("# HELP pulse_latency_p99_ms P99 latency in milliseconds.\n");
    out.push_str("# TYPE pulse_latency_p99_ms gauge\n");
    for r in &s.routes {
        let _ = writeln!(out, "pulse_latency_p99_ms{{route=\"{}\"}} {:.2}", r.route, r.latency_p99_ms);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::RouteSnapshot;

    fn test_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            batches_accepted: 12,
            points_ingested: 340,
            cache_hits: 7,
            active_subscribers: 3,
            routes: vec![RouteSnapshot {
                route: "ingest".to_string(),
                requests: 12,
                errors: 1,
                latency_p50_ms: 5.2,
                latency_p99_ms: 45.8,
            }],
            ..MetricsSnapshot::default()
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&MetricsSnapshot::default());
        // Should still have type declarations.
        assert!(output.contains("# TYPE pulse_batches_accepted_total counter"));
        assert!(output.contains("# TYPE pulse_latency_p50_ms gauge"));
        assert!(output.contains("pulse_points_ingested_total 0\n"));
    }

    #[test]
    fn render_counters_and_gauges() {
        let output = render_prometheus(&test_snapshot());
        assert!(output.contains("pulse_batches_accepted_total 12\n"));
        assert!(output.contains("pulse_points_ingested_total 340\n"));
        assert!(output.contains("pulse_cache_hits_total 7\n"));
        assert!(output.contains("pulse_active_subscribers 3\n"));
    }

    #[test]
    fn render_route_series() {
        let output = render_prometheus(&test_snapshot());
        assert!(output.contains("pulse_requests_total{route=\"ingest\"} 12"));
        assert!(output.contains("pulse_request_errors_total{route=\"ingest\"} 1"));
        assert!(output.contains("pulse_latency_p50_ms{route=\"ingest\"} 5.20"));
        assert!(output.contains("pulse_latency_p99_ms{route=\"ingest\"} 45.80"));
    }
}
