//! Prometheus Exposition
//!
//! Renders a stats snapshot and per-tier stats in the Prometheus text format.
//! A fresh registry is built per render so gauges always mirror the snapshot.

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::{StatsSnapshot, TierStats};
use crate::error::{Error, Result};

/// Metric name prefix
pub const METRIC_PREFIX: &str = "tiercache";

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics export failed: {}", e))
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(METRIC_PREFIX)
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(metric_error)?;
    Ok(collector)
}

/// Render the snapshot and tier stats as Prometheus text
pub fn render_prometheus(snapshot: &StatsSnapshot, tiers: &[TierStats]) -> Result<String> {
    let registry = Registry::new();

    let requests = register(
        &registry,
        IntGauge::with_opts(opts("requests_total", "Lookups served since the last reset"))
            .map_err(metric_error)?,
    )?;
    requests.set(snapshot.total_requests as i64);

    let hit_ratio = register(
        &registry,
        Gauge::with_opts(opts("hit_ratio", "Global hit ratio")).map_err(metric_error)?,
    )?;
    hit_ratio.set(snapshot.hit_ratio);

    let response = register(
        &registry,
        Gauge::with_opts(opts("avg_response_ms", "Mean sampled response time"))
            .map_err(metric_error)?,
    )?;
    response.set(snapshot.avg_response_ms);

    let error_rate = register(
        &registry,
        Gauge::with_opts(opts("error_rate", "Errors per request")).map_err(metric_error)?,
    )?;
    error_rate.set(snapshot.error_rate);

    let evictions = register(
        &registry,
        IntGaugeVec::new(
            opts("evictions_by_policy", "Evicted entries per strategy"),
            &["policy"],
        )
        .map_err(metric_error)?,
    )?;
    for (policy, count) in &snapshot.evictions_by_policy {
        evictions.with_label_values(&[policy.as_str()]).set(*count as i64);
    }

    let errors = register(
        &registry,
        IntGaugeVec::new(opts("errors_by_operation", "Errors per operation"), &["operation"])
            .map_err(metric_error)?,
    )?;
    for (operation, count) in &snapshot.errors_by_operation {
        errors.with_label_values(&[operation.as_str()]).set(*count as i64);
    }

    let ns_ratio = register(
        &registry,
        GaugeVec::new(opts("namespace_hit_ratio", "Hit ratio per namespace"), &["namespace"])
            .map_err(metric_error)?,
    )?;
    for (namespace, summary) in &snapshot.namespaces {
        ns_ratio.with_label_values(&[namespace.as_str()]).set(summary.hit_ratio);
    }

    let tier_entries = register(
        &registry,
        IntGaugeVec::new(opts("tier_entries", "Entries held per tier"), &["tier"])
            .map_err(metric_error)?,
    )?;
    let tier_bytes = register(
        &registry,
        IntGaugeVec::new(opts("tier_used_bytes", "Bytes accounted per tier"), &["tier"])
            .map_err(metric_error)?,
    )?;
    let tier_usage = register(
        &registry,
        GaugeVec::new(opts("tier_usage_ratio", "Used over max bytes per tier"), &["tier"])
            .map_err(metric_error)?,
    )?;
    let tier_hits = register(
        &registry,
        IntGaugeVec::new(opts("tier_hits", "Hits served per tier"), &["tier"])
            .map_err(metric_error)?,
    )?;
    for tier in tiers {
        let label = tier.tier.label();
        tier_entries.with_label_values(&[label]).set(tier.entries as i64);
        tier_bytes.with_label_values(&[label]).set(tier.used_bytes as i64);
        tier_usage.with_label_values(&[label]).set(tier.usage);
        tier_hits.with_label_values(&[label]).set(tier.hits as i64);
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(metric_error)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics export failed: {}", e)))
}
