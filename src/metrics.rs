//! In-process metrics for the geolocation engine
//!
//! Per-provider counters plus service-level cache and fan-out counters.
//! Everything is lock-light (DashMap shards + atomics) so the hot path
//! never blocks on metrics. A JSON snapshot and a Prometheus text render
//! are both exposed; no exporter or HTTP surface lives here.

use crate::clock::Clock;
use crate::error::GeoError;
use crate::types::ProviderId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProviderMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancelled: u64,
    /// Rejected by the breaker before any I/O
    pub skipped: u64,
    pub circuit_open_events: u64,
    pub total_latency_ms: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// Failure counts keyed by stable error kind
    pub errors: HashMap<String, u64>,
}

impl ProviderMetrics {
    /// Successes over completed calls. 1.0 when nothing completed yet.
    pub fn success_rate(&self) -> f64 {
        let completed = self.successes + self.failures;
        if completed == 0 {
            return 1.0;
        }
        self.successes as f64 / completed as f64
    }

    pub fn mean_latency_ms(&self) -> f64 {
        let completed = self.successes + self.failures;
        if completed == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / completed as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub providers: HashMap<ProviderId, ProviderMetrics>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_invalidations: u64,
    pub parallel_batches: u64,
    pub parallel_fanout_sum: u64,
}

pub struct MetricsCollector {
    clock: Arc<dyn Clock>,
    providers: DashMap<ProviderId, ProviderMetrics>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_invalidations: AtomicU64,
    parallel_batches: AtomicU64,
    parallel_fanout_sum: AtomicU64,
}

impl MetricsCollector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            providers: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_invalidations: AtomicU64::new(0),
            parallel_batches: AtomicU64::new(0),
            parallel_fanout_sum: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, provider: ProviderId, latency: Duration) {
        let now = self.clock.utc();
        let mut m = self.providers.entry(provider).or_default();
        m.requests += 1;
        m.successes += 1;
        m.total_latency_ms += latency.as_millis() as u64;
        m.last_success = Some(now);
    }

    pub fn record_failure(&self, provider: ProviderId, error: &GeoError, latency: Duration) {
        let now = self.clock.utc();
        let mut m = self.providers.entry(provider).or_default();
        m.requests += 1;
        m.failures += 1;
        m.total_latency_ms += latency.as_millis() as u64;
        m.last_failure = Some(now);
        *m.errors.entry(error.kind().to_string()).or_insert(0) += 1;
    }

    /// An attempt that was abandoned mid-flight (race loser, caller gone).
    /// Counted separately: never a success, never a failure.
    pub fn record_cancelled(&self, provider: ProviderId) {
        let mut m = self.providers.entry(provider).or_default();
        m.requests += 1;
        m.cancelled += 1;
    }

    pub fn record_skipped(&self, provider: ProviderId) {
        self.providers.entry(provider).or_default().skipped += 1;
    }

    pub fn record_circuit_open(&self, provider: ProviderId) {
        self.providers.entry(provider).or_default().circuit_open_events += 1;
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_invalidation(&self) {
        self.cache_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parallel_batch(&self, fanout: usize) {
        self.parallel_batches.fetch_add(1, Ordering::Relaxed);
        self.parallel_fanout_sum
            .fetch_add(fanout as u64, Ordering::Relaxed);
    }

    pub fn provider(&self, provider: ProviderId) -> Option<ProviderMetrics> {
        self.providers.get(&provider).map(|m| m.clone())
    }

    /// Providers ordered best-first: success rate descending, then mean
    /// latency ascending. Only providers that have seen traffic appear.
    pub fn provider_ranking(&self) -> Vec<ProviderId> {
        let mut ranked: Vec<(ProviderId, f64, f64)> = self
            .providers
            .iter()
            .map(|entry| {
                let m = entry.value();
                (*entry.key(), m.success_rate(), m.mean_latency_ms())
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.2.partial_cmp(&b.2)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        ranked.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Health heuristic: untouched providers are healthy; otherwise the
    /// success rate must hold at 0.5 or better and the most recent completed
    /// call must not be a failure.
    pub fn is_healthy(&self, provider: ProviderId) -> bool {
        let Some(m) = self.providers.get(&provider) else {
            return true;
        };
        if m.successes + m.failures == 0 {
            return true;
        }
        if m.success_rate() < 0.5 {
            return false;
        }
        match (m.last_success, m.last_failure) {
            (Some(s), Some(f)) => s >= f,
            (None, Some(_)) => false,
            _ => true,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            providers: self
                .providers
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_invalidations: self.cache_invalidations.load(Ordering::Relaxed),
            parallel_batches: self.parallel_batches.load(Ordering::Relaxed),
            parallel_fanout_sum: self.parallel_fanout_sum.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format, for callers that scrape
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::with_capacity(2048);

        let mut providers: Vec<_> = snapshot.providers.iter().collect();
        providers.sort_by_key(|(id, _)| id.to_string());

        out.push_str("# HELP geofetch_provider_requests_total Provider attempts started\n");
        out.push_str("# TYPE geofetch_provider_requests_total counter\n");
        for (id, m) in &providers {
            let _ = writeln!(
                out,
                "geofetch_provider_requests_total{{provider=\"{}\"}} {}",
                id, m.requests
            );
        }

        out.push_str("# HELP geofetch_provider_successes_total Successful provider calls\n");
        out.push_str("# TYPE geofetch_provider_successes_total counter\n");
        for (id, m) in &providers {
            let _ = writeln!(
                out,
                "geofetch_provider_successes_total{{provider=\"{}\"}} {}",
                id, m.successes
            );
        }

        out.push_str("# HELP geofetch_provider_failures_total Failed provider calls by kind\n");
        out.push_str("# TYPE geofetch_provider_failures_total counter\n");
        for (id, m) in &providers {
            let mut kinds: Vec<_> = m.errors.iter().collect();
            kinds.sort_by_key(|(k, _)| k.as_str());
            for (kind, count) in kinds {
                let _ = writeln!(
                    out,
                    "geofetch_provider_failures_total{{provider=\"{}\",kind=\"{}\"}} {}",
                    id, kind, count
                );
            }
        }

        out.push_str("# HELP geofetch_provider_cancelled_total Attempts abandoned mid-flight\n");
        out.push_str("# TYPE geofetch_provider_cancelled_total counter\n");
        for (id, m) in &providers {
            let _ = writeln!(
                out,
                "geofetch_provider_cancelled_total{{provider=\"{}\"}} {}",
                id, m.cancelled
            );
        }

        out.push_str("# HELP geofetch_provider_skipped_total Requests rejected by the breaker\n");
        out.push_str("# TYPE geofetch_provider_skipped_total counter\n");
        for (id, m) in &providers {
            let _ = writeln!(
                out,
                "geofetch_provider_skipped_total{{provider=\"{}\"}} {}",
                id, m.skipped
            );
        }

        out.push_str("# HELP geofetch_circuit_open_events_total Circuit trip count\n");
        out.push_str("# TYPE geofetch_circuit_open_events_total counter\n");
        for (id, m) in &providers {
            let _ = writeln!(
                out,
                "geofetch_circuit_open_events_total{{provider=\"{}\"}} {}",
                id, m.circuit_open_events
            );
        }

        out.push_str("# HELP geofetch_provider_latency_ms_mean Mean completed-call latency\n");
        out.push_str("# TYPE geofetch_provider_latency_ms_mean gauge\n");
        for (id, m) in &providers {
            let _ = writeln!(
                out,
                "geofetch_provider_latency_ms_mean{{provider=\"{}\"}} {:.1}",
                id,
                m.mean_latency_ms()
            );
        }

        out.push_str("# HELP geofetch_cache_hits_total Cache hits\n");
        out.push_str("# TYPE geofetch_cache_hits_total counter\n");
        let _ = writeln!(out, "geofetch_cache_hits_total {}", snapshot.cache_hits);

        out.push_str("# HELP geofetch_cache_misses_total Cache misses\n");
        out.push_str("# TYPE geofetch_cache_misses_total counter\n");
        let _ = writeln!(out, "geofetch_cache_misses_total {}", snapshot.cache_misses);

        out.push_str("# HELP geofetch_cache_invalidations_total Expired entries evicted\n");
        out.push_str("# TYPE geofetch_cache_invalidations_total counter\n");
        let _ = writeln!(
            out,
            "geofetch_cache_invalidations_total {}",
            snapshot.cache_invalidations
        );

        out.push_str("# HELP geofetch_parallel_batches_total Parallel fetch rounds started\n");
        out.push_str("# TYPE geofetch_parallel_batches_total counter\n");
        let _ = writeln!(
            out,
            "geofetch_parallel_batches_total {}",
            snapshot.parallel_batches
        );

        out.push_str("# HELP geofetch_parallel_fanout_sum Providers raced across all rounds\n");
        out.push_str("# TYPE geofetch_parallel_fanout_sum counter\n");
        let _ = writeln!(
            out,
            "geofetch_parallel_fanout_sum {}",
            snapshot.parallel_fanout_sum
        );

        out
    }
}
