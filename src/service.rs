//! Fetch orchestrator
//!
//! Resolution order for every call: service switch, manual override,
//! fresh cache, then a provider fetch. Concurrent callers coalesce onto a
//! single in-flight fetch; the fetch itself either races the top providers
//! in parallel (first valid answer wins, losers are cancelled) or walks
//! them sequentially in priority order. Every provider attempt runs under
//! the retry executor and its circuit breaker.

use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::GeoConfig;
use crate::error::{GeoError, GeoResult};
use crate::metrics::MetricsCollector;
use crate::override_manager::UserLocationOverrideManager;
use crate::providers::{GeoProvider, ProviderRegistry};
use crate::retry::retry_with_backoff;
use crate::storage::KvStore;
use crate::transport::HttpTransport;
use crate::types::{GeolocationResult, ProviderId};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type FetchOutcome = GeoResult<GeolocationResult>;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: GeolocationResult,
    stored_at: Instant,
}

impl CacheEntry {
    /// Fresh while younger than the TTL its confidence tier earned
    fn is_valid_at(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) < self.result.confidence.cache_ttl()
    }
}

/// Clears the in-flight slot when the owning fetch finishes or is dropped,
/// so follower tasks and future callers never wait on a dead owner.
struct InFlightGuard<'a> {
    slot: &'a Mutex<Option<broadcast::Sender<FetchOutcome>>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

/// Accounts for an admitted attempt that never completes: releases the
/// breaker probe and records a cancellation instead of an outcome.
struct AttemptGuard<'a> {
    breaker: &'a CircuitBreaker,
    metrics: &'a MetricsCollector,
    provider: ProviderId,
    armed: bool,
}

impl<'a> AttemptGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, metrics: &'a MetricsCollector, provider: ProviderId) -> Self {
        Self {
            breaker,
            metrics,
            provider,
            armed: true,
        }
    }

    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.report_cancelled();
            self.metrics.record_cancelled(self.provider);
        }
    }
}

pub struct GeolocationService {
    config: GeoConfig,
    providers: Vec<Arc<dyn GeoProvider>>,
    breakers: HashMap<ProviderId, Arc<CircuitBreaker>>,
    override_manager: UserLocationOverrideManager,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    cache: Mutex<Option<CacheEntry>>,
    in_flight: Mutex<Option<broadcast::Sender<FetchOutcome>>>,
}

impl GeolocationService {
    pub fn new(
        config: GeoConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let providers = ProviderRegistry::build(&config.providers.enabled, transport);
        Self::from_parts(config, providers, store, clock)
    }

    /// Assemble from pre-built providers; tests inject fakes through here.
    pub fn from_parts(
        config: GeoConfig,
        providers: Vec<Arc<dyn GeoProvider>>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breakers = providers
            .iter()
            .map(|p| {
                (
                    p.id(),
                    Arc::new(CircuitBreaker::new(config.breaker.clone(), clock.clone())),
                )
            })
            .collect();

        Self {
            override_manager: UserLocationOverrideManager::new(store, clock.clone()),
            metrics: Arc::new(MetricsCollector::new(clock.clone())),
            breakers,
            providers,
            config,
            clock,
            cache: Mutex::new(None),
            in_flight: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn overrides(&self) -> &UserLocationOverrideManager {
        &self.override_manager
    }

    pub fn clear_cache(&self) {
        *self.cache.lock() = None;
        debug!("location cache cleared");
    }

    /// Resolve the current location.
    ///
    /// Precedence: manual override, fresh cache, provider fetch. Concurrent
    /// callers share one in-flight fetch; a caller that drops mid-wait never
    /// poisons the others.
    pub async fn get_detailed_location(&self) -> FetchOutcome {
        if !self.config.service.enabled {
            return Err(GeoError::ServiceDisabled);
        }

        if let Some(ov) = self.override_manager.current_override()? {
            debug!(source = %ov.source, "serving manual override");
            return Ok(ov.to_result());
        }

        let stale = self.check_cache();
        if let Some(entry) = &stale {
            if entry.is_valid_at(self.clock.instant()) {
                self.metrics.record_cache_hit();
                return Ok(entry.result.as_cached());
            }
        }

        loop {
            enum Role {
                Owner(broadcast::Sender<FetchOutcome>),
                Follower(broadcast::Receiver<FetchOutcome>),
            }

            let role = {
                let mut slot = self.in_flight.lock();
                match &*slot {
                    Some(tx) => Role::Follower(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        *slot = Some(tx.clone());
                        Role::Owner(tx)
                    }
                }
            };

            match role {
                Role::Follower(mut rx) => {
                    debug!("joining in-flight fetch");
                    match rx.recv().await {
                        Ok(outcome) => return outcome,
                        // Owner dropped before finishing; take over.
                        Err(_) => continue,
                    }
                }
                Role::Owner(tx) => {
                    let _guard = InFlightGuard {
                        slot: &self.in_flight,
                    };
                    let outcome = self.fetch(stale.map(|e| e.result)).await;
                    let _ = tx.send(outcome.clone());
                    return outcome;
                }
            }
        }
    }

    /// Snapshot the cache entry, counting hit/miss/invalidation exactly once
    /// per call. An expired entry is kept for stale fallback.
    fn check_cache(&self) -> Option<CacheEntry> {
        if !self.config.service.cache_enabled {
            return None;
        }
        let cache = self.cache.lock();
        match &*cache {
            Some(entry) if entry.is_valid_at(self.clock.instant()) => Some(entry.clone()),
            Some(entry) => {
                self.metrics.record_cache_invalidation();
                self.metrics.record_cache_miss();
                Some(entry.clone())
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    async fn fetch(&self, stale: Option<GeolocationResult>) -> FetchOutcome {
        if self.providers.is_empty() {
            return Err(GeoError::NoProvidersConfigured);
        }

        let outcome = if self.config.service.parallel {
            self.fetch_parallel().await
        } else {
            self.fetch_sequential().await
        };

        match outcome {
            Ok(result) => {
                if self.config.service.cache_enabled {
                    *self.cache.lock() = Some(CacheEntry {
                        result: result.clone(),
                        stored_at: self.clock.instant(),
                    });
                }
                info!(
                    provider = %result.provider,
                    latitude = result.latitude,
                    longitude = result.longitude,
                    confidence = %result.confidence,
                    "location resolved"
                );
                Ok(result)
            }
            Err(err) => {
                if let Some(previous) = stale {
                    if self.config.service.parallel && self.config.service.stale_cache_fallback {
                        warn!(
                            error = %err,
                            age_provider = %previous.provider,
                            "all providers failed, serving stale cache"
                        );
                        return Ok(previous.as_cached());
                    }
                    return Err(GeoError::StaleCacheRefreshFailed {
                        source: Box::new(err),
                    });
                }
                Err(err)
            }
        }
    }

    /// Race the top `max_parallel_providers` admissible providers; the first
    /// success wins and the rest are dropped mid-flight.
    async fn fetch_parallel(&self) -> FetchOutcome {
        let mut errors: Vec<(ProviderId, Box<GeoError>)> = Vec::new();
        let mut contenders = Vec::new();

        for provider in &self.providers {
            if contenders.len() >= self.config.service.max_parallel_providers {
                break;
            }
            let id = provider.id();
            let breaker = &self.breakers[&id];
            if breaker.allows_request() {
                contenders.push(provider.clone());
            } else {
                self.metrics.record_skipped(id);
                errors.push((
                    id,
                    Box::new(GeoError::CircuitOpen {
                        provider: id,
                        retry_after: breaker.retry_after(),
                    }),
                ));
            }
        }

        if contenders.is_empty() {
            return Err(GeoError::AllProvidersFailed { errors });
        }

        self.metrics.record_parallel_batch(contenders.len());
        debug!(fanout = contenders.len(), "racing providers");

        let mut in_flight: FuturesUnordered<_> = contenders
            .iter()
            .map(|provider| {
                let provider = provider.clone();
                async move {
                    let id = provider.id();
                    (id, self.attempt_provider(provider).await)
                }
            })
            .collect();

        while let Some((id, outcome)) = in_flight.next().await {
            match outcome {
                // Dropping the stream cancels the remaining attempts; their
                // guards record the cancellations.
                Ok(result) => return Ok(result),
                Err(err) => errors.push((id, Box::new(err))),
            }
        }

        Err(GeoError::AllProvidersFailed { errors })
    }

    /// Walk providers in priority order, stopping at the first success
    async fn fetch_sequential(&self) -> FetchOutcome {
        let mut errors: Vec<(ProviderId, Box<GeoError>)> = Vec::new();

        for provider in &self.providers {
            let id = provider.id();
            let breaker = &self.breakers[&id];
            if !breaker.allows_request() {
                self.metrics.record_skipped(id);
                errors.push((
                    id,
                    Box::new(GeoError::CircuitOpen {
                        provider: id,
                        retry_after: breaker.retry_after(),
                    }),
                ));
                continue;
            }

            match self.attempt_provider(provider.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    debug!(provider = %id, error = %err, "provider failed, falling back");
                    errors.push((id, Box::new(err)));
                }
            }
        }

        Err(GeoError::AllProvidersFailed { errors })
    }

    /// One provider under retry + breaker. Admission is re-checked on every
    /// retry attempt so a circuit that trips mid-sequence cuts it short.
    async fn attempt_provider(&self, provider: Arc<dyn GeoProvider>) -> FetchOutcome {
        let id = provider.id();
        let breaker = self.breakers[&id].clone();
        let timeout = Duration::from_secs(self.config.providers.timeout_secs);
        let operation_name = id.to_string();

        retry_with_backoff(&operation_name, &self.config.retry, || {
            let provider = provider.clone();
            let breaker = breaker.clone();
            async move {
                if !breaker.prepare_request() {
                    self.metrics.record_skipped(id);
                    return Err(GeoError::CircuitOpen {
                        provider: id,
                        retry_after: breaker.retry_after(),
                    });
                }

                let guard = AttemptGuard::new(&breaker, &self.metrics, id);
                let started = self.clock.instant();
                let outcome = provider.fetch(timeout).await;
                let elapsed = self.clock.instant().duration_since(started);

                match outcome {
                    Ok(result) => {
                        guard.complete();
                        breaker.report_success(elapsed);
                        self.metrics.record_success(id, elapsed);
                        Ok(result)
                    }
                    Err(err) => {
                        guard.complete();
                        // Rate limiting is back-pressure, not provider
                        // sickness; it never counts against the breaker.
                        if !matches!(err, GeoError::RateLimited { .. })
                            && breaker.report_failure(elapsed)
                        {
                            self.metrics.record_circuit_open(id);
                            warn!(provider = %id, "circuit opened");
                        }
                        self.metrics.record_failure(id, &err, elapsed);
                        Err(err)
                    }
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::GeoConfig;
    use crate::storage::MemoryStore;
    use crate::transport::MockTransport;

    fn service_with(config: GeoConfig, transport: MockTransport) -> (GeolocationService, ManualClock) {
        let clock = ManualClock::new();
        let service = GeolocationService::new(
            config,
            Arc::new(transport),
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
        );
        (service, clock)
    }

    fn fast_retry(config: &mut GeoConfig) {
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.retry.jitter_factor = 0.0;
    }

    const IP_API_OK: &str = r#"{"status": "success", "lat": 52.52, "lon": 13.405, "city": "Berlin"}"#;

    #[tokio::test]
    async fn disabled_service_rejects_without_io() {
        let config = GeoConfig {
            service: crate::config::ServiceConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let transport = MockTransport::with_json(200, IP_API_OK);
        let (service, _clock) = service_with(config, transport);

        assert_eq!(
            service.get_detailed_location().await.unwrap_err(),
            GeoError::ServiceDisabled
        );
    }

    #[tokio::test]
    async fn empty_provider_list_is_an_error() {
        let config = GeoConfig {
            providers: crate::config::ProvidersConfig {
                enabled: Vec::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        let transport = MockTransport::with_json(200, IP_API_OK);
        let (service, _clock) = service_with(config, transport);

        assert_eq!(
            service.get_detailed_location().await.unwrap_err(),
            GeoError::NoProvidersConfigured
        );
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let mut config = GeoConfig::default();
        fast_retry(&mut config);
        config.providers.enabled = vec![ProviderId::IpApi];
        let transport = MockTransport::with_json(200, IP_API_OK);
        let (service, _clock) = service_with(config, transport);

        let first = service.get_detailed_location().await.unwrap();
        assert!(!first.is_from_cache);

        let second = service.get_detailed_location().await.unwrap();
        assert!(second.is_from_cache);
        assert_eq!(second.latitude, first.latitude);

        let snapshot = service.metrics().snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
    }

    #[tokio::test]
    async fn cache_expires_by_confidence_ttl() {
        let mut config = GeoConfig::default();
        fast_retry(&mut config);
        config.providers.enabled = vec![ProviderId::IpApi];
        let transport = MockTransport::with_json(200, IP_API_OK);
        let (service, clock) = service_with(config, transport);

        let first = service.get_detailed_location().await.unwrap();
        // City metadata gives Medium: one hour of cache life.
        clock.advance(first.confidence.cache_ttl());

        let third = service.get_detailed_location().await.unwrap();
        assert!(!third.is_from_cache);
        assert_eq!(service.metrics().snapshot().cache_invalidations, 1);
    }

    #[tokio::test]
    async fn override_takes_precedence_over_everything() {
        let mut config = GeoConfig::default();
        fast_retry(&mut config);
        let transport = MockTransport::with_json(200, IP_API_OK);
        let (service, _clock) = service_with(config, transport);

        service
            .overrides()
            .set_override(40.4168, -3.7038, Some("Madrid".to_string()), None, "test")
            .unwrap();

        let result = service.get_detailed_location().await.unwrap();
        assert_eq!(result.provider, ProviderId::Manual);
        assert_eq!(result.latitude, 40.4168);
        // No provider was touched.
        assert!(service.metrics().provider(ProviderId::IpApi).is_none());
    }

    #[tokio::test]
    async fn clear_cache_forces_a_refetch() {
        let mut config = GeoConfig::default();
        fast_retry(&mut config);
        config.providers.enabled = vec![ProviderId::IpApi];
        let transport = MockTransport::with_json(200, IP_API_OK);
        let (service, _clock) = service_with(config, transport);

        service.get_detailed_location().await.unwrap();
        service.clear_cache();

        let result = service.get_detailed_location().await.unwrap();
        assert!(!result.is_from_cache);
    }
}
