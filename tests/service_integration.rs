//! End-to-end orchestrator behavior against scripted providers

use async_trait::async_trait;
use geofetch::clock::ManualClock;
use geofetch::config::{GeoConfig, ProvidersConfig, ServiceConfig};
use geofetch::error::{GeoError, GeoResult};
use geofetch::providers::{GeoProvider, ProviderDescriptor};
use geofetch::service::GeolocationService;
use geofetch::storage::MemoryStore;
use geofetch::types::{Confidence, GeoMetadata, GeolocationResult, ProviderId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted provider: replays a queue of outcomes (the last entry repeats),
/// optionally sleeping first. Counts calls started and calls completed so
/// tests can tell a cancelled attempt from a finished one.
struct ScriptedProvider {
    descriptor: ProviderDescriptor,
    script: Mutex<VecDeque<GeoResult<(f64, f64)>>>,
    last: Mutex<Option<GeoResult<(f64, f64)>>>,
    delay: Option<Duration>,
    started: AtomicU64,
    completed: AtomicU64,
}

impl ScriptedProvider {
    fn new(id: ProviderId, priority: u8, script: Vec<GeoResult<(f64, f64)>>) -> Arc<Self> {
        Arc::new(Self {
            descriptor: ProviderDescriptor {
                id,
                priority,
                rate_limit_per_min: 60,
                endpoint: format!("mock://{}", id),
            },
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            delay: None,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        })
    }

    fn slow(id: ProviderId, priority: u8, coords: (f64, f64), delay: Duration) -> Arc<Self> {
        let mut provider = Self::new(id, priority, vec![Ok(coords)]);
        Arc::get_mut(&mut provider).unwrap().delay = Some(delay);
        provider
    }

    fn ok(id: ProviderId, priority: u8, coords: (f64, f64)) -> Arc<Self> {
        Self::new(id, priority, vec![Ok(coords)])
    }

    fn failing(id: ProviderId, priority: u8, error: GeoError) -> Arc<Self> {
        Self::new(id, priority, vec![Err(error)])
    }

    fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoProvider for ScriptedProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, _timeout: Duration) -> GeoResult<GeolocationResult> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().pop_front();
        let outcome = match next {
            Some(outcome) => {
                *self.last.lock() = Some(outcome.clone());
                outcome
            }
            None => self.last.lock().clone().unwrap_or(Err(GeoError::Network {
                provider: self.descriptor.id,
                message: "script exhausted".to_string(),
            })),
        };

        self.completed.fetch_add(1, Ordering::SeqCst);
        let (latitude, longitude) = outcome?;
        Ok(GeolocationResult {
            latitude,
            longitude,
            provider: self.descriptor.id,
            confidence: Confidence::Medium,
            timestamp: chrono::Utc::now(),
            is_from_cache: false,
            accuracy_radius_km: 25.0,
            metadata: GeoMetadata {
                city: Some("Berlin".to_string()),
                ..GeoMetadata::default()
            },
            fetch_duration_ms: 10,
        })
    }
}

fn timeout_err(provider: ProviderId) -> GeoError {
    GeoError::Timeout {
        provider,
        elapsed_ms: 5000,
    }
}

fn test_config(parallel: bool) -> GeoConfig {
    let mut config = GeoConfig {
        service: ServiceConfig {
            parallel,
            ..ServiceConfig::default()
        },
        providers: ProvidersConfig::default(),
        ..GeoConfig::default()
    };
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter_factor = 0.0;
    config
}

fn build(
    config: GeoConfig,
    providers: Vec<Arc<ScriptedProvider>>,
    clock: &ManualClock,
) -> Arc<GeolocationService> {
    let providers: Vec<Arc<dyn GeoProvider>> = providers
        .into_iter()
        .map(|p| p as Arc<dyn GeoProvider>)
        .collect();
    Arc::new(GeolocationService::from_parts(
        config,
        providers,
        Arc::new(MemoryStore::new()),
        Arc::new(clock.clone()),
    ))
}

#[tokio::test]
async fn concurrent_callers_coalesce_onto_one_fetch() {
    let clock = ManualClock::new();
    let provider = ScriptedProvider::slow(
        ProviderId::IpApi,
        1,
        (52.52, 13.405),
        Duration::from_millis(50),
    );
    let service = build(test_config(false), vec![provider.clone()], &clock);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.get_detailed_location().await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.latitude, 52.52);
    }

    // All five callers shared a single provider round trip.
    assert_eq!(provider.completed(), 1);
}

#[tokio::test]
async fn override_short_circuits_with_zero_network_calls() {
    let clock = ManualClock::new();
    let provider = ScriptedProvider::ok(ProviderId::IpApi, 1, (52.52, 13.405));
    let service = build(test_config(true), vec![provider.clone()], &clock);

    service
        .overrides()
        .set_override(40.4168, -3.7038, Some("Madrid".to_string()), None, "test")
        .unwrap();

    let result = service.get_detailed_location().await.unwrap();
    assert_eq!(result.provider, ProviderId::Manual);
    assert_eq!(result.latitude, 40.4168);
    assert_eq!(provider.started(), 0);
}

#[tokio::test]
async fn parallel_race_cancels_the_loser() {
    let clock = ManualClock::new();
    let fast = ScriptedProvider::slow(
        ProviderId::IpApi,
        1,
        (52.52, 13.405),
        Duration::from_millis(10),
    );
    let slow = ScriptedProvider::slow(
        ProviderId::IpapiCo,
        2,
        (48.85, 2.35),
        Duration::from_millis(500),
    );
    let service = build(test_config(true), vec![fast.clone(), slow.clone()], &clock);

    let result = service.get_detailed_location().await.unwrap();
    assert_eq!(result.provider, ProviderId::IpApi);

    // The loser was started but never allowed to finish.
    assert_eq!(slow.started(), 1);
    assert_eq!(slow.completed(), 0);
    let loser = service.metrics().provider(ProviderId::IpapiCo).unwrap();
    assert_eq!(loser.cancelled, 1);
    assert_eq!(loser.failures, 0);
    assert_eq!(loser.successes, 0);

    // Winner landed in the cache.
    let second = service.get_detailed_location().await.unwrap();
    assert!(second.is_from_cache);
    assert_eq!(fast.completed(), 1);
}

#[tokio::test]
async fn breaker_opens_after_repeated_failures_and_skips_the_provider() {
    let clock = ManualClock::new();
    let mut config = test_config(false);
    config.breaker.failure_threshold = 3;

    let sick = ScriptedProvider::failing(ProviderId::IpApi, 1, timeout_err(ProviderId::IpApi));
    let healthy = ScriptedProvider::ok(ProviderId::IpapiCo, 2, (48.85, 2.35));
    let service = build(config, vec![sick.clone(), healthy.clone()], &clock);

    // Three retry attempts against the sick provider trip its breaker,
    // then the sequential walk falls back to the healthy one.
    let result = service.get_detailed_location().await.unwrap();
    assert_eq!(result.provider, ProviderId::IpapiCo);
    assert_eq!(sick.started(), 3);

    let m = service.metrics().provider(ProviderId::IpApi).unwrap();
    assert_eq!(m.failures, 3);
    assert_eq!(m.circuit_open_events, 1);

    // Next round: the open circuit is skipped before any I/O.
    service.clear_cache();
    let result = service.get_detailed_location().await.unwrap();
    assert_eq!(result.provider, ProviderId::IpapiCo);
    assert_eq!(sick.started(), 3);
    assert!(service.metrics().provider(ProviderId::IpApi).unwrap().skipped >= 1);
}

#[tokio::test]
async fn all_circuits_open_without_cache_fails_with_aggregate() {
    let clock = ManualClock::new();
    let mut config = test_config(false);
    config.breaker.failure_threshold = 3;

    let sick = ScriptedProvider::failing(ProviderId::IpApi, 1, timeout_err(ProviderId::IpApi));
    let service = build(config, vec![sick.clone()], &clock);

    let first = service.get_detailed_location().await.unwrap_err();
    match first {
        GeoError::AllProvidersFailed { errors } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].1.kind(), "timeout");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Breaker is now open: the second call carries the circuit error.
    let second = service.get_detailed_location().await.unwrap_err();
    match second {
        GeoError::AllProvidersFailed { errors } => {
            assert_eq!(errors[0].1.kind(), "circuit_open");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sick.started(), 3);
}

#[tokio::test]
async fn expired_override_falls_through_to_providers() {
    let clock = ManualClock::new();
    let provider = ScriptedProvider::ok(ProviderId::IpApi, 1, (52.52, 13.405));
    let service = build(test_config(true), vec![provider.clone()], &clock);

    service
        .overrides()
        .set_override(
            40.4168,
            -3.7038,
            None,
            Some(Duration::from_secs(48 * 60 * 60)),
            "test",
        )
        .unwrap();
    assert_eq!(
        service.get_detailed_location().await.unwrap().provider,
        ProviderId::Manual
    );

    clock.advance(Duration::from_secs(72 * 60 * 60));

    let result = service.get_detailed_location().await.unwrap();
    assert_eq!(result.provider, ProviderId::IpApi);
    assert_eq!(provider.completed(), 1);
}

#[tokio::test]
async fn sequential_mode_falls_back_in_priority_order() {
    let clock = ManualClock::new();
    let broken = ScriptedProvider::failing(
        ProviderId::IpApi,
        1,
        GeoError::Parse {
            provider: ProviderId::IpApi,
            detail: "bad payload".to_string(),
        },
    );
    let backup = ScriptedProvider::ok(ProviderId::IpapiCo, 2, (48.85, 2.35));
    let service = build(test_config(false), vec![broken.clone(), backup.clone()], &clock);

    let result = service.get_detailed_location().await.unwrap();
    assert_eq!(result.provider, ProviderId::IpapiCo);
    // Parse errors are permanent: exactly one attempt, no retries.
    assert_eq!(broken.started(), 1);
}

#[tokio::test]
async fn stale_cache_is_served_when_every_provider_fails() {
    let clock = ManualClock::new();
    let provider = ScriptedProvider::new(
        ProviderId::IpApi,
        1,
        vec![Ok((52.52, 13.405)), Err(timeout_err(ProviderId::IpApi))],
    );
    let service = build(test_config(true), vec![provider.clone()], &clock);

    let fresh = service.get_detailed_location().await.unwrap();
    assert!(!fresh.is_from_cache);

    // Expire the cached entry, then break the provider.
    clock.advance(fresh.confidence.cache_ttl());

    let stale = service.get_detailed_location().await.unwrap();
    assert!(stale.is_from_cache);
    assert_eq!(stale.latitude, 52.52);
}

#[tokio::test]
async fn sequential_mode_wraps_refresh_failure_over_stale_cache() {
    let clock = ManualClock::new();
    let provider = ScriptedProvider::new(
        ProviderId::IpApi,
        1,
        vec![Ok((52.52, 13.405)), Err(timeout_err(ProviderId::IpApi))],
    );
    let service = build(test_config(false), vec![provider.clone()], &clock);

    let fresh = service.get_detailed_location().await.unwrap();
    clock.advance(fresh.confidence.cache_ttl());

    let err = service.get_detailed_location().await.unwrap_err();
    assert!(matches!(err, GeoError::StaleCacheRefreshFailed { .. }));
}

#[tokio::test]
async fn a_cancelled_caller_does_not_poison_followers() {
    let clock = ManualClock::new();
    let provider = ScriptedProvider::slow(
        ProviderId::IpApi,
        1,
        (52.52, 13.405),
        Duration::from_millis(50),
    );
    let service = build(test_config(false), vec![provider.clone()], &clock);

    // First caller becomes the owner, then gets dropped mid-fetch.
    let owner = {
        let service = service.clone();
        tokio::spawn(async move { service.get_detailed_location().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    owner.abort();
    let _ = owner.await;

    // A later caller must be able to fetch on its own.
    let result = service.get_detailed_location().await.unwrap();
    assert_eq!(result.latitude, 52.52);
}
