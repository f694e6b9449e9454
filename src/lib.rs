//! Resilient multi-provider IP geolocation
//!
//! Resolves the caller's approximate location from public IP-geolocation
//! APIs and keeps answering when individual providers degrade: per-provider
//! circuit breakers and retry with jittered backoff, request coalescing so
//! concurrent callers share one fetch, confidence-scored results that set
//! their own cache lifetime, a durable manual override that trumps
//! everything, and per-provider metrics.
//!
//! ```no_run
//! use geofetch::{GeoConfig, GeolocationService};
//! use geofetch::clock::SystemClock;
//! use geofetch::storage::SledStore;
//! use geofetch::transport::ReqwestTransport;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let service = GeolocationService::new(
//!     GeoConfig::default(),
//!     Arc::new(ReqwestTransport::new()),
//!     Arc::new(SledStore::open("geo.db")?),
//!     Arc::new(SystemClock),
//! );
//! let location = service.get_detailed_location().await?;
//! println!("{}, {} ({})", location.latitude, location.longitude, location.confidence);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod confidence;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod override_manager;
pub mod providers;
pub mod retry;
pub mod service;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::GeoConfig;
pub use error::{GeoError, GeoResult};
pub use service::GeolocationService;
pub use types::{Confidence, GeoMetadata, GeolocationResult, LocationOverride, ProviderId};
