//! Durable manual location override
//!
//! An active, non-expired override always wins over cache and fresh
//! fetches. It is written through to the durable store on `set_override`,
//! lazily loaded once per process, and purged from storage the moment an
//! expired entry is observed.

use crate::clock::Clock;
use crate::error::{GeoError, GeoResult};
use crate::storage::KvStore;
use crate::types::{LocationOverride, ProviderId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Overrides never outlive a week
pub const MAX_OVERRIDE_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Applied when the caller does not pick a duration
pub const DEFAULT_OVERRIDE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

const OVERRIDE_KEY: &str = "location_override";

#[derive(Debug, Clone)]
enum Slot {
    /// Durable storage not consulted yet this process lifetime
    Unloaded,
    Absent,
    Present(LocationOverride),
}

pub struct UserLocationOverrideManager {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    slot: Mutex<Slot>,
}

impl UserLocationOverrideManager {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            slot: Mutex::new(Slot::Unloaded),
        }
    }

    /// Set a manual override. Duration is clamped to `[0, 7 days]` and
    /// defaults to 24 hours. Persists durably and updates the in-memory
    /// slot synchronously.
    pub fn set_override(
        &self,
        latitude: f64,
        longitude: f64,
        city: Option<String>,
        duration: Option<Duration>,
        source: &str,
    ) -> GeoResult<LocationOverride> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::CoordinatesInvalid {
                provider: ProviderId::Manual,
                latitude,
                longitude,
            });
        }

        let duration = duration
            .unwrap_or(DEFAULT_OVERRIDE_DURATION)
            .min(MAX_OVERRIDE_DURATION);

        let created_at = self.clock.utc();
        let expires_at = created_at + chrono_duration(duration);
        let ov = LocationOverride {
            latitude,
            longitude,
            city,
            created_at,
            expires_at,
            source: source.to_string(),
        };

        self.persist(&ov)?;
        *self.slot.lock() = Slot::Present(ov.clone());

        info!(
            latitude,
            longitude,
            source,
            expires_at = %ov.expires_at,
            "location override set"
        );
        Ok(ov)
    }

    /// Current valid override, if any. Loads from durable storage once per
    /// process; an expired stored override is treated as absent and purged.
    pub fn current_override(&self) -> GeoResult<Option<LocationOverride>> {
        let mut slot = self.slot.lock();

        if matches!(*slot, Slot::Unloaded) {
            *slot = self.load_from_store()?;
        }

        if let Slot::Present(ov) = &*slot {
            if ov.is_expired_at(self.clock.utc()) {
                debug!(expired_at = %ov.expires_at, "override expired, purging");
                self.store.remove(OVERRIDE_KEY)?;
                *slot = Slot::Absent;
            }
        }

        match &*slot {
            Slot::Present(ov) => Ok(Some(ov.clone())),
            _ => Ok(None),
        }
    }

    /// Extend the active override, capped at `now + 7 days`. Returns false
    /// (no-op) when no valid override exists.
    pub fn extend_override(&self, by: Duration) -> GeoResult<bool> {
        let Some(current) = self.current_override()? else {
            return Ok(false);
        };

        let cap = self.clock.utc() + chrono_duration(MAX_OVERRIDE_DURATION);
        let extended = (current.expires_at + chrono_duration(by)).min(cap);

        let ov = LocationOverride {
            expires_at: extended,
            ..current
        };
        self.persist(&ov)?;
        *self.slot.lock() = Slot::Present(ov.clone());

        debug!(expires_at = %ov.expires_at, "override extended");
        Ok(true)
    }

    pub fn clear_override(&self) -> GeoResult<()> {
        self.store.remove(OVERRIDE_KEY)?;
        *self.slot.lock() = Slot::Absent;
        info!("location override cleared");
        Ok(())
    }

    fn persist(&self, ov: &LocationOverride) -> GeoResult<()> {
        let bytes =
            serde_json::to_vec(ov).map_err(|e| GeoError::Storage(e.to_string()))?;
        self.store.set(OVERRIDE_KEY, &bytes)
    }

    fn load_from_store(&self) -> GeoResult<Slot> {
        match self.store.get(OVERRIDE_KEY)? {
            None => Ok(Slot::Absent),
            Some(bytes) => match serde_json::from_slice::<LocationOverride>(&bytes) {
                Ok(ov) => Ok(Slot::Present(ov)),
                Err(e) => {
                    // Corrupted entry: drop it rather than fail every call.
                    warn!(error = %e, "stored override unreadable, purging");
                    self.store.remove(OVERRIDE_KEY)?;
                    Ok(Slot::Absent)
                }
            },
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
