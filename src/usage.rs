//! Speaking-time quotas
//!
//! `UsageGuard` enforces two ceilings:
//! - a per-session wall-clock ceiling (enforced by the controller's timer)
//! - a per-day ceiling per configuration identity, backed by a durable
//!   counter keyed by `(config identity, calendar day)`
//!
//! The counter store is an abstract key → integer map. A new calendar day
//! yields a new key, so usage restarts from zero without any reset step.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Usage ceilings and the accrual tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageLimits {
    /// Maximum wall-clock length of one conversation
    pub session: Duration,
    /// Maximum aggregate length per calendar day per configuration
    pub daily: Duration,
    /// How often elapsed time is added to the daily counter
    pub accrual_tick: Duration,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            session: Duration::from_secs(5 * 60), // 5 minutes per conversation
            daily: Duration::from_secs(20 * 60),  // 20 minutes per day
            accrual_tick: Duration::from_secs(5),
        }
    }
}

impl UsageLimits {
    /// Reject limits the usage timers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.accrual_tick.is_zero() {
            bail!("Usage accrual tick must be greater than zero");
        }
        if self.session.is_zero() {
            bail!("Session limit must be greater than zero");
        }
        if self.daily.is_zero() {
            bail!("Daily limit must be greater than zero");
        }
        Ok(())
    }
}

/// Durable key → integer store
pub trait UsageStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<u64>>;
    fn set(&self, key: &str, value: u64) -> Result<()>;
}

/// Process-local store, used in tests and when no store path is configured
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    values: Mutex<HashMap<String, u64>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsageStore for MemoryUsageStore {
    fn get(&self, key: &str) -> Result<Option<u64>> {
        let values = self.values.lock().map_err(|_| anyhow!("usage store poisoned"))?;
        Ok(values.get(key).copied())
    }

    fn set(&self, key: &str, value: u64) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| anyhow!("usage store poisoned"))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Store persisted as a flat JSON object on disk
///
/// Every `set` rewrites the file through a temporary sibling and a rename,
/// so a crash never leaves a half-written counter file behind.
#[derive(Debug)]
pub struct JsonFileUsageStore {
    path: PathBuf,
    values: Mutex<HashMap<String, u64>>,
}

impl JsonFileUsageStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let values = if path.exists() {
            let raw = std::fs::read(&path)
                .with_context(|| format!("Failed to read usage store: {}", path.display()))?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("Failed to parse usage store: {}", path.display()))?
        } else {
            HashMap::new()
        };

        info!("Usage store opened: {} ({} keys)", path.display(), values.len());

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &HashMap<String, u64>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create usage store directory")?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(values)?)
            .context("Failed to write usage store")?;
        std::fs::rename(&tmp, &self.path).context("Failed to replace usage store")?;
        Ok(())
    }
}

impl UsageStore for JsonFileUsageStore {
    fn get(&self, key: &str) -> Result<Option<u64>> {
        let values = self.values.lock().map_err(|_| anyhow!("usage store poisoned"))?;
        Ok(values.get(key).copied())
    }

    fn set(&self, key: &str, value: u64) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| anyhow!("usage store poisoned"))?;
        values.insert(key.to_string(), value);
        self.persist(&values)
    }
}

/// Counter key for a configuration identity on a calendar day
pub fn usage_key(config_id: &str, day: NaiveDate) -> String {
    format!("usage_{}_{}", config_id, day.format("%Y-%m-%d"))
}

type Calendar = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Reads and increments daily usage, and answers whether a session may start
///
/// Increments are read-modify-write and not atomic across processes. Only
/// one session accrues at a time, so that is sufficient here.
#[derive(Clone)]
pub struct UsageGuard {
    store: Arc<dyn UsageStore>,
    limits: UsageLimits,
    today: Calendar,
}

impl UsageGuard {
    /// Guard using the current UTC calendar day
    pub fn new(store: Arc<dyn UsageStore>, limits: UsageLimits) -> Self {
        Self::with_calendar(store, limits, Arc::new(|| Utc::now().date_naive()))
    }

    pub fn with_calendar(store: Arc<dyn UsageStore>, limits: UsageLimits, today: Calendar) -> Self {
        Self { store, limits, today }
    }

    pub fn limits(&self) -> UsageLimits {
        self.limits
    }

    fn daily_ceiling_ms(&self) -> u64 {
        self.limits.daily.as_millis() as u64
    }

    /// Milliseconds used today by this configuration
    pub fn daily_usage(&self, config_id: &str) -> Result<u64> {
        let key = usage_key(config_id, (self.today)());
        Ok(self.store.get(&key)?.unwrap_or(0))
    }

    /// Whether today's usage is still below the daily ceiling
    pub fn can_start(&self, config_id: &str) -> Result<bool> {
        Ok(self.daily_usage(config_id)? < self.daily_ceiling_ms())
    }

    /// Add `delta_ms` to today's counter, returning the new total
    pub fn accrue(&self, config_id: &str, delta_ms: u64) -> Result<u64> {
        let key = usage_key(config_id, (self.today)());
        let current = self.store.get(&key)?.unwrap_or(0);
        let total = current.saturating_add(delta_ms);
        self.store.set(&key, total)?;

        debug!("Accrued {}ms for {} (total {}ms)", delta_ms, key, total);

        Ok(total)
    }
}
