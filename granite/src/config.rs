//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DbError, DbResult};
use crate::DEFAULT_PAGES;

/// Configuration for one [`Database`](crate::Database) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of pages in the buffer pool.
    pub pool_pages: usize,
    /// First wait of a blocked lock request before it re-checks its state.
    pub lock_backoff_initial: Duration,
    /// Upper bound for the doubling lock wait.
    pub lock_backoff_max: Duration,
    /// Before/after-image log. Disabled when `None`.
    pub image_log_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_pages: DEFAULT_PAGES,
            lock_backoff_initial: Duration::from_millis(1),
            lock_backoff_max: Duration::from_millis(50),
            image_log_path: None,
        }
    }
}

impl EngineConfig {
    pub fn with_pool_pages(mut self, pages: usize) -> Self {
        self.pool_pages = pages;
        self
    }

    pub fn with_lock_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.lock_backoff_initial = initial;
        self.lock_backoff_max = max;
        self
    }

    pub fn with_image_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_log_path = Some(path.into());
        self
    }

    /// Defaults overridden by `GRANITE_POOL_PAGES`, `GRANITE_LOCK_BACKOFF_MS`,
    /// `GRANITE_LOCK_BACKOFF_MAX_MS` and `GRANITE_IMAGE_LOG`.
    pub fn from_env() -> DbResult<Self> {
        let mut config = Self::default();
        if let Some(pages) = env_parse::<usize>("GRANITE_POOL_PAGES")? {
            config.pool_pages = pages;
        }
        if let Some(ms) = env_parse::<u64>("GRANITE_LOCK_BACKOFF_MS")? {
            config.lock_backoff_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("GRANITE_LOCK_BACKOFF_MAX_MS")? {
            config.lock_backoff_max = Duration::from_millis(ms);
        }
        if let Some(path) = std::env::var_os("GRANITE_IMAGE_LOG") {
            config.image_log_path = Some(PathBuf::from(path));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.pool_pages == 0 {
            return Err(DbError::Config {
                key: "pool_pages".to_string(),
                value: "0".to_string(),
            });
        }
        if self.lock_backoff_initial.is_zero() || self.lock_backoff_max < self.lock_backoff_initial {
            return Err(DbError::Config {
                key: "lock_backoff".to_string(),
                value: format!(
                    "{:?}..{:?}",
                    self.lock_backoff_initial, self.lock_backoff_max
                ),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> DbResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DbError::Config {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}
