use dotenvy::dotenv;
use std::env;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Runtime configuration.
///
/// Every tunable window and threshold is exposed here; the defaults are the
/// production values and changing them does not alter any semantics, only
/// the widths of the derivation windows.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    /// A typing mark older than this no longer counts as "typing".
    pub typing_window_secs: u64,
    /// A presence mark older than this no longer counts as "online".
    pub presence_window_secs: u64,
    /// Durable last-seen refresh is rate-limited to once per this interval
    /// per user.
    pub presence_sync_secs: u64,
    /// Presence marks idle beyond this are evicted by the reaper.
    pub presence_evict_secs: u64,

    /// Read-receipt events older than this are dropped on access.
    pub receipt_retention_secs: u64,
    /// Hard cap on buffered receipt events per conversation.
    pub receipt_buffer_cap: usize,

    /// Cache entry lists longer than this get trimmed by the reaper...
    pub cache_trim_threshold: usize,
    /// ...down to this many trailing entries.
    pub cache_trim_to: usize,

    /// How many trailing messages a windowless fetch returns.
    pub recent_window: i64,

    pub reaper_interval_secs: u64,

    /// Bound on every outbound push delivery attempt.
    pub push_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            typing_window_secs: 4,
            presence_window_secs: 30,
            presence_sync_secs: 60,
            presence_evict_secs: 3600,
            receipt_retention_secs: 60,
            receipt_buffer_cap: 500,
            cache_trim_threshold: 1000,
            cache_trim_to: 500,
            recent_window: 50,
            reaper_interval_secs: 300,
            push_timeout_secs: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;

        let defaults = Config::default();
        Ok(Self {
            database_url,
            typing_window_secs: env_u64("TYPING_WINDOW_SECS", defaults.typing_window_secs),
            presence_window_secs: env_u64("PRESENCE_WINDOW_SECS", defaults.presence_window_secs),
            presence_sync_secs: env_u64("PRESENCE_SYNC_SECS", defaults.presence_sync_secs),
            presence_evict_secs: env_u64("PRESENCE_EVICT_SECS", defaults.presence_evict_secs),
            receipt_retention_secs: env_u64(
                "RECEIPT_RETENTION_SECS",
                defaults.receipt_retention_secs,
            ),
            receipt_buffer_cap: env_usize("RECEIPT_BUFFER_CAP", defaults.receipt_buffer_cap),
            cache_trim_threshold: env_usize("CACHE_TRIM_THRESHOLD", defaults.cache_trim_threshold),
            cache_trim_to: env_usize("CACHE_TRIM_TO", defaults.cache_trim_to),
            recent_window: env_u64("RECENT_WINDOW", defaults.recent_window as u64) as i64,
            reaper_interval_secs: env_u64("REAPER_INTERVAL_SECS", defaults.reaper_interval_secs),
            push_timeout_secs: env_u64("PUSH_TIMEOUT_SECS", defaults.push_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_production_values() {
        let cfg = Config::default();
        assert_eq!(cfg.typing_window_secs, 4);
        assert_eq!(cfg.presence_window_secs, 30);
        assert_eq!(cfg.presence_sync_secs, 60);
        assert_eq!(cfg.receipt_retention_secs, 60);
        assert_eq!(cfg.cache_trim_threshold, 1000);
        assert_eq!(cfg.cache_trim_to, 500);
        assert_eq!(cfg.recent_window, 50);
        assert_eq!(cfg.reaper_interval_secs, 300);
    }
}
