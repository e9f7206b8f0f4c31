use std::env;
use std::time::Duration;

/// The config surface recognized by the sync hub (spec §6).
///
/// Every field has a default; all are overridable via environment
/// variables so the binary can be tuned without a rebuild, the way the
/// teacher reads `DATABASE_URL` / `BIND_ADDR` / `LOG_LEVEL` in `main.rs`.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub heartbeat_interval_s: u64,
    pub outbound_queue_cap: usize,
    pub max_conns_per_user: usize,
    pub mutation_rate_per_s: u32,
    pub mutation_burst: u32,
    pub log_retention_days: u32,
    pub catchup_page_size: i64,
    pub per_frame_send_timeout_s: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_s: 25,
            outbound_queue_cap: 1024,
            max_conns_per_user: 16,
            mutation_rate_per_s: 50,
            mutation_burst: 200,
            log_retention_days: 30,
            catchup_page_size: 500,
            per_frame_send_timeout_s: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            heartbeat_interval_s: env_u64("HEARTBEAT_INTERVAL_S", default.heartbeat_interval_s),
            outbound_queue_cap: env_usize("OUTBOUND_QUEUE_CAP", default.outbound_queue_cap),
            max_conns_per_user: env_usize("MAX_CONNS_PER_USER", default.max_conns_per_user),
            mutation_rate_per_s: env_u32("MUTATION_RATE_PER_S", default.mutation_rate_per_s),
            mutation_burst: env_u32("MUTATION_BURST", default.mutation_burst),
            log_retention_days: env_u32("LOG_RETENTION_DAYS", default.log_retention_days),
            catchup_page_size: env_i64("CATCHUP_PAGE_SIZE", default.catchup_page_size),
            per_frame_send_timeout_s: env_u64(
                "PER_FRAME_SEND_TIMEOUT_S",
                default.per_frame_send_timeout_s,
            ),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    /// Spec §5: "Heartbeat timeout equals 2 × heartbeat_interval_s exactly."
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s * 2)
    }

    pub fn per_frame_send_timeout(&self) -> Duration {
        Duration::from_secs(self.per_frame_send_timeout_s)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.log_retention_days) * 24 * 3600)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_surface() {
        let c = Config::default();
        assert_eq!(c.heartbeat_interval_s, 25);
        assert_eq!(c.outbound_queue_cap, 1024);
        assert_eq!(c.max_conns_per_user, 16);
        assert_eq!(c.mutation_rate_per_s, 50);
        assert_eq!(c.mutation_burst, 200);
        assert_eq!(c.log_retention_days, 30);
        assert_eq!(c.catchup_page_size, 500);
        assert_eq!(c.per_frame_send_timeout_s, 30);
    }

    #[test]
    fn heartbeat_timeout_is_exactly_double_the_interval() {
        let c = Config::default();
        assert_eq!(c.heartbeat_timeout(), c.heartbeat_interval() * 2);
    }
}
