//! Environment-driven configuration, following this codebase's existing
//! `load_config()` pattern: each field is read with `std::env::var`, parsed,
//! and falls back to a typed default rather than panicking on absence.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcoMode {
    PerPartial,
    PostComplete,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub broker_base_url: String,
    pub broker_api_password_file: Option<String>,

    pub rate_order_per_sec: u32,
    pub rate_info_per_sec: u32,

    pub poll_orders_interval: Duration,
    pub poll_positions_interval: Duration,

    pub scheduler_miss_grace: Duration,

    pub eod_default_close_time: (u32, u32),
    pub eod_enabled: bool,

    pub oco_mode: OcoMode,

    pub cancel_wait: Duration,
    pub retry_max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://intraday-ctl.db".to_string(),
            broker_base_url: "http://127.0.0.1:8080".to_string(),
            broker_api_password_file: None,
            rate_order_per_sec: 5,
            rate_info_per_sec: 10,
            poll_orders_interval: Duration::from_millis(1500),
            poll_positions_interval: Duration::from_millis(3000),
            scheduler_miss_grace: Duration::from_secs(300),
            eod_default_close_time: (14, 30),
            eod_enabled: true,
            oco_mode: OcoMode::PerPartial,
            cancel_wait: Duration::from_millis(3000),
            retry_max_attempts: 3,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_close_time(val: &str, default: (u32, u32)) -> (u32, u32) {
    let mut parts = val.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(h), Some(m)) => match (h.parse(), m.parse()) {
            (Ok(h), Ok(m)) => (h, m),
            _ => default,
        },
        _ => default,
    }
}

impl Config {
    /// Loads configuration from the process environment, falling back to
    /// `Config::default()` for anything unset or unparsable.
    pub fn load() -> Self {
        let defaults = Config::default();

        let eod_default_close_time = match std::env::var("EOD_DEFAULT_CLOSE_TIME") {
            Ok(val) => parse_close_time(&val, defaults.eod_default_close_time),
            Err(_) => defaults.eod_default_close_time,
        };

        let oco_mode = match std::env::var("OCO_MODE").as_deref() {
            Ok("post_complete") => OcoMode::PostComplete,
            Ok("per_partial") => OcoMode::PerPartial,
            _ => defaults.oco_mode,
        };

        Config {
            database_url: match std::env::var("DATABASE_URL") {
                Ok(v) => v,
                Err(_) => defaults.database_url,
            },
            broker_base_url: match std::env::var("BROKER_BASE_URL") {
                Ok(v) => v,
                Err(_) => defaults.broker_base_url,
            },
            broker_api_password_file: std::env::var("BROKER_API_PASSWORD_FILE").ok(),
            rate_order_per_sec: env_or("RATE_ORDER_PER_SEC", defaults.rate_order_per_sec),
            rate_info_per_sec: env_or("RATE_INFO_PER_SEC", defaults.rate_info_per_sec),
            poll_orders_interval: Duration::from_millis(env_or(
                "POLL_ORDERS_INTERVAL_MS",
                defaults.poll_orders_interval.as_millis() as u64,
            )),
            poll_positions_interval: Duration::from_millis(env_or(
                "POLL_POSITIONS_INTERVAL_MS",
                defaults.poll_positions_interval.as_millis() as u64,
            )),
            scheduler_miss_grace: Duration::from_secs(env_or(
                "SCHEDULER_MISS_GRACE_SEC",
                defaults.scheduler_miss_grace.as_secs(),
            )),
            eod_default_close_time,
            eod_enabled: env_or("EOD_ENABLED", defaults.eod_enabled),
            oco_mode,
            cancel_wait: Duration::from_millis(env_or(
                "CANCEL_WAIT_MS",
                defaults.cancel_wait.as_millis() as u64,
            )),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.rate_order_per_sec, 5);
        assert_eq!(cfg.eod_default_close_time, (14, 30));
        assert_eq!(cfg.oco_mode, OcoMode::PerPartial);
    }

    #[test]
    fn parses_close_time() {
        assert_eq!(parse_close_time("9:05", (0, 0)), (9, 5));
        assert_eq!(parse_close_time("garbage", (14, 30)), (14, 30));
    }
}
