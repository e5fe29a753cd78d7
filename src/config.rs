use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Runtime-settable knobs (spec.md §6). All are immutable once the first
/// driver starts — callers should build one `Config` and share it via
/// `Arc` rather than mutate fields after wiring the engine up.
#[derive(Debug, Clone)]
pub struct Config {
    pub slippage_pct: f64,
    pub fee_pct: f64,
    pub vwap_candle_count: usize,
    pub min_tp_pct: f64,
    pub min_sl_pct: f64,
    pub max_sl_pct: f64,
    pub schedule_await_minutes: i64,
    pub max_lifetime_min: i64,
    pub tick_ttl_ms: u64,
    pub candle_fetch_retries: u32,
    pub retry_delay_ms: u64,
    pub persistence_root: PathBuf,
    pub report_ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slippage_pct: 0.001,
            fee_pct: 0.001,
            vwap_candle_count: 5,
            min_tp_pct: 0.005,
            min_sl_pct: 0.005,
            max_sl_pct: 0.50,
            schedule_await_minutes: 1_440,
            max_lifetime_min: 10_080,
            tick_ttl_ms: 60_001,
            candle_fetch_retries: 5,
            retry_delay_ms: 1_000,
            persistence_root: PathBuf::from("./dump/persist"),
            report_ring_capacity: 250,
        }
    }
}

impl Config {
    /// Load from environment, falling back to spec.md's defaults for any
    /// variable that isn't set (teacher's `Config::from_env` pattern,
    /// `src/config.rs`).
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            slippage_pct: env_f64("SLE_SLIPPAGE_PCT", defaults.slippage_pct)?,
            fee_pct: env_f64("SLE_FEE_PCT", defaults.fee_pct)?,
            vwap_candle_count: env_usize("SLE_VWAP_CANDLE_COUNT", defaults.vwap_candle_count)?,
            min_tp_pct: env_f64("SLE_MIN_TP_PCT", defaults.min_tp_pct)?,
            min_sl_pct: env_f64("SLE_MIN_SL_PCT", defaults.min_sl_pct)?,
            max_sl_pct: env_f64("SLE_MAX_SL_PCT", defaults.max_sl_pct)?,
            schedule_await_minutes: env_i64(
                "SLE_SCHEDULE_AWAIT_MINUTES",
                defaults.schedule_await_minutes,
            )?,
            max_lifetime_min: env_i64("SLE_MAX_LIFETIME_MIN", defaults.max_lifetime_min)?,
            tick_ttl_ms: env_u64("SLE_TICK_TTL_MS", defaults.tick_ttl_ms)?,
            candle_fetch_retries: env_u32(
                "SLE_CANDLE_FETCH_RETRIES",
                defaults.candle_fetch_retries,
            )?,
            retry_delay_ms: env_u64("SLE_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            persistence_root: env::var("SLE_PERSISTENCE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.persistence_root),
            report_ring_capacity: env_usize(
                "SLE_REPORT_RING_CAPACITY",
                defaults.report_ring_capacity,
            )?
            .min(10_000), // spec.md §9 REDESIGN note 5: unbounded == 10_000 hard cap
        })
    }
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={v}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> anyhow::Result<f64> {
    env_parsed(key, default)
}
fn env_usize(key: &str, default: usize) -> anyhow::Result<usize> {
    env_parsed(key, default)
}
fn env_i64(key: &str, default: i64) -> anyhow::Result<i64> {
    env_parsed(key, default)
}
fn env_u64(key: &str, default: u64) -> anyhow::Result<u64> {
    env_parsed(key, default)
}
fn env_u32(key: &str, default: u32) -> anyhow::Result<u32> {
    env_parsed(key, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.slippage_pct, 0.001);
        assert_eq!(c.fee_pct, 0.001);
        assert_eq!(c.vwap_candle_count, 5);
        assert_eq!(c.schedule_await_minutes, 1_440);
        assert_eq!(c.max_lifetime_min, 10_080);
        assert_eq!(c.tick_ttl_ms, 60_001);
        assert_eq!(c.candle_fetch_retries, 5);
        assert_eq!(c.retry_delay_ms, 1_000);
    }

    #[test]
    fn report_ring_capacity_is_hard_capped() {
        // SAFETY: single-threaded test process; no other test in this
        // binary reads SLE_REPORT_RING_CAPACITY concurrently.
        unsafe {
            env::set_var("SLE_REPORT_RING_CAPACITY", "999999");
        }
        let c = Config::from_env().unwrap();
        assert_eq!(c.report_ring_capacity, 10_000);
        unsafe {
            env::remove_var("SLE_REPORT_RING_CAPACITY");
        }
    }
}
