//! Server Configuration
//!
//! Stake cap, fee, timing windows and thresholds are externally configured,
//! never hardcoded at call sites. Values load from environment variables
//! with development defaults.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::network::auth::AuthConfig;

/// All engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the HTTP surface.
    pub bind_addr: SocketAddr,
    /// Maximum stake per player, in micro-units.
    pub stake_cap_micros: u64,
    /// Platform fee in basis points (300 = 3%), applied to payouts and refunds.
    pub fee_bps: u32,
    /// Queue entry lifetime in seconds.
    pub queue_ttl_secs: i64,
    /// Time both players have to submit ready, in seconds.
    pub ready_timeout_secs: i64,
    /// Heartbeat staleness past which a player counts as abandoned, in seconds.
    pub heartbeat_grace_secs: i64,
    /// Fixed countdown before the randomized extra delay, in milliseconds.
    pub countdown_ms: u32,
    /// Lower bound of the randomized extra signal delay, in milliseconds.
    pub signal_delay_min_ms: u32,
    /// Upper bound of the randomized extra signal delay, in milliseconds.
    pub signal_delay_max_ms: u32,
    /// How long after the go instant taps are awaited before timeout
    /// resolution, in milliseconds.
    pub tap_timeout_ms: u32,
    /// Minimum human-plausible reaction in milliseconds; faster taps are
    /// flagged for anti-cheat, not disqualified.
    pub min_reaction_ms: u32,
    /// Window after resolution during which a winner may claim, in seconds.
    pub claim_window_secs: i64,
    /// Window during which a refund-eligible deposit may be reclaimed, in seconds.
    pub refund_window_secs: i64,
    /// Pending payments with no external transaction id fail after this
    /// many minutes.
    pub payment_timeout_minutes: i64,
    /// Base delay for payment retry backoff, in seconds.
    pub retry_base_secs: i64,
    /// Cap for payment retry backoff, in seconds.
    pub retry_cap_secs: i64,
    /// Cooperative lease duration for retry workers, in seconds.
    pub lease_secs: i64,
    /// Rolling-average reaction below this many milliseconds is flagged
    /// as implausible.
    pub implausible_avg_ms: u32,
    /// Number of matches the anti-cheat rolling average spans.
    pub anticheat_window: usize,
    /// Interval between background sweep passes, in seconds.
    pub sweep_interval_secs: u64,
    /// Shared secret expected on payment webhook calls.
    pub webhook_secret: Option<String>,
    /// Bearer token validation settings.
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            stake_cap_micros: 5_000_000, // 5.0 units
            fee_bps: 300,                // 3%
            queue_ttl_secs: 60,
            ready_timeout_secs: 30,
            heartbeat_grace_secs: 10,
            countdown_ms: 3_000,
            signal_delay_min_ms: 1_000,
            signal_delay_max_ms: 4_000,
            tap_timeout_ms: 10_000,
            min_reaction_ms: 80,
            claim_window_secs: 24 * 3600,
            refund_window_secs: 72 * 3600,
            payment_timeout_minutes: 15,
            retry_base_secs: 5,
            retry_cap_secs: 300,
            lease_secs: 30,
            implausible_avg_ms: 150,
            anticheat_window: 10,
            sweep_interval_secs: 1,
            webhook_secret: None,
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("SNAPDUEL_BIND_ADDR", defaults.bind_addr),
            stake_cap_micros: env_parse("SNAPDUEL_STAKE_CAP_MICROS", defaults.stake_cap_micros),
            fee_bps: env_parse("SNAPDUEL_FEE_BPS", defaults.fee_bps),
            queue_ttl_secs: env_parse("SNAPDUEL_QUEUE_TTL_SECS", defaults.queue_ttl_secs),
            ready_timeout_secs: env_parse("SNAPDUEL_READY_TIMEOUT_SECS", defaults.ready_timeout_secs),
            heartbeat_grace_secs: env_parse(
                "SNAPDUEL_HEARTBEAT_GRACE_SECS",
                defaults.heartbeat_grace_secs,
            ),
            countdown_ms: env_parse("SNAPDUEL_COUNTDOWN_MS", defaults.countdown_ms),
            signal_delay_min_ms: env_parse(
                "SNAPDUEL_SIGNAL_DELAY_MIN_MS",
                defaults.signal_delay_min_ms,
            ),
            signal_delay_max_ms: env_parse(
                "SNAPDUEL_SIGNAL_DELAY_MAX_MS",
                defaults.signal_delay_max_ms,
            ),
            tap_timeout_ms: env_parse("SNAPDUEL_TAP_TIMEOUT_MS", defaults.tap_timeout_ms),
            min_reaction_ms: env_parse("SNAPDUEL_MIN_REACTION_MS", defaults.min_reaction_ms),
            claim_window_secs: env_parse("SNAPDUEL_CLAIM_WINDOW_SECS", defaults.claim_window_secs),
            refund_window_secs: env_parse("SNAPDUEL_REFUND_WINDOW_SECS", defaults.refund_window_secs),
            payment_timeout_minutes: env_parse(
                "SNAPDUEL_PAYMENT_TIMEOUT_MINUTES",
                defaults.payment_timeout_minutes,
            ),
            retry_base_secs: env_parse("SNAPDUEL_RETRY_BASE_SECS", defaults.retry_base_secs),
            retry_cap_secs: env_parse("SNAPDUEL_RETRY_CAP_SECS", defaults.retry_cap_secs),
            lease_secs: env_parse("SNAPDUEL_LEASE_SECS", defaults.lease_secs),
            implausible_avg_ms: env_parse("SNAPDUEL_IMPLAUSIBLE_AVG_MS", defaults.implausible_avg_ms),
            anticheat_window: env_parse("SNAPDUEL_ANTICHEAT_WINDOW", defaults.anticheat_window),
            sweep_interval_secs: env_parse("SNAPDUEL_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            webhook_secret: std::env::var("SNAPDUEL_WEBHOOK_SECRET").ok(),
            auth: AuthConfig::from_env(),
        }
    }

    /// Payout owed to a winner: both stakes minus the platform fee.
    pub fn payout_micros(&self, stake_micros: u64) -> u64 {
        let pot = stake_micros.saturating_mul(2);
        pot.saturating_mul(10_000 - self.fee_bps as u64) / 10_000
    }

    /// Refund owed on a reclaimed deposit: the stake minus the platform fee.
    pub fn refund_micros(&self, stake_micros: u64) -> u64 {
        stake_micros.saturating_mul(10_000 - self.fee_bps as u64) / 10_000
    }
}

/// Parse an environment variable, falling back to the default when unset
/// or unparseable.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
