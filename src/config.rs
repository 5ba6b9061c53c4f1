//! Engine configuration loaded from the environment.

use std::{env, time::Duration};

/// Tunables for the Happy Eyeballs engine.
///
/// A `Config` is immutable for the lifetime of a dial. [`Config::from_env`]
/// reads the `LETSDANE_*` variables; malformed values fall back to the
/// defaults and `connection_delay` is clamped after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Gates the entire engine. When false, callers are expected to use
    /// their ordinary dial path instead.
    pub enabled: bool,
    /// Head start granted to the IPv6 DNS query before IPv4 is issued.
    pub resolution_delay: Duration,
    /// Stagger between successive connection attempts in a race.
    pub connection_delay: Duration,
    /// Turns on the metrics recorder.
    pub metrics_enabled: bool,
    /// Adds per-attempt debug lines to the race.
    pub verbose_logging: bool,
}

impl Config {
    /// Default IPv6 resolution head start.
    pub const DEFAULT_RESOLUTION_DELAY: Duration = Duration::from_millis(50);
    /// Default inter-attempt stagger.
    pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(250);
    /// Lower clamp bound for [`Config::connection_delay`].
    pub const MIN_CONNECTION_DELAY: Duration = Duration::from_millis(100);
    /// Upper clamp bound for [`Config::connection_delay`].
    pub const MAX_CONNECTION_DELAY: Duration = Duration::from_secs(2);

    /// Loads configuration from the environment.
    ///
    /// Recognized variables:
    ///
    /// | variable | type | default |
    /// |---|---|---|
    /// | `LETSDANE_HAPPY_EYEBALLS` | bool | `false` |
    /// | `LETSDANE_HE_RESOLUTION_DELAY` | integer ms | `50` |
    /// | `LETSDANE_HE_CONNECTION_DELAY` | integer ms, clamped to [100, 2000] | `250` |
    /// | `LETSDANE_HE_METRICS` | bool | value of the enabled flag |
    /// | `LETSDANE_HE_VERBOSE` | bool | `false` |
    pub fn from_env() -> Self {
        let enabled = env_bool("LETSDANE_HAPPY_EYEBALLS", false);
        let connection_delay = env_duration_ms(
            "LETSDANE_HE_CONNECTION_DELAY",
            Self::DEFAULT_CONNECTION_DELAY,
        )
        .clamp(Self::MIN_CONNECTION_DELAY, Self::MAX_CONNECTION_DELAY);

        Config {
            enabled,
            resolution_delay: env_duration_ms(
                "LETSDANE_HE_RESOLUTION_DELAY",
                Self::DEFAULT_RESOLUTION_DELAY,
            ),
            connection_delay,
            metrics_enabled: env_bool("LETSDANE_HE_METRICS", enabled),
            verbose_logging: env_bool("LETSDANE_HE_VERBOSE", false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: false,
            resolution_delay: Self::DEFAULT_RESOLUTION_DELAY,
            connection_delay: Self::DEFAULT_CONNECTION_DELAY,
            metrics_enabled: false,
            verbose_logging: false,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => true,
            "0" | "f" | "false" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .map(Duration::from_millis)
            .unwrap_or(default),
        Err(_) => default,
    }
}
