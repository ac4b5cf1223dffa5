use std::env;
use std::time::Duration;

use crate::error::ConfigError;
use crate::guest_token::RefreshTiming;
use crate::telemetry::env_flag;

pub const DEBUG_ENV: &str = "DASHBOARD_EMBED_DEBUG";
pub const REFRESH_BUFFER_ENV: &str = "DASHBOARD_EMBED_REFRESH_BUFFER_MS";
pub const MIN_REFRESH_WAIT_ENV: &str = "DASHBOARD_EMBED_MIN_REFRESH_WAIT_MS";
pub const DEFAULT_TOKEN_TTL_ENV: &str = "DASHBOARD_EMBED_DEFAULT_TOKEN_TTL_MS";

/// Process-wide defaults applied to embed requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedSettings {
    pub debug: bool,
    pub refresh: RefreshTiming,
}

impl EmbedSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::from_lookup(|var| env::var(var).ok())?;
        settings.debug = env_flag(DEBUG_ENV);
        Ok(settings)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = RefreshTiming::default();
        let refresh = RefreshTiming {
            buffer: millis(&lookup, REFRESH_BUFFER_ENV)?.unwrap_or(defaults.buffer),
            min_wait: millis(&lookup, MIN_REFRESH_WAIT_ENV)?.unwrap_or(defaults.min_wait),
            default_ttl: millis(&lookup, DEFAULT_TOKEN_TTL_ENV)?.unwrap_or(defaults.default_ttl),
        };
        Ok(Self {
            debug: false,
            refresh,
        })
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(var).filter(|value| !value.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::InvalidMillis { var, value: raw })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let settings = EmbedSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.refresh, RefreshTiming::default());
        assert!(!settings.debug);
    }

    #[test]
    fn overrides_refresh_timing() {
        let settings = EmbedSettings::from_lookup(lookup(&[
            (REFRESH_BUFFER_ENV, "2000"),
            (MIN_REFRESH_WAIT_ENV, " 15000 "),
            (DEFAULT_TOKEN_TTL_ENV, ""),
        ]))
        .unwrap();
        assert_eq!(settings.refresh.buffer, Duration::from_secs(2));
        assert_eq!(settings.refresh.min_wait, Duration::from_secs(15));
        assert_eq!(settings.refresh.default_ttl, Duration::from_secs(300));
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = EmbedSettings::from_lookup(lookup(&[(REFRESH_BUFFER_ENV, "5s")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidMillis { var: REFRESH_BUFFER_ENV, ref value } if value == "5s"
        ));
    }
}
