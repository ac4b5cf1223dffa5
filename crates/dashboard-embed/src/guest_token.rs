//! Guest token delivery and the refresh loop that keeps it alive.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::switchboard::{Switchboard, SwitchboardError};
use crate::telemetry::{EmbedLog, LOG_TARGET};

pub const GUEST_TOKEN_METHOD: &str = "guestToken";

/// Refresh this long before the token expires.
pub const REFRESH_TIMING_BUFFER: Duration = Duration::from_millis(5_000);
/// Never wait less than this between refreshes.
pub const MIN_REFRESH_WAIT: Duration = Duration::from_millis(10_000);
/// Assumed lifetime of a token whose expiry cannot be read.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_millis(300_000);

/// Source of guest tokens supplied by the host.
#[async_trait]
pub trait GuestTokenFetcher: Send + Sync {
    async fn fetch_guest_token(&self) -> anyhow::Result<String>;
}

#[async_trait]
impl<F, Fut> GuestTokenFetcher for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn fetch_guest_token(&self) -> anyhow::Result<String> {
        (self)().await
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTiming {
    pub buffer: Duration,
    pub min_wait: Duration,
    pub default_ttl: Duration,
}

impl Default for RefreshTiming {
    fn default() -> Self {
        Self {
            buffer: REFRESH_TIMING_BUFFER,
            min_wait: MIN_REFRESH_WAIT,
            default_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

/// Reads the `exp` claim from a JWT-shaped token without verifying it.
///
/// Numeric values (or numeric strings) are seconds since the epoch; any other
/// string is parsed as an RFC 3339 timestamp.
pub fn token_expiry(token: &str) -> Option<SystemTime> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    match claims.get("exp")? {
        Value::Number(seconds) => epoch_seconds(seconds.as_f64()?),
        Value::String(text) => {
            let text = text.trim();
            if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit() || c == '.') {
                epoch_seconds(text.parse().ok()?)
            } else {
                OffsetDateTime::parse(text, &Rfc3339)
                    .ok()
                    .map(SystemTime::from)
            }
        }
        _ => None,
    }
}

/// Out-of-range expiries are unreadable. Pre-epoch ones are already expired.
fn epoch_seconds(seconds: f64) -> Option<SystemTime> {
    if seconds < 0.0 {
        let before = Duration::try_from_secs_f64(-seconds).ok();
        return Some(
            before
                .and_then(|before| UNIX_EPOCH.checked_sub(before))
                .unwrap_or(UNIX_EPOCH),
        );
    }
    UNIX_EPOCH.checked_add(Duration::try_from_secs_f64(seconds).ok()?)
}

/// How long to wait before fetching the replacement for `token`.
pub fn refresh_delay(token: &str, now: SystemTime, timing: &RefreshTiming) -> Duration {
    let ttl = match token_expiry(token) {
        Some(expires_at) => expires_at
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
            .max(timing.min_wait),
        None => timing.default_ttl,
    };
    ttl.saturating_sub(timing.buffer)
}

/// Sends `token` to the embedded dashboard.
pub fn deliver_guest_token(switchboard: &Switchboard, token: &str) -> Result<(), SwitchboardError> {
    switchboard.emit(GUEST_TOKEN_METHOD, json!({ "guestToken": token }))
}

/// Keeps fetching and delivering guest tokens, each one scheduled from the
/// expiry of the token before it.
pub struct GuestTokenRefresher {
    fetcher: Arc<dyn GuestTokenFetcher>,
    switchboard: Switchboard,
    timing: RefreshTiming,
    clock: Arc<dyn Clock>,
    log: EmbedLog,
}

impl GuestTokenRefresher {
    pub fn new(
        fetcher: Arc<dyn GuestTokenFetcher>,
        switchboard: Switchboard,
        timing: RefreshTiming,
        clock: Arc<dyn Clock>,
        log: EmbedLog,
    ) -> Self {
        Self {
            fetcher,
            switchboard,
            timing,
            clock,
            log,
        }
    }

    /// Starts the loop with `current` as the token already delivered.
    pub fn spawn(self, current: String) -> RefreshHandle {
        RefreshHandle {
            task: tokio::spawn(self.run(current)),
        }
    }

    async fn run(self, mut current: String) {
        loop {
            let delay = refresh_delay(&current, self.clock.now(), &self.timing);
            self.log
                .debug(format_args!("next guest token refresh in {delay:?}"));
            tokio::time::sleep(delay).await;

            let token = match self.fetcher.fetch_guest_token().await {
                Ok(token) => token,
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        dashboard = %self.log.dashboard(),
                        error = %err,
                        "guest token refresh failed; no further refreshes will run"
                    );
                    return;
                }
            };
            if let Err(err) = deliver_guest_token(&self.switchboard, &token) {
                warn!(
                    target: LOG_TARGET,
                    dashboard = %self.log.dashboard(),
                    error = %err,
                    "could not deliver refreshed guest token"
                );
                return;
            }
            self.log.debug("sent refreshed guest token");
            current = token;
        }
    }
}

/// Owner of a running refresh loop.
#[derive(Debug)]
pub struct RefreshHandle {
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_with_exp(exp: Value) -> String {
        encode(
            &Header::default(),
            &json!({ "exp": exp, "user": {"username": "guest"} }),
            &EncodingKey::from_secret(b"guest-token-secret"),
        )
        .expect("sign token")
    }

    fn at(seconds: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn reads_numeric_expiry() {
        let token = token_with_exp(json!(1_700_000_060));
        assert_eq!(token_expiry(&token), Some(at(1_700_000_060)));
    }

    #[test]
    fn reads_string_expiry() {
        let numeric = token_with_exp(json!("1700000060"));
        assert_eq!(token_expiry(&numeric), Some(at(1_700_000_060)));

        let dated = token_with_exp(json!("2023-11-14T22:14:20Z"));
        assert_eq!(token_expiry(&dated), Some(at(1_700_000_060)));
    }

    #[test]
    fn refresh_fires_before_expiry() {
        let now = at(1_700_000_000);
        let token = token_with_exp(json!(1_700_000_060));
        let delay = refresh_delay(&token, now, &RefreshTiming::default());
        assert_eq!(delay, Duration::from_secs(55));
        assert!(delay < Duration::from_secs(60));
    }

    #[test]
    fn near_expiry_waits_the_minimum() {
        let now = at(1_700_000_000);
        let expired = token_with_exp(json!(1_699_999_000));
        assert_eq!(
            refresh_delay(&expired, now, &RefreshTiming::default()),
            Duration::from_secs(5)
        );
        let soon = token_with_exp(json!(1_700_000_003));
        assert_eq!(
            refresh_delay(&soon, now, &RefreshTiming::default()),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn unreadable_tokens_use_default_ttl() {
        let timing = RefreshTiming::default();
        let now = at(1_700_000_000);
        assert_eq!(refresh_delay("tok1", now, &timing), Duration::from_secs(295));
        assert_eq!(
            refresh_delay("a.%%%.c", now, &timing),
            Duration::from_secs(295)
        );
        let no_exp = encode(
            &Header::default(),
            &json!({ "sub": "guest" }),
            &EncodingKey::from_secret(b"guest-token-secret"),
        )
        .unwrap();
        assert_eq!(refresh_delay(&no_exp, now, &timing), Duration::from_secs(295));
    }

    #[test]
    fn oversized_expiry_falls_back_to_default_ttl() {
        let timing = RefreshTiming::default();
        let huge = token_with_exp(json!(1e30));
        assert_eq!(token_expiry(&huge), None);
        assert_eq!(refresh_delay(&huge, UNIX_EPOCH, &timing), Duration::from_secs(295));

        let digits = token_with_exp(json!("99999999999999999999999"));
        assert_eq!(refresh_delay(&digits, UNIX_EPOCH, &timing), Duration::from_secs(295));
    }

    #[test]
    fn pre_epoch_expiry_counts_as_expired() {
        let now = at(1_700_000_000);
        let token = token_with_exp(json!(-100));
        assert!(token_expiry(&token).is_some_and(|exp| exp < UNIX_EPOCH + Duration::from_secs(1)));
        assert_eq!(
            refresh_delay(&token, now, &RefreshTiming::default()),
            Duration::from_secs(5)
        );
        let far_past = token_with_exp(json!(-1e30));
        assert_eq!(
            refresh_delay(&far_past, now, &RefreshTiming::default()),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn custom_timing_never_underflows() {
        let timing = RefreshTiming {
            buffer: Duration::from_secs(30),
            min_wait: Duration::from_secs(1),
            default_ttl: Duration::from_secs(10),
        };
        assert_eq!(refresh_delay("opaque", at(0), &timing), Duration::ZERO);
    }
}
