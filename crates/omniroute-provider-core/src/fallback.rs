//! Error classification for the account fallback loop.

use std::time::Duration;

/// What to do after a failed upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackDecision {
    pub should_fallback: bool,
    pub cooldown: Duration,
    pub new_backoff_level: u32,
}

impl FallbackDecision {
    pub const fn pass_through() -> Self {
        Self {
            should_fallback: false,
            cooldown: Duration::ZERO,
            new_backoff_level: 0,
        }
    }
}

const RATE_LIMIT_BASE: Duration = Duration::from_secs(60);
const RATE_LIMIT_CAP: Duration = Duration::from_secs(60 * 60);
const SERVER_ERROR_BASE: Duration = Duration::from_secs(30);
const SERVER_ERROR_CAP: Duration = Duration::from_secs(10 * 60);
const AUTH_COOLDOWN: Duration = Duration::from_secs(5 * 60);
const NETWORK_BASE: Duration = Duration::from_secs(15);
const NETWORK_CAP: Duration = Duration::from_secs(60 * 60);

fn backoff(base: Duration, level: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(level.min(20)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map(|d| d.min(cap)).unwrap_or(cap)
}

/// Classify one failed attempt.
///
/// `status` is the upstream HTTP status, or `None` for transport failures
/// (connect/timeout). `retry_after_ms` carries a provider-parsed recovery
/// hint (Antigravity quota messages) used verbatim when present.
pub fn check_fallback_error(
    status: Option<u16>,
    retry_after_ms: Option<u64>,
    backoff_level: u32,
) -> FallbackDecision {
    if let Some(ms) = retry_after_ms {
        return FallbackDecision {
            should_fallback: true,
            cooldown: Duration::from_millis(ms),
            new_backoff_level: backoff_level + 1,
        };
    }
    match status {
        None => FallbackDecision {
            should_fallback: true,
            cooldown: backoff(NETWORK_BASE, backoff_level, NETWORK_CAP),
            new_backoff_level: backoff_level + 1,
        },
        Some(429) => FallbackDecision {
            should_fallback: true,
            cooldown: backoff(RATE_LIMIT_BASE, backoff_level, RATE_LIMIT_CAP),
            new_backoff_level: backoff_level + 1,
        },
        Some(status) if (500..600).contains(&status) => FallbackDecision {
            should_fallback: true,
            cooldown: backoff(SERVER_ERROR_BASE, backoff_level, SERVER_ERROR_CAP),
            new_backoff_level: backoff_level + 1,
        },
        // 401/403 reach this table only after one in-place refresh attempt.
        Some(401) | Some(403) => FallbackDecision {
            should_fallback: true,
            cooldown: AUTH_COOLDOWN,
            new_backoff_level: backoff_level + 1,
        },
        Some(_) => FallbackDecision::pass_through(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_schedule_doubles_and_caps() {
        assert_eq!(
            check_fallback_error(Some(429), None, 0).cooldown,
            Duration::from_secs(60)
        );
        assert_eq!(
            check_fallback_error(Some(429), None, 3).cooldown,
            Duration::from_secs(480)
        );
        assert_eq!(
            check_fallback_error(Some(429), None, 12).cooldown,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn server_errors_cap_at_ten_minutes() {
        assert_eq!(
            check_fallback_error(Some(503), None, 0).cooldown,
            Duration::from_secs(30)
        );
        assert_eq!(
            check_fallback_error(Some(500), None, 8).cooldown,
            Duration::from_secs(600)
        );
    }

    #[test]
    fn auth_failures_cool_five_minutes() {
        let decision = check_fallback_error(Some(401), None, 2);
        assert!(decision.should_fallback);
        assert_eq!(decision.cooldown, Duration::from_secs(300));
    }

    #[test]
    fn other_4xx_passes_through() {
        let decision = check_fallback_error(Some(400), None, 0);
        assert!(!decision.should_fallback);
        let decision = check_fallback_error(Some(404), None, 5);
        assert!(!decision.should_fallback);
    }

    #[test]
    fn network_errors_back_off_from_fifteen_seconds() {
        assert_eq!(
            check_fallback_error(None, None, 0).cooldown,
            Duration::from_secs(15)
        );
        assert_eq!(
            check_fallback_error(None, None, 2).cooldown,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn parsed_retry_hint_is_used_verbatim() {
        let decision = check_fallback_error(Some(429), Some(7_643_000), 4);
        assert_eq!(decision.cooldown, Duration::from_millis(7_643_000));
        assert_eq!(decision.new_backoff_level, 5);
    }

    #[test]
    fn backoff_levels_increment() {
        let decision = check_fallback_error(Some(429), None, 4);
        assert_eq!(decision.new_backoff_level, 5);
    }
}
