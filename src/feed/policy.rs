//! Retry and restart policy

use crate::config::SupervisorSettings;
use crate::grant::GrantError;
use std::time::Duration;

/// What to do after a transcoder exits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Refetch the grant and respawn after the short backoff
    Restart,
    /// Leave the feed idle until an operator acts
    Stall,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub short_backoff: Duration,
    pub rate_limit_backoff: Duration,
    pub max_restarts: u32,
    pub intentional_exit_codes: Vec<i32>,
    pub crash_reset_after: Duration,
}

impl From<&SupervisorSettings> for RetryPolicy {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            short_backoff: settings.short_backoff,
            rate_limit_backoff: settings.rate_limit_backoff,
            max_restarts: settings.max_restarts,
            intentional_exit_codes: settings.intentional_exit_codes.clone(),
            crash_reset_after: settings.crash_reset_after,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next grant attempt
    pub fn grant_backoff(&self, error: &GrantError) -> Duration {
        if error.is_rate_limited() {
            self.rate_limit_backoff
        } else {
            self.short_backoff
        }
    }

    /// Decide on an unrequested exit. `None` (killed by a signal) counts as a crash.
    pub fn on_exit(&self, code: Option<i32>, retry_count: u32) -> ExitAction {
        match code {
            Some(code) if self.intentional_exit_codes.contains(&code) => ExitAction::Stall,
            _ if retry_count < self.max_restarts => ExitAction::Restart,
            _ => ExitAction::Stall,
        }
    }

    /// Whether a process that ran for `uptime` earns a fresh crash budget
    pub fn resets_crash_count(&self, uptime: Duration) -> bool {
        !self.crash_reset_after.is_zero() && uptime >= self.crash_reset_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            short_backoff: Duration::from_secs(5),
            rate_limit_backoff: Duration::from_secs(60),
            max_restarts: 3,
            intentional_exit_codes: vec![255],
            crash_reset_after: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_rate_limit_backoff_is_longer() {
        let policy = policy();
        let limited = policy.grant_backoff(&GrantError::RateLimited("quota".into()));
        let generic = policy.grant_backoff(&GrantError::Request("boom".into()));
        assert_eq!(limited, Duration::from_secs(60));
        assert_eq!(generic, Duration::from_secs(5));
        assert!(limited > generic);
    }

    #[test]
    fn test_intentional_exit_stalls() {
        assert_eq!(policy().on_exit(Some(255), 0), ExitAction::Stall);
    }

    #[test]
    fn test_crash_restarts_until_ceiling() {
        let policy = policy();
        assert_eq!(policy.on_exit(Some(1), 0), ExitAction::Restart);
        assert_eq!(policy.on_exit(None, 2), ExitAction::Restart);
        assert_eq!(policy.on_exit(Some(1), 3), ExitAction::Stall);
    }

    #[test]
    fn test_crash_reset_window() {
        let policy = policy();
        assert!(!policy.resets_crash_count(Duration::from_secs(10)));
        assert!(policy.resets_crash_count(Duration::from_secs(300)));
    }
}
