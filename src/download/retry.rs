use crate::config::DownloadConfig;
use std::time::Duration;

/// Classification of one finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Transient,
    Permanent,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Complete,
    Retry(Duration),
    Fail,
}

/// Retry ceiling and exponential backoff with a cap. No timers, no I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &DownloadConfig) -> Self {
        Self {
            max_retries: cfg.retry_count,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `attempts_used` counts the attempt that produced `outcome`.
    pub fn next_action(&self, outcome: Outcome, attempts_used: u32) -> NextAction {
        match outcome {
            Outcome::Success => NextAction::Complete,
            Outcome::Permanent => NextAction::Fail,
            Outcome::Transient if attempts_used >= self.max_attempts() => NextAction::Fail,
            Outcome::Transient => NextAction::Retry(self.backoff(attempts_used)),
        }
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 5xx and 429 are worth another attempt; every other non-2xx is final.
pub fn is_transient_status(code: u16) -> bool {
    code == 429 || (500..600).contains(&code)
}
