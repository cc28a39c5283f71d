//! Rate-limit backoff controller.
//!
//! Tracks rate-limit hits reported by the launch path and computes an
//! escalating pause. `is_limited` is the single gate consulted before new
//! work is dispatched. State is in-memory only and fails open on restart.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::models::BackoffConfig;
use crate::domain::ports::Notifier;

/// Escalation counter value at which operators are notified.
const NOTIFY_AT_ESCALATION: u32 = 3;

/// Tunables for the backoff curve.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub window: Duration,
    /// Hits inside `window` (including the current one) needed to escalate
    pub escalation_threshold: usize,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            max: Duration::from_millis(config.max_ms),
            window: Duration::from_secs(config.window_secs),
            escalation_threshold: config.escalation_threshold,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(counter - 1), max)`
    pub fn duration_for(&self, counter: u32) -> Duration {
        let exponent = counter.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Default)]
struct BackoffState {
    backoff_until: Option<DateTime<Utc>>,
    current: Option<Duration>,
    history: VecDeque<DateTime<Utc>>,
    escalation: u32,
}

/// What one recorded hit decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitOutcome {
    pub duration: Duration,
    pub escalation: u32,
    pub backoff_until: DateTime<Utc>,
    /// This hit crossed the notification threshold
    pub severe: bool,
}

/// Snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BackoffStatus {
    pub is_limited: bool,
    pub backoff_until: Option<DateTime<Utc>>,
    pub current_backoff_secs: Option<u64>,
    pub remaining_secs: u64,
    pub recent_hits: usize,
    pub escalation: u32,
}

pub struct RateLimitBackoff {
    policy: BackoffPolicy,
    state: Mutex<BackoffState>,
    notifier: Option<Arc<dyn Notifier>>,
    channel: String,
}

impl RateLimitBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(BackoffState::default()),
            notifier: None,
            channel: String::new(),
        }
    }

    /// Send severe-escalation messages to `channel` through `notifier`.
    pub fn with_notifier(
        mut self,
        notifier: Arc<dyn Notifier>,
        channel: impl Into<String>,
    ) -> Self {
        self.notifier = Some(notifier);
        self.channel = channel.into();
        self
    }

    /// Record a rate-limit hit now. `explicit` overrides the computed pause.
    pub async fn record_limit_hit(&self, explicit: Option<Duration>) -> HitOutcome {
        let outcome = self.record_limit_hit_at(Utc::now(), explicit);

        if outcome.severe {
            if let Some(notifier) = &self.notifier {
                let message = format!(
                    "Rate limiting escalated to level {}; dispatch paused for {}s",
                    outcome.escalation,
                    outcome.duration.as_secs()
                );
                if let Err(e) = notifier.notify(&self.channel, &message).await {
                    warn!(error = %e, "Failed to send rate-limit notification");
                }
            }
        }

        outcome
    }

    /// Clock-injected form of [`record_limit_hit`](Self::record_limit_hit).
    /// Does not notify.
    pub fn record_limit_hit_at(
        &self,
        now: DateTime<Utc>,
        explicit: Option<Duration>,
    ) -> HitOutcome {
        let mut state = self.state.lock();

        let window_start = now - to_chrono(self.policy.window);
        while state.history.front().is_some_and(|t| *t < window_start) {
            state.history.pop_front();
        }
        state.history.push_back(now);

        // Never below 1 while a hit is being recorded.
        state.escalation = if state.history.len() >= self.policy.escalation_threshold {
            state.escalation.saturating_add(1).max(1)
        } else {
            1
        };

        let duration = explicit.unwrap_or_else(|| self.policy.duration_for(state.escalation));
        let until = now + to_chrono(duration);
        let backoff_until = state.backoff_until.map_or(until, |existing| existing.max(until));
        state.backoff_until = Some(backoff_until);
        state.current = Some(duration);

        let outcome = HitOutcome {
            duration,
            escalation: state.escalation,
            backoff_until,
            severe: state.escalation >= NOTIFY_AT_ESCALATION,
        };
        drop(state);

        warn!(
            escalation = outcome.escalation,
            backoff_secs = duration.as_secs(),
            until = %backoff_until,
            "Rate limit hit recorded"
        );
        outcome
    }

    pub fn is_limited(&self) -> bool {
        self.is_limited_at(Utc::now())
    }

    /// True while `now` is before the backoff deadline. The first call that
    /// observes expiry clears the deadline; the escalation counter and the
    /// hit history survive until [`reset`](Self::reset).
    pub fn is_limited_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        match state.backoff_until {
            Some(until) if now < until => true,
            Some(_) => {
                state.backoff_until = None;
                state.current = None;
                info!(escalation = state.escalation, "Rate limit backoff expired");
                false
            }
            None => false,
        }
    }

    /// Lift the current pause immediately. History and counter are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.backoff_until = None;
        state.current = None;
    }

    /// Zero every field.
    pub fn reset(&self) {
        *self.state.lock() = BackoffState::default();
    }

    pub fn status(&self) -> BackoffStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> BackoffStatus {
        let state = self.state.lock();
        let remaining = state
            .backoff_until
            .and_then(|until| (until - now).to_std().ok())
            .unwrap_or_default();
        BackoffStatus {
            is_limited: state.backoff_until.is_some_and(|until| now < until),
            backoff_until: state.backoff_until,
            current_backoff_secs: state.current.map(|d| d.as_secs()),
            remaining_secs: remaining.as_secs(),
            recent_hits: state.history.len(),
            escalation: state.escalation,
        }
    }
}

/// Saturates at a year for values chrono cannot hold.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52))
}
