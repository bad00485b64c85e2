use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Pluggable "current time" provider.
///
/// Read on every call to `OrchestrationContext::current_time` and when computing the delay of an
/// absolute timer, so a test clock can advance between calls.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

impl Clock {
    pub fn new(f: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Wall-clock time.
    pub fn system() -> Self {
        Self::new(Utc::now)
    }

    /// A clock frozen at `at`.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self::new(move || at)
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}

/// A single timer suspension: either an absolute fire time or a relative delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    FireAt(DateTime<Utc>),
    After(Duration),
}

impl TimerRequest {
    /// How long the timer actually sleeps.
    ///
    /// A configured override wins regardless of the requested time. Fire times in the past
    /// resolve immediately.
    pub fn effective_delay(&self, timer_override: Option<Duration>, clock: &Clock) -> Duration {
        if let Some(fixed) = timer_override {
            return fixed;
        }
        match self {
            TimerRequest::After(delay) => *delay,
            TimerRequest::FireAt(fire_at) => (*fire_at - clock.now()).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::canceled("timer"));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::canceled("timer")),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn override_collapses_any_fire_time() {
        let clock = Clock::fixed(at(0));
        let far = TimerRequest::FireAt(at(24 * 3600));
        assert_eq!(
            far.effective_delay(Some(Duration::from_millis(10)), &clock),
            Duration::from_millis(10)
        );
        assert_eq!(far.effective_delay(None, &clock), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn past_fire_times_do_not_sleep() {
        let clock = Clock::fixed(at(100));
        assert_eq!(TimerRequest::FireAt(at(50)).effective_delay(None, &clock), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_beats_a_long_sleep() {
        let token = CancellationToken::new();
        let child = token.clone();
        let sleeper = tokio::spawn(async move { sleep_or_cancel(Duration::from_secs(3600), &child).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        let res = sleeper.await.unwrap();
        assert!(matches!(res, Err(Error::Canceled { .. })));
    }
}
