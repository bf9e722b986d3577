use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out")]
pub struct TimedOut;

pub struct Timer {
    duration: Duration,
    deadline: Instant,
    alarm: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        let deadline = Instant::now() + duration;
        Self {
            duration,
            deadline,
            alarm: Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_elapsed(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn clear(&mut self) {
        self.alarm = None;
    }

    pub fn is_cleared(&self) -> bool {
        self.alarm.is_none()
    }

    pub async fn expired(&mut self) {
        match self.alarm.as_mut() {
            Some(alarm) => alarm.as_mut().await,
            None => std::future::pending::<()>().await,
        }
    }
}

/// Races `operation` against `duration`.
///
/// On timeout the operation is dropped, so a settlement that would have
/// arrived later has no observable effect.
pub async fn with_timeout<F>(operation: F, duration: Duration) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    tokio::time::timeout(duration, operation)
        .await
        .map_err(|_| TimedOut)
}

pub async fn with_timer<F>(operation: F, timer: &mut Timer) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    tokio::select! {
        biased;
        output = operation => Ok(output),
        _ = timer.expired() => Err(TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remaining_counts_down_and_clamps_at_zero() {
        let timer = Timer::new(Duration::from_millis(30));
        assert!(timer.remaining() <= Duration::from_millis(30));
        assert!(!timer.is_elapsed());

        tokio::time::sleep(Duration::from_millis(45)).await;
        assert_eq!(timer.remaining(), Duration::ZERO);
        assert!(timer.is_elapsed());
    }

    #[tokio::test]
    async fn with_timeout_returns_completed_value() {
        let result = with_timeout(async { 7 }, Duration::from_millis(100)).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn with_timeout_reports_sentinel_when_deadline_wins() {
        let result = with_timeout(
            tokio::time::sleep(Duration::from_millis(200)),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(result, Err(TimedOut));
    }

    #[tokio::test]
    async fn with_timeout_keeps_operation_errors_distinct_from_timeouts() {
        let result = with_timeout(
            async { Err::<(), _>("worker said no") },
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(result, Ok(Err("worker said no")));
    }

    #[tokio::test]
    async fn with_timer_uses_remaining_budget() {
        let mut timer = Timer::new(Duration::from_millis(20));
        let result = with_timer(tokio::time::sleep(Duration::from_millis(200)), &mut timer).await;
        assert_eq!(result, Err(TimedOut));
    }

    #[tokio::test]
    async fn cleared_timer_never_fires() {
        let mut timer = Timer::new(Duration::from_millis(5));
        timer.clear();
        timer.clear();
        assert!(timer.is_cleared());

        let result = with_timer(
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                "done"
            },
            &mut timer,
        )
        .await;
        assert_eq!(result, Ok("done"));
    }
}
