use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window limiter: at most `max_calls` calls inside any trailing `period`.
///
/// Each granted call records its instant. A caller that finds the window full sleeps until the
/// oldest call falls out of it, then re-checks. Calls are granted one at a time, so none is
/// dropped or granted twice.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            period,
            calls: Mutex::new(VecDeque::with_capacity(max_calls.min(1024))),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX, Duration::ZERO)
    }

    /// 等到配額可用後登記一次呼叫
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = calls.front() {
                if now.duration_since(oldest) >= self.period {
                    calls.pop_front();
                } else {
                    break;
                }
            }

            if calls.len() < self.max_calls {
                calls.push_back(now);
                return;
            }

            // 持有鎖一起等待，後到的呼叫自然排隊
            if let Some(&oldest) = calls.front() {
                let resume_at = oldest + self.period;
                tracing::debug!(
                    "Rate limit of {} calls per {:?} reached, waiting {:?}",
                    self.max_calls,
                    self.period,
                    resume_at.saturating_duration_since(now)
                );
                tokio::time::sleep_until(resume_at).await;
            }
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}
