//! Deadline scheduling for the sampling period.
//!
//! The check is post-hoc: a tick is never interrupted. Once sampling and
//! actuation are done the scheduler compares the time spent against the period
//! and either sleeps the remainder or records the tick as an overrun.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// What the scheduler did at the end of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Finished inside the period; slept for `pause`.
    OnTime {
        /// Time slept to fill the period.
        pause: Duration,
    },
    /// Took the whole period or longer.
    Overrun {
        /// Time the tick actually took.
        elapsed: Duration,
    },
}

impl TickOutcome {
    /// Decide the outcome for a tick that took `elapsed` of `period`.
    pub fn plan(period: Duration, elapsed: Duration) -> Self {
        match period.checked_sub(elapsed) {
            Some(pause) if !pause.is_zero() => TickOutcome::OnTime { pause },
            _ => TickOutcome::Overrun { elapsed },
        }
    }

    /// True for [`TickOutcome::Overrun`].
    pub fn is_overrun(&self) -> bool {
        matches!(self, TickOutcome::Overrun { .. })
    }
}

/// Timing record of one closed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Position of the tick in the run.
    pub index: usize,
    /// When sampling for this tick began.
    pub started_at: Instant,
    /// Whether the scheduler paused or flagged an overrun.
    pub outcome: TickOutcome,
}

impl Tick {
    /// Close tick `index` against `period`, measuring from `started_at` to now.
    pub fn close(index: usize, started_at: Instant, period: Duration) -> Self {
        Self {
            index,
            started_at,
            outcome: TickOutcome::plan(period, started_at.elapsed()),
        }
    }

    /// True if sampling and actuation took the whole period or longer.
    pub fn overran(&self) -> bool {
        self.outcome.is_overrun()
    }
}

/// Enforces the sampling period tick by tick.
#[derive(Debug, Clone)]
pub struct DeadlineScheduler {
    period: Duration,
    overruns: Vec<usize>,
}

impl DeadlineScheduler {
    /// Scheduler for the given sampling period.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            overruns: Vec::new(),
        }
    }

    /// Sampling period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Close tick `index`, which started at `tick_start`.
    pub async fn finish_tick(&mut self, index: usize, tick_start: Instant) -> Tick {
        let tick = Tick::close(index, tick_start, self.period);
        match tick.outcome {
            TickOutcome::OnTime { pause } => {
                debug!(
                    tick = index,
                    elapsed_ms = (self.period - pause).as_millis() as u64,
                    pause_ms = pause.as_millis() as u64,
                    "Pausing until next tick"
                );
                sleep(pause).await;
            }
            TickOutcome::Overrun { elapsed } => {
                warn!(
                    tick = index,
                    elapsed_ms = elapsed.as_millis() as u64,
                    period_ms = self.period.as_millis() as u64,
                    "Tick overran the sampling period, data may be inaccurate"
                );
                self.overruns.push(index);
            }
        }
        tick
    }

    /// Indices of overrun ticks so far, in order.
    pub fn overruns(&self) -> &[usize] {
        &self.overruns
    }

    /// Consume the scheduler, returning the overrun indices.
    pub fn into_overruns(self) -> Vec<usize> {
        self.overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_sleeps_the_remainder() {
        let outcome = TickOutcome::plan(Duration::from_secs(1), Duration::from_millis(300));
        assert_eq!(
            outcome,
            TickOutcome::OnTime {
                pause: Duration::from_millis(700)
            }
        );
    }

    #[test]
    fn exactly_one_period_is_an_overrun() {
        assert!(TickOutcome::plan(Duration::from_secs(1), Duration::from_secs(1)).is_overrun());
        assert!(TickOutcome::plan(Duration::from_secs(1), Duration::from_millis(1500)).is_overrun());
    }

    #[tokio::test(start_paused = true)]
    async fn on_time_tick_fills_the_period() {
        let mut scheduler = DeadlineScheduler::new(Duration::from_secs(1));
        let start = Instant::now();
        sleep(Duration::from_millis(300)).await;

        let tick = scheduler.finish_tick(0, start).await;
        assert!(!tick.overran());
        assert_eq!(tick.index, 0);
        assert_eq!(tick.started_at, start);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1010));
        assert!(scheduler.overruns().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_is_recorded_once_and_does_not_sleep() {
        let mut scheduler = DeadlineScheduler::new(Duration::from_millis(500));
        let start = Instant::now();
        sleep(Duration::from_millis(800)).await;

        let tick = scheduler.finish_tick(7, start).await;
        assert!(tick.overran());
        assert!(matches!(
            tick.outcome,
            TickOutcome::Overrun { elapsed } if elapsed >= Duration::from_millis(800)
        ));
        assert!(start.elapsed() < Duration::from_millis(810));
        assert_eq!(scheduler.into_overruns(), vec![7]);
    }
}
