use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    protocol::DeviceEvent,
    types::{Cycle, CycleStat, DeviceState, RunSummary},
};

/// Where the current run stands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunPhase {
    /// Nothing running
    #[default]
    Idle,
    /// Device reports an active state
    Running,
    /// Device completed every cycle; the summary is final
    Ended,
    /// Operator stopped the run
    Stopped,
    /// Device gave up (ADC error or current not reachable)
    Aborted,
}

impl RunPhase {
    /// Phase the device state moves the run into
    #[must_use]
    pub const fn from_state(state: DeviceState) -> Self {
        match state {
            DeviceState::InTest | DeviceState::InMain => Self::Running,
            DeviceState::CyclesEnded => Self::Ended,
            DeviceState::CyclesStopped => Self::Stopped,
            DeviceState::CantSetCurrent | DeviceState::CyclesAbortedAdcError => Self::Aborted,
            DeviceState::NoVoltageOffset | DeviceState::MakeSchema => Self::Idle,
        }
    }
}

/// Turns cycle, current and state notifications into per-cycle statistics
///
/// A cycle is closed when the next one is announced: its peak current and
/// the time since its announcement become a [`CycleStat`]. A cycle numbered 1
/// starts a sequence and never closes anything. Once the device reports
/// [`DeviceState::CyclesEnded`] the summary is frozen until [`reset`](Self::reset).
///
/// The aggregator is plain data; it must be driven from one task.
#[derive(Debug, Default)]
pub struct CycleAggregator {
    current_cycle: Option<Cycle>,
    cycle_started: Option<Instant>,
    peak_current: f32,
    results: Vec<CycleStat>,
    phase: RunPhase,
    summary: Option<RunSummary>,
}

impl CycleAggregator {
    /// Empty aggregator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything from the previous run
    pub fn reset(&mut self) {
        debug!("Clearing run statistics");
        *self = Self::default();
    }

    /// Feed one decoded notification
    ///
    /// Returns the summary when this event finalized the run.
    pub fn apply(&mut self, event: DeviceEvent, now: Instant) -> Option<RunSummary> {
        match event {
            DeviceEvent::Cycle(cycle) => {
                self.on_cycle(cycle, now);
                None
            }
            DeviceEvent::Current(current) => {
                self.on_current(current);
                None
            }
            DeviceEvent::State(state) => self.on_state(state),
        }
    }

    /// A new cycle was announced
    pub fn on_cycle(&mut self, cycle: Cycle, now: Instant) {
        if self.phase == RunPhase::Ended {
            debug!("Ignoring cycle {} after the run ended", cycle.num);
            return;
        }

        if cycle.num > 1 {
            if let Some(previous) = self.current_cycle {
                let duration_ms = self.cycle_started.map_or(0, |started| {
                    u64::try_from(now.saturating_duration_since(started).as_millis())
                        .unwrap_or(u64::MAX)
                });
                debug!(
                    "Cycle {} closed: peak {}A over {duration_ms}ms",
                    previous.num, self.peak_current
                );
                self.results.push(CycleStat {
                    cycle: previous,
                    peak_current: self.peak_current,
                    duration_ms,
                });
            }
        }

        self.peak_current = 0.0;
        self.cycle_started = Some(now);
        self.current_cycle = Some(cycle);
    }

    /// A current measurement arrived
    pub fn on_current(&mut self, current: f32) {
        if self.phase == RunPhase::Ended {
            return;
        }
        self.peak_current = self.peak_current.max(current);
    }

    /// The device state changed
    ///
    /// Returns the summary the first time the run ends.
    pub fn on_state(&mut self, state: DeviceState) -> Option<RunSummary> {
        if self.phase == RunPhase::Ended {
            return None;
        }

        self.phase = RunPhase::from_state(state);
        if self.phase != RunPhase::Ended {
            return None;
        }

        let summary = RunSummary::from_results(self.results.clone());
        info!(
            "Run finished: {} cycles, {}ms total",
            summary.results.len(),
            summary.total_duration_ms
        );
        self.summary = Some(summary.clone());
        Some(summary)
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Cycle currently open
    #[must_use]
    pub const fn current_cycle(&self) -> Option<Cycle> {
        self.current_cycle
    }

    /// Highest current seen in the open cycle
    #[must_use]
    pub const fn peak_current(&self) -> f32 {
        self.peak_current
    }

    /// Closed cycles so far
    #[must_use]
    pub fn results(&self) -> &[CycleStat] {
        &self.results
    }

    /// Finalized summary, once the run ended
    #[must_use]
    pub const fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cycle(num: u32) -> Cycle {
        Cycle {
            num,
            target_current: 10.0 / f32::from(u16::try_from(num).unwrap()),
            polarity: num % 2 == 0,
        }
    }

    #[test]
    fn test_first_cycle_closes_on_second() {
        let t0 = Instant::now();
        let mut aggregator = CycleAggregator::new();

        aggregator.on_cycle(cycle(1), t0);
        aggregator.on_current(2.0);
        aggregator.on_current(5.0);
        aggregator.on_cycle(cycle(2), t0 + Duration::from_millis(1_500));
        aggregator.on_current(1.0);
        let summary = aggregator.on_state(DeviceState::CyclesEnded).unwrap();

        assert_eq!(summary.results.len(), 1);
        let stat = summary.results[0];
        assert_eq!(stat.cycle, cycle(1));
        assert!((stat.peak_current - 5.0).abs() < f32::EPSILON);
        assert_eq!(stat.duration_ms, 1_500);
        assert_eq!(summary.total_duration_ms, 1_500);
        assert_eq!(aggregator.phase(), RunPhase::Ended);
    }

    #[test]
    fn test_peak_is_max_not_latest() {
        let t0 = Instant::now();
        let mut aggregator = CycleAggregator::new();

        aggregator.on_cycle(cycle(1), t0);
        for current in [1.0, 7.5, 3.0, -9.0] {
            aggregator.on_current(current);
        }
        assert!((aggregator.peak_current() - 7.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_cycle_one_restarts_without_closing() {
        let t0 = Instant::now();
        let mut aggregator = CycleAggregator::new();

        aggregator.on_cycle(cycle(1), t0);
        aggregator.on_current(4.0);
        aggregator.on_cycle(cycle(1), t0 + Duration::from_millis(100));

        assert!(aggregator.results().is_empty());
        assert!(aggregator.peak_current().abs() < f32::EPSILON);
        assert_eq!(aggregator.current_cycle(), Some(cycle(1)));
    }

    #[test]
    fn test_summary_sums_durations() {
        let t0 = Instant::now();
        let mut aggregator = CycleAggregator::new();

        for (num, at) in [(1, 0), (2, 1_000), (3, 3_000), (4, 3_250)] {
            aggregator.apply(DeviceEvent::Cycle(cycle(num)), t0 + Duration::from_millis(at));
            aggregator.apply(DeviceEvent::Current(f32::from(u8::try_from(num).unwrap())), t0);
        }
        let summary = aggregator
            .apply(DeviceEvent::State(DeviceState::CyclesEnded), t0)
            .unwrap();

        let durations: Vec<u64> = summary.results.iter().map(|s| s.duration_ms).collect();
        assert_eq!(durations, vec![1_000, 2_000, 250]);
        assert_eq!(summary.total_duration_ms, 3_250);
    }

    #[test]
    fn test_ended_summary_is_frozen() {
        let t0 = Instant::now();
        let mut aggregator = CycleAggregator::new();

        aggregator.on_cycle(cycle(1), t0);
        aggregator.on_cycle(cycle(2), t0 + Duration::from_millis(10));
        let summary = aggregator.on_state(DeviceState::CyclesEnded).unwrap();

        aggregator.on_cycle(cycle(3), t0 + Duration::from_millis(20));
        aggregator.on_current(99.0);
        assert!(aggregator.on_state(DeviceState::CyclesEnded).is_none());
        assert!(aggregator.on_state(DeviceState::InMain).is_none());

        assert_eq!(aggregator.summary(), Some(&summary));
        assert_eq!(aggregator.results().len(), 1);
        assert_eq!(aggregator.phase(), RunPhase::Ended);
    }

    #[test]
    fn test_reset_clears_previous_run() {
        let t0 = Instant::now();
        let mut aggregator = CycleAggregator::new();

        aggregator.on_cycle(cycle(1), t0);
        aggregator.on_current(3.0);
        aggregator.on_cycle(cycle(2), t0 + Duration::from_millis(10));
        aggregator.on_state(DeviceState::CyclesEnded);

        aggregator.reset();
        assert_eq!(aggregator.phase(), RunPhase::Idle);
        assert!(aggregator.results().is_empty());
        assert!(aggregator.summary().is_none());
        assert!(aggregator.current_cycle().is_none());

        // a second run ends with its own results only
        aggregator.on_cycle(cycle(1), t0);
        aggregator.on_cycle(cycle(2), t0 + Duration::from_millis(40));
        let summary = aggregator.on_state(DeviceState::CyclesEnded).unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.total_duration_ms, 40);
    }

    #[test]
    fn test_phase_follows_state() {
        let mut aggregator = CycleAggregator::new();

        aggregator.on_state(DeviceState::InTest);
        assert_eq!(aggregator.phase(), RunPhase::Running);
        aggregator.on_state(DeviceState::CyclesStopped);
        assert_eq!(aggregator.phase(), RunPhase::Stopped);
        aggregator.on_state(DeviceState::CyclesAbortedAdcError);
        assert_eq!(aggregator.phase(), RunPhase::Aborted);
        aggregator.on_state(DeviceState::MakeSchema);
        assert_eq!(aggregator.phase(), RunPhase::Idle);
        assert!(aggregator.summary().is_none());
    }
}
