use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TimerDefaults;
use crate::error::RoomError;

/// Longest accepted phase, in minutes. Keeps `minutes * 60` well inside `u32`.
pub const MAX_PHASE_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Work,
    Break,
}

impl Phase {
    pub fn flipped(self) -> Phase {
        match self {
            Phase::Work => Phase::Break,
            Phase::Break => Phase::Work,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Work => "Work",
            Phase::Break => "Break",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Durations {
    pub work_duration: u32,
    pub break_duration: u32,
}

/// Authoritative countdown state. Every broadcast carries the whole struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub phase: Phase,
    pub remaining_seconds: u32,
    pub work_duration: u32,
    pub break_duration: u32,
    pub running: bool,
    /// Durations requested while running; applied at the next phase switch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_durations: Option<Durations>,
}

impl TimerState {
    pub fn new(work_duration: u32, break_duration: u32) -> Self {
        TimerState {
            phase: Phase::Work,
            remaining_seconds: work_duration * 60,
            work_duration,
            break_duration,
            running: false,
            pending_durations: None,
        }
    }

    /// Minutes configured for `phase`.
    pub fn duration_of(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Work => self.work_duration,
            Phase::Break => self.break_duration,
        }
    }

    pub fn phase_seconds(&self) -> u32 {
        self.duration_of(self.phase) * 60
    }

    fn durations(&self) -> Durations {
        Durations {
            work_duration: self.work_duration,
            break_duration: self.break_duration,
        }
    }

    fn set_durations(&mut self, durations: Durations) {
        self.work_duration = durations.work_duration;
        self.break_duration = durations.break_duration;
    }

    fn apply_pending(&mut self) {
        if let Some(durations) = self.pending_durations.take() {
            self.set_durations(durations);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    Start,
    Pause,
    Reset,
    DurationChange {
        work_duration: Option<u32>,
        break_duration: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    Fresh,
    Resume,
}

/// What a control command did, used for the human-facing status line and to
/// decide whether the room keeps a tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerNotice {
    Started(StartKind),
    AlreadyRunning,
    Paused,
    AlreadyPaused,
    Reset,
    DurationsChanged { deferred: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The timer was not running; nothing changed.
    Idle,
    Counting,
    PhaseComplete { finished: Phase, next: Phase },
}

#[derive(Debug, Clone)]
pub struct TimerStateMachine {
    state: TimerState,
    auto_continue: bool,
}

impl TimerStateMachine {
    pub fn new(defaults: &TimerDefaults) -> Self {
        TimerStateMachine {
            state: TimerState::new(defaults.work_minutes, defaults.break_minutes),
            auto_continue: defaults.auto_continue,
        }
    }

    pub fn state(&self) -> &TimerState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    pub fn apply(&mut self, command: TimerCommand) -> Result<TimerNotice, RoomError> {
        let notice = match command {
            TimerCommand::Start => self.start(),
            TimerCommand::Pause => self.pause(),
            TimerCommand::Reset => self.reset(),
            TimerCommand::DurationChange {
                work_duration,
                break_duration,
            } => self.change_durations(work_duration, break_duration)?,
        };
        Ok(notice)
    }

    /// One second of countdown. Reaching zero switches phase in the same step.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.state.running {
            return TickOutcome::Idle;
        }

        self.state.remaining_seconds = self.state.remaining_seconds.saturating_sub(1);
        if self.state.remaining_seconds > 0 {
            return TickOutcome::Counting;
        }

        let finished = self.state.phase;
        self.state.phase = finished.flipped();
        self.state.apply_pending();
        self.state.remaining_seconds = self.state.phase_seconds();
        self.state.running = self.auto_continue;

        TickOutcome::PhaseComplete {
            finished,
            next: self.state.phase,
        }
    }

    fn start(&mut self) -> TimerNotice {
        if self.state.running {
            return TimerNotice::AlreadyRunning;
        }

        if self.state.remaining_seconds == 0 {
            self.state.remaining_seconds = self.state.phase_seconds();
        }

        let kind = if self.state.remaining_seconds == self.state.phase_seconds() {
            StartKind::Fresh
        } else {
            StartKind::Resume
        };

        self.state.running = true;
        TimerNotice::Started(kind)
    }

    fn pause(&mut self) -> TimerNotice {
        if !self.state.running {
            return TimerNotice::AlreadyPaused;
        }
        self.state.running = false;
        TimerNotice::Paused
    }

    fn reset(&mut self) -> TimerNotice {
        self.state.running = false;
        self.state.apply_pending();
        self.state.remaining_seconds = self.state.phase_seconds();
        TimerNotice::Reset
    }

    fn change_durations(
        &mut self,
        work_duration: Option<u32>,
        break_duration: Option<u32>,
    ) -> Result<TimerNotice, RoomError> {
        if work_duration.is_none() && break_duration.is_none() {
            return Err(RoomError::invalid("duration_change needs a work or break duration"));
        }

        for minutes in [work_duration, break_duration].into_iter().flatten() {
            if minutes == 0 || minutes > MAX_PHASE_MINUTES {
                return Err(RoomError::invalid(format!(
                    "durations must be between 1 and {MAX_PHASE_MINUTES} minutes"
                )));
            }
        }

        let base = self
            .state
            .pending_durations
            .unwrap_or_else(|| self.state.durations());
        let requested = Durations {
            work_duration: work_duration.unwrap_or(base.work_duration),
            break_duration: break_duration.unwrap_or(base.break_duration),
        };

        if self.state.running {
            self.state.pending_durations = Some(requested);
            return Ok(TimerNotice::DurationsChanged { deferred: true });
        }

        self.state.pending_durations = None;
        self.state.set_durations(requested);
        self.state.remaining_seconds = self.state.phase_seconds();
        Ok(TimerNotice::DurationsChanged { deferred: false })
    }
}

/// Client-side copy of the room timer.
///
/// Every update overwrites the mirror; interpolation between updates is only
/// ever derived from the last authoritative value and never written back.
#[derive(Debug, Default, Clone)]
pub struct TimerMirror {
    authoritative: Option<TimerState>,
}

impl TimerMirror {
    pub fn new() -> Self {
        TimerMirror::default()
    }

    pub fn apply(&mut self, update: &TimerState) {
        self.authoritative = Some(update.clone());
    }

    pub fn state(&self) -> Option<&TimerState> {
        self.authoritative.as_ref()
    }

    /// Seconds to display `since_update` after the last broadcast arrived.
    pub fn display_remaining(&self, since_update: Duration) -> Option<u32> {
        let state = self.authoritative.as_ref()?;
        if !state.running {
            return Some(state.remaining_seconds);
        }

        let elapsed = u32::try_from(since_update.as_secs()).unwrap_or(u32::MAX);
        Some(state.remaining_seconds.saturating_sub(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> TimerStateMachine {
        TimerStateMachine::new(&TimerDefaults::default())
    }

    fn duration_change(work: Option<u32>, brk: Option<u32>) -> TimerCommand {
        TimerCommand::DurationChange {
            work_duration: work,
            break_duration: brk,
        }
    }

    #[test]
    fn fresh_start_then_resume() {
        let mut timer = machine();
        assert_eq!(timer.apply(TimerCommand::Start), Ok(TimerNotice::Started(StartKind::Fresh)));
        timer.tick();
        assert_eq!(timer.apply(TimerCommand::Pause), Ok(TimerNotice::Paused));
        assert_eq!(timer.state().remaining_seconds, 1499);
        assert_eq!(timer.apply(TimerCommand::Start), Ok(TimerNotice::Started(StartKind::Resume)));
        assert_eq!(timer.apply(TimerCommand::Start), Ok(TimerNotice::AlreadyRunning));
    }

    #[test]
    fn pause_freezes_countdown() {
        let mut timer = machine();
        timer.apply(TimerCommand::Start).unwrap();
        timer.tick();
        timer.tick();
        timer.apply(TimerCommand::Pause).unwrap();

        assert_eq!(timer.tick(), TickOutcome::Idle);
        assert_eq!(timer.state().remaining_seconds, 1498);
        assert_eq!(timer.apply(TimerCommand::Pause), Ok(TimerNotice::AlreadyPaused));
    }

    #[test]
    fn full_work_phase_auto_continues_into_break() {
        let mut timer = machine();
        timer.apply(TimerCommand::Start).unwrap();

        for _ in 0..1499 {
            assert_eq!(timer.tick(), TickOutcome::Counting);
        }
        assert_eq!(
            timer.tick(),
            TickOutcome::PhaseComplete {
                finished: Phase::Work,
                next: Phase::Break
            }
        );

        let state = timer.state();
        assert_eq!(state.phase, Phase::Break);
        assert_eq!(state.remaining_seconds, 5 * 60);
        assert!(state.running);
    }

    #[test]
    fn phase_switch_can_stop_instead() {
        let defaults = TimerDefaults {
            work_minutes: 1,
            break_minutes: 1,
            auto_continue: false,
        };
        let mut timer = TimerStateMachine::new(&defaults);
        timer.apply(TimerCommand::Start).unwrap();
        for _ in 0..60 {
            timer.tick();
        }

        assert_eq!(timer.state().phase, Phase::Break);
        assert_eq!(timer.state().remaining_seconds, 60);
        assert!(!timer.is_running());
    }

    #[test]
    fn reset_refills_current_phase() {
        let mut timer = machine();
        timer.apply(TimerCommand::Start).unwrap();
        for _ in 0..1500 {
            timer.tick();
        }
        timer.tick();
        assert_eq!(timer.apply(TimerCommand::Reset), Ok(TimerNotice::Reset));

        let state = timer.state();
        assert_eq!(state.phase, Phase::Break);
        assert_eq!(state.remaining_seconds, 300);
        assert!(!state.running);
    }

    #[test]
    fn duration_change_while_stopped_recomputes() {
        let mut timer = machine();
        let notice = timer.apply(duration_change(Some(50), None)).unwrap();

        assert_eq!(notice, TimerNotice::DurationsChanged { deferred: false });
        assert_eq!(timer.state().work_duration, 50);
        assert_eq!(timer.state().break_duration, 5);
        assert_eq!(timer.state().remaining_seconds, 3000);
    }

    #[test]
    fn duration_change_while_running_waits_for_phase_switch() {
        let mut timer = TimerStateMachine::new(&TimerDefaults {
            work_minutes: 1,
            break_minutes: 1,
            auto_continue: true,
        });
        timer.apply(TimerCommand::Start).unwrap();
        timer.tick();

        let notice = timer.apply(duration_change(None, Some(10))).unwrap();
        assert_eq!(notice, TimerNotice::DurationsChanged { deferred: true });
        assert_eq!(timer.state().remaining_seconds, 59);
        assert_eq!(timer.state().break_duration, 1);

        for _ in 0..59 {
            timer.tick();
        }
        assert_eq!(timer.state().phase, Phase::Break);
        assert_eq!(timer.state().break_duration, 10);
        assert_eq!(timer.state().remaining_seconds, 600);
        assert_eq!(timer.state().pending_durations, None);
    }

    #[test]
    fn shorter_duration_while_running_never_exceeds_cap() {
        let mut timer = machine();
        timer.apply(TimerCommand::Start).unwrap();
        timer.apply(duration_change(Some(1), None)).unwrap();

        let state = timer.state();
        assert!(state.remaining_seconds <= state.phase_seconds());
    }

    #[test]
    fn invalid_durations_are_rejected() {
        let mut timer = machine();
        let before = timer.state().clone();

        assert!(matches!(
            timer.apply(duration_change(Some(0), None)),
            Err(RoomError::InvalidCommand(_))
        ));
        assert!(matches!(
            timer.apply(duration_change(None, None)),
            Err(RoomError::InvalidCommand(_))
        ));
        assert!(matches!(
            timer.apply(duration_change(None, Some(MAX_PHASE_MINUTES + 1))),
            Err(RoomError::InvalidCommand(_))
        ));
        assert_eq!(timer.state(), &before);
    }

    #[test]
    fn mirror_overwrites_and_interpolates_without_feedback() {
        let mut timer = machine();
        timer.apply(TimerCommand::Start).unwrap();
        let update = timer.state().clone();

        let mut mirror = TimerMirror::new();
        mirror.apply(&update);
        mirror.apply(&update);
        assert_eq!(mirror.state(), Some(&update));

        assert_eq!(mirror.display_remaining(Duration::from_secs(3)), Some(1497));
        assert_eq!(mirror.state().map(|s| s.remaining_seconds), Some(1500));
        assert_eq!(mirror.display_remaining(Duration::from_secs(99_999)), Some(0));
    }
}
