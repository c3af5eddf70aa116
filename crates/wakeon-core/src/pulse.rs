//! Non-blocking power-switch pulse sequencing.
//!
//! A pulse runs through discrete timed phases so the firmware never sits
//! in a delay while the line is held: the sequencer is polled alongside
//! everything else and answers with the level change to apply, if any.
//! Width accuracy is therefore one poll tick.

use log::debug;

/// Hold-off after a request with the line still low, long enough for the
/// target to have sampled the released level.
pub const SETTLE_MS: u64 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PulsePhase {
    Idle,
    /// Settle window before the line goes high.
    AssertStart,
    /// Line is high for the requested duration.
    Holding,
    /// Line just went low; returns to `Idle` on the next poll.
    Released,
}

/// Level change the platform must apply to the switch line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineDrive {
    High,
    Low,
}

/// Pulse rejected because one is already in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PulseBusy;

pub struct PulseSequencer {
    phase: PulsePhase,
    requested_duration_ms: u32,
    phase_entered_at: u64,
}

impl PulseSequencer {
    pub const fn new() -> Self {
        Self {
            phase: PulsePhase::Idle,
            requested_duration_ms: 0,
            phase_entered_at: 0,
        }
    }

    pub fn phase(&self) -> PulsePhase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == PulsePhase::Idle
    }

    /// The line is high exactly while a pulse is holding.
    pub fn line_high(&self) -> bool {
        self.phase == PulsePhase::Holding
    }

    /// Start a pulse of `duration_ms`. Rejected while any pulse is in
    /// flight; a holding pulse is never cut short or extended.
    pub fn request(&mut self, duration_ms: u32, now_ms: u64) -> Result<(), PulseBusy> {
        if self.phase != PulsePhase::Idle {
            return Err(PulseBusy);
        }

        self.phase = PulsePhase::AssertStart;
        self.phase_entered_at = now_ms;
        self.requested_duration_ms = duration_ms;
        debug!("pulse: {duration_ms}ms requested");
        Ok(())
    }

    /// Advance the phase machine; the caller applies the returned level
    /// change to the physical line.
    pub fn poll(&mut self, now_ms: u64) -> Option<LineDrive> {
        match self.phase {
            PulsePhase::Idle => None,
            PulsePhase::AssertStart => {
                if now_ms.saturating_sub(self.phase_entered_at) < SETTLE_MS {
                    return None;
                }
                self.phase = PulsePhase::Holding;
                self.phase_entered_at = now_ms;
                Some(LineDrive::High)
            }
            PulsePhase::Holding => {
                let held = now_ms.saturating_sub(self.phase_entered_at);
                if held < u64::from(self.requested_duration_ms) {
                    return None;
                }
                self.phase = PulsePhase::Released;
                self.phase_entered_at = now_ms;
                debug!("pulse: released after {held}ms");
                Some(LineDrive::Low)
            }
            PulsePhase::Released => {
                self.phase = PulsePhase::Idle;
                None
            }
        }
    }
}

impl Default for PulseSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the sequencer at a fixed tick and record when the line
    /// changes level.
    fn run(sequencer: &mut PulseSequencer, from_ms: u64, to_ms: u64, tick: u64) -> Vec<(u64, LineDrive)> {
        let mut changes = Vec::new();
        let mut t = from_ms;
        while t <= to_ms {
            if let Some(drive) = sequencer.poll(t) {
                changes.push((t, drive));
            }
            t += tick;
        }
        changes
    }

    #[test]
    fn pulse_settles_low_then_holds_for_requested_duration() {
        let mut sequencer = PulseSequencer::new();
        sequencer.request(500, 0).unwrap();
        assert_eq!(sequencer.phase(), PulsePhase::AssertStart);
        assert!(!sequencer.line_high());

        let changes = run(&mut sequencer, 0, 1_000, 10);
        assert_eq!(changes, vec![(100, LineDrive::High), (600, LineDrive::Low)]);
        assert!(sequencer.is_idle());
    }

    #[test]
    fn request_while_busy_is_rejected_and_first_pulse_unchanged() {
        let mut sequencer = PulseSequencer::new();
        sequencer.request(500, 0).unwrap();
        assert_eq!(sequencer.request(300, 50), Err(PulseBusy));

        let changes = run(&mut sequencer, 0, 1_000, 10);
        assert_eq!(changes, vec![(100, LineDrive::High), (600, LineDrive::Low)]);
    }

    #[test]
    fn request_during_hold_is_rejected() {
        let mut sequencer = PulseSequencer::new();
        sequencer.request(500, 0).unwrap();
        assert_eq!(sequencer.poll(100), Some(LineDrive::High));
        assert!(sequencer.line_high());
        assert_eq!(sequencer.request(100, 200), Err(PulseBusy));
        assert!(sequencer.line_high());
    }

    #[test]
    fn released_phase_is_transient() {
        let mut sequencer = PulseSequencer::new();
        sequencer.request(200, 0).unwrap();
        assert_eq!(sequencer.poll(100), Some(LineDrive::High));
        assert_eq!(sequencer.poll(300), Some(LineDrive::Low));
        assert_eq!(sequencer.phase(), PulsePhase::Released);
        assert_eq!(sequencer.poll(300), None);
        assert!(sequencer.is_idle());

        // Idle again: a new pulse is accepted.
        assert_eq!(sequencer.request(200, 310), Ok(()));
    }

    #[test]
    fn zero_duration_pulse_still_settles_then_releases() {
        let mut sequencer = PulseSequencer::new();
        sequencer.request(0, 0).unwrap();
        assert_eq!(sequencer.poll(50), None);
        assert_eq!(sequencer.poll(100), Some(LineDrive::High));
        assert_eq!(sequencer.poll(100), Some(LineDrive::Low));
    }

    #[test]
    fn hold_width_is_accurate_to_one_poll_tick() {
        let mut sequencer = PulseSequencer::new();
        sequencer.request(500, 0).unwrap();

        let changes = run(&mut sequencer, 0, 2_000, 7);
        let high_at = changes[0].0;
        let low_at = changes[1].0;
        let width = low_at - high_at;
        assert!((500..500 + 7).contains(&width), "width={width}");
    }
}
