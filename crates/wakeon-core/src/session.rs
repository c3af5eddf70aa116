//! Secure-session gating: trusted-time precondition and reconnect backoff.
//!
//! Certificate validation needs a plausible wall clock, so the gate
//! refuses to open the encrypted session until the time collaborator
//! reports an epoch past [`MIN_TRUSTED_EPOCH_SECS`]. After that it spaces
//! connect attempts by a fixed backoff and otherwise just tells the
//! platform to service the established client.

use log::{debug, info};

/// Epoch threshold below which the wall clock is assumed unset.
pub const MIN_TRUSTED_EPOCH_SECS: u64 = 8 * 3600 * 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionConfig {
    /// Minimum spacing between connect attempts.
    pub reconnect_backoff_ms: u64,
    pub min_trusted_epoch_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: 5_000,
            min_trusted_epoch_secs: MIN_TRUSTED_EPOCH_SECS,
        }
    }
}

/// Directive for the session driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionAction {
    /// Nothing to do this tick.
    Idle,
    /// Open the encrypted session; subscribe to the command topic on
    /// success.
    Connect,
    /// Drive the established client's service loop.
    Service,
}

pub struct SessionGate {
    config: SessionConfig,
    time_trusted: bool,
    last_connect_attempt_at: Option<u64>,
}

impl SessionGate {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            time_trusted: false,
            last_connect_attempt_at: None,
        }
    }

    pub fn time_trusted(&self) -> bool {
        self.time_trusted
    }

    /// Decide what the session driver should do this tick.
    ///
    /// `epoch_secs` is the collaborator's current wall-clock reading, if it
    /// has one. Trust latches: once the clock has crossed the threshold a
    /// later sync outage does not revoke it.
    pub fn poll(
        &mut self,
        now_ms: u64,
        station_connected: bool,
        epoch_secs: Option<u64>,
        session_connected: bool,
    ) -> SessionAction {
        if !station_connected {
            return SessionAction::Idle;
        }

        if !self.time_trusted {
            match epoch_secs {
                Some(epoch) if epoch > self.config.min_trusted_epoch_secs => {
                    self.time_trusted = true;
                    info!("session: wall clock trusted (epoch {epoch}s)");
                }
                _ => {
                    debug!("session: waiting for trusted wall clock");
                    return SessionAction::Idle;
                }
            }
        }

        if session_connected {
            return SessionAction::Service;
        }

        let due = self
            .last_connect_attempt_at
            .is_none_or(|at| now_ms.saturating_sub(at) >= self.config.reconnect_backoff_ms);
        if due {
            self.last_connect_attempt_at = Some(now_ms);
            SessionAction::Connect
        } else {
            SessionAction::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SessionGate {
        SessionGate::new(SessionConfig::default())
    }

    const TRUSTED: Option<u64> = Some(MIN_TRUSTED_EPOCH_SECS + 1);

    #[test]
    fn never_connects_before_clock_is_trusted() {
        let mut gate = gate();
        for (tick, epoch) in [
            (0, None),
            (1_000, Some(0)),
            (2_000, Some(1_000)),
            (3_000, Some(MIN_TRUSTED_EPOCH_SECS)),
        ] {
            assert_eq!(gate.poll(tick, true, epoch, false), SessionAction::Idle);
        }
        assert!(!gate.time_trusted());
    }

    #[test]
    fn connects_once_clock_crosses_threshold() {
        let mut gate = gate();
        assert_eq!(gate.poll(0, true, Some(100), false), SessionAction::Idle);
        assert_eq!(gate.poll(1_000, true, TRUSTED, false), SessionAction::Connect);
        assert!(gate.time_trusted());
    }

    #[test]
    fn trust_survives_a_sync_outage() {
        let mut gate = gate();
        assert_eq!(gate.poll(0, true, TRUSTED, false), SessionAction::Connect);
        assert_eq!(gate.poll(10_000, true, None, false), SessionAction::Connect);
    }

    #[test]
    fn idle_without_station_even_with_trusted_clock() {
        let mut gate = gate();
        gate.poll(0, true, TRUSTED, false);
        assert_eq!(gate.poll(10_000, false, TRUSTED, false), SessionAction::Idle);
    }

    #[test]
    fn consecutive_connect_attempts_respect_backoff() {
        let mut gate = gate();
        assert_eq!(gate.poll(0, true, TRUSTED, false), SessionAction::Connect);

        let mut connects = heapless::Vec::<u64, 8>::new();
        connects.push(0).unwrap();
        for tick in (250..20_000).step_by(250) {
            if gate.poll(tick, true, TRUSTED, false) == SessionAction::Connect {
                connects.push(tick).unwrap();
            }
        }

        assert!(connects.len() >= 2);
        for pair in connects.windows(2) {
            assert!(pair[1] - pair[0] >= SessionConfig::default().reconnect_backoff_ms);
        }
    }

    #[test]
    fn established_session_is_serviced_not_reconnected() {
        let mut gate = gate();
        assert_eq!(gate.poll(0, true, TRUSTED, false), SessionAction::Connect);
        assert_eq!(gate.poll(100, true, TRUSTED, true), SessionAction::Service);
        assert_eq!(gate.poll(200, true, TRUSTED, true), SessionAction::Service);
    }

    #[test]
    fn drop_after_long_session_reconnects_without_extra_wait() {
        let mut gate = gate();
        assert_eq!(gate.poll(0, true, TRUSTED, false), SessionAction::Connect);
        for tick in 1..60 {
            assert_eq!(gate.poll(tick * 1_000, true, TRUSTED, true), SessionAction::Service);
        }
        assert_eq!(gate.poll(61_000, true, TRUSTED, false), SessionAction::Connect);
    }
}
