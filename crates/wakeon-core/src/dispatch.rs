//! Translation of inbound triggers into switch-line requests.
//!
//! Purely translational: each collaborator (web route, voice responder,
//! broker subscription) produces a [`Trigger`], and this module maps it to
//! what should happen on the line. The pulse sequencer still arbitrates;
//! translation never looks at line state.

use log::debug;

/// Momentary press used for wake/power-toggle requests.
pub const WAKE_PULSE_MS: u32 = 500;
/// Long hold used to force power-off.
pub const SHUTDOWN_HOLD_MS: u32 = 5_000;
/// Bounds applied to caller-specified durations.
pub const PULSE_MIN_MS: u32 = 50;
pub const PULSE_MAX_MS: u32 = 10_000;

/// Inbound trigger from a collaborator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trigger<'a> {
    /// Web route pulse request with an explicit duration.
    WebPulse { duration_ms: u32 },
    /// Voice-assistant on/off event.
    Voice { on: bool },
    /// Raw payload from the broker command topic.
    Broker(&'a [u8]),
}

/// What the firmware should do with the switch line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SwitchRequest {
    Pulse { duration_ms: u32 },
    /// Make sure the line is released. Ignored while a pulse is holding;
    /// a hold is never cut short.
    EnsureLow,
}

/// Map a trigger to a switch request, or `None` for payloads that carry
/// no recognizable command.
pub fn translate(trigger: Trigger<'_>) -> Option<SwitchRequest> {
    match trigger {
        Trigger::WebPulse { duration_ms } => Some(SwitchRequest::Pulse {
            duration_ms: duration_ms.clamp(PULSE_MIN_MS, PULSE_MAX_MS),
        }),
        Trigger::Voice { on: true } => Some(SwitchRequest::Pulse {
            duration_ms: WAKE_PULSE_MS,
        }),
        Trigger::Voice { on: false } => Some(SwitchRequest::EnsureLow),
        Trigger::Broker(payload) => translate_broker(payload),
    }
}

fn translate_broker(payload: &[u8]) -> Option<SwitchRequest> {
    let verb = core::str::from_utf8(payload).ok()?.trim();

    if verb.eq_ignore_ascii_case("on") || verb.eq_ignore_ascii_case("wake") {
        Some(SwitchRequest::Pulse {
            duration_ms: WAKE_PULSE_MS,
        })
    } else if verb.eq_ignore_ascii_case("off") || verb.eq_ignore_ascii_case("shutdown") {
        Some(SwitchRequest::Pulse {
            duration_ms: SHUTDOWN_HOLD_MS,
        })
    } else {
        debug!("dispatch: unrecognized broker payload ({} bytes)", payload.len());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_pulse_passes_duration_through_within_bounds() {
        assert_eq!(
            translate(Trigger::WebPulse { duration_ms: 750 }),
            Some(SwitchRequest::Pulse { duration_ms: 750 })
        );
    }

    #[test]
    fn web_pulse_duration_is_clamped() {
        assert_eq!(
            translate(Trigger::WebPulse { duration_ms: 1 }),
            Some(SwitchRequest::Pulse { duration_ms: PULSE_MIN_MS })
        );
        assert_eq!(
            translate(Trigger::WebPulse { duration_ms: 60_000 }),
            Some(SwitchRequest::Pulse { duration_ms: PULSE_MAX_MS })
        );
    }

    #[test]
    fn voice_on_maps_to_wake_pulse() {
        assert_eq!(
            translate(Trigger::Voice { on: true }),
            Some(SwitchRequest::Pulse { duration_ms: WAKE_PULSE_MS })
        );
    }

    #[test]
    fn voice_off_maps_to_ensure_low() {
        assert_eq!(translate(Trigger::Voice { on: false }), Some(SwitchRequest::EnsureLow));
    }

    #[test]
    fn broker_verbs_map_to_pulses() {
        assert_eq!(
            translate(Trigger::Broker(b"wake")),
            Some(SwitchRequest::Pulse { duration_ms: WAKE_PULSE_MS })
        );
        assert_eq!(
            translate(Trigger::Broker(b"  ON\n")),
            Some(SwitchRequest::Pulse { duration_ms: WAKE_PULSE_MS })
        );
        assert_eq!(
            translate(Trigger::Broker(b"shutdown")),
            Some(SwitchRequest::Pulse { duration_ms: SHUTDOWN_HOLD_MS })
        );
    }

    #[test]
    fn unknown_or_binary_broker_payloads_are_dropped() {
        assert_eq!(translate(Trigger::Broker(b"reboot")), None);
        assert_eq!(translate(Trigger::Broker(b"")), None);
        assert_eq!(translate(Trigger::Broker(&[0xFF, 0x00, 0x80])), None);
    }
}
