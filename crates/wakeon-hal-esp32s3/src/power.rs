//! Switch-line output driver.

use embedded_hal::digital::OutputPin;
use wakeon_core::pulse::LineDrive;

/// Driver for the pin wired to the motherboard's power-switch header.
///
/// `active_low` fits boards where an optocoupler sinks the header to
/// register a press. Asserted state is tracked here rather than read back
/// from the pad.
pub struct SwitchLine<P: OutputPin> {
    out: P,
    active_low: bool,
    asserted: bool,
}

impl<P: OutputPin> SwitchLine<P> {
    /// Wrap the pin and force the released level.
    pub fn new(out: P, active_low: bool) -> Self {
        let mut line = Self {
            out,
            active_low,
            asserted: false,
        };
        line.release();
        line
    }

    pub fn apply(&mut self, drive: LineDrive) {
        match drive {
            LineDrive::High => self.assert_press(),
            LineDrive::Low => self.release(),
        }
    }

    pub fn assert_press(&mut self) {
        let result = if self.active_low {
            self.out.set_low()
        } else {
            self.out.set_high()
        };
        if result.is_ok() {
            self.asserted = true;
        }
    }

    pub fn release(&mut self) {
        let result = if self.active_low {
            self.out.set_high()
        } else {
            self.out.set_low()
        };
        if result.is_ok() {
            self.asserted = false;
        }
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }
}
