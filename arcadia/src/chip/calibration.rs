//! Input delay calibration of the deserializers that receive a chip's serial lanes
use super::Chip;
use crate::{
    core::{
        LANES,
        TAP_VALUES,
    },
    transport::Transport,
};
use std::{
    thread,
    time::Duration,
};
use tracing::{
    debug,
    info,
    warn,
};

/// Error count recorded for a lane that wasn't locked at a given tap
pub const UNLOCKED_ERRORS: u16 = 0xffff;

/// Error counts of every lane at every tap, indexed `[lane][tap]`
pub type ErrorMatrix = [[u16; TAP_VALUES]; LANES];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CalibrationConfig {
    /// Time given to the links to settle after each resync and counter reset
    pub settle: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationReport {
    /// Lanes that are locked and error free on their final tap
    pub locked: u16,
    /// The tap chosen for each lane, `None` where no tap was error free
    pub taps: [Option<u8>; LANES],
    pub errors: ErrorMatrix,
}

/// Pick the tap in the middle of the longest error free run, treating the tap space as circular.
/// The middle of an even run is the upper of its two central taps. Returns `None` if every tap
/// saw errors.
#[must_use]
pub fn best_tap(errors: &[u16; TAP_VALUES]) -> Option<u8> {
    // Start scanning just past a bad tap so no run is split by the wraparound
    let Some(bad) = errors.iter().position(|&e| e != 0) else {
        return Some((TAP_VALUES / 2) as u8);
    };
    let mut best: Option<(usize, usize)> = None;
    let mut run: Option<(usize, usize)> = None;
    for step in 1..=TAP_VALUES {
        let tap = (bad + step) % TAP_VALUES;
        if errors[tap] == 0 {
            let (start, len) = run.unwrap_or((tap, 0));
            run = Some((start, len + 1));
        } else if let Some((start, len)) = run.take() {
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((start, len));
            }
        }
    }
    // The scan ends on a bad tap, so every run has been closed
    best.map(|(start, len)| ((start + len / 2) % TAP_VALUES) as u8)
}

impl<T> Chip<T>
where
    T: Transport,
{
    fn set_tap(&mut self, lane: usize, tap: u8) -> crate::Result<()> {
        self.send_controller_command(&super::registers::tap_command(lane), u32::from(tap))?;
        Ok(())
    }

    /// The tap `lane` was last programmed with
    #[must_use]
    pub fn tap(&self, lane: usize) -> u8 {
        self.controller_field(&super::registers::tap_command(lane))
            .map_or(0, |tap| (tap & 0x1f) as u8)
    }

    /// Resync every lane, reset the error counters and return the lock mask
    fn resync(&mut self, settle: Duration) -> crate::Result<u16> {
        thread::sleep(settle);
        self.send_controller_command("syncTX", 0xffff)?;
        thread::sleep(settle);
        self.send_controller_command("resetCounters", 1)?;
        thread::sleep(settle);
        let state = self.send_controller_command("readTxState", 0)?;
        Ok((state & 0xffff) as u16)
    }

    fn lane_errors(&mut self, lane: usize) -> crate::Result<u16> {
        // Counters are selected by twice the lane index
        let count = self.send_controller_command("read8b10bErrCounters", (lane * 2) as u32)?;
        Ok((count & 0xffff) as u16)
    }

    /// Sweep every lane across all taps, then settle each one in the middle of its error free
    /// window. Lanes without any error free tap keep the tap they had before the sweep.
    /// # Errors
    /// Returns an error on bad transport
    pub fn calibrate_deserializers(
        &mut self,
        config: &CalibrationConfig,
    ) -> crate::Result<CalibrationReport> {
        let previous: [u8; LANES] = std::array::from_fn(|lane| self.tap(lane));
        self.send_controller_command("resetISERDES", 1)?;
        self.send_controller_command("resetIDELAYTCTRL", 1)?;

        let mut errors: ErrorMatrix = [[UNLOCKED_ERRORS; TAP_VALUES]; LANES];
        for tap in 0..TAP_VALUES {
            for lane in 0..LANES {
                self.set_tap(lane, tap as u8)?;
            }
            let locked = self.resync(config.settle)?;
            for (lane, lane_errors) in errors.iter_mut().enumerate() {
                if locked & (1 << lane) != 0 {
                    lane_errors[tap] = self.lane_errors(lane)?;
                }
            }
            debug!(chip = self.id(), tap, locked = format!("{locked:#06x}"), "Tap swept");
        }

        let taps: [Option<u8>; LANES] = std::array::from_fn(|lane| best_tap(&errors[lane]));
        for (lane, tap) in taps.iter().enumerate() {
            match tap {
                Some(tap) => self.set_tap(lane, *tap)?,
                None => {
                    warn!(chip = self.id(), lane, "No error free tap, lane left unresolved");
                    self.set_tap(lane, previous[lane])?;
                }
            }
        }

        let mut locked = self.resync(config.settle)?;
        for (lane, tap) in taps.iter().enumerate() {
            let lane_errors = self.lane_errors(lane)?;
            if tap.is_none() || lane_errors != 0 {
                locked &= !(1 << lane);
            }
            debug!(chip = self.id(), lane, ?tap, lane_errors, "Lane calibrated");
        }
        info!(
            chip = self.id(),
            locked = format!("{locked:#06x}"),
            "Deserializer calibration done"
        );
        Ok(CalibrationReport {
            locked,
            taps,
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(range: impl IntoIterator<Item = usize>) -> [u16; TAP_VALUES] {
        let mut errors = [100; TAP_VALUES];
        for tap in range {
            errors[tap] = 0;
        }
        errors
    }

    #[test]
    fn test_interior_run() {
        assert_eq!(best_tap(&window(10..=20)), Some(15));
        assert_eq!(best_tap(&window(3..=3)), Some(3));
        assert_eq!(best_tap(&window(0..=4)), Some(2));
        assert_eq!(best_tap(&window(27..=31)), Some(29));
    }

    #[test]
    fn test_wrapping_run() {
        // 28..=31 and 0..=4 form one nine tap window centered on tap 0
        let errors = window((28..32).chain(0..5));
        assert_eq!(best_tap(&errors), Some(0));
        let errors = window((20..32).chain(0..2));
        let tap = best_tap(&errors).unwrap();
        assert_eq!(errors[usize::from(tap)], 0);
        assert_eq!(tap, 27);
    }

    #[test]
    fn test_longest_run_wins() {
        let errors = window((2..5).chain(10..20));
        assert_eq!(best_tap(&errors), Some(15));
    }

    #[test]
    fn test_even_run_rounds_up() {
        assert_eq!(best_tap(&window(10..=13)), Some(12));
        assert_eq!(best_tap(&window(0..=1)), Some(1));
    }

    #[test]
    fn test_no_window() {
        assert_eq!(best_tap(&[UNLOCKED_ERRORS; TAP_VALUES]), None);
        assert_eq!(best_tap(&[1; TAP_VALUES]), None);
    }

    #[test]
    fn test_all_clean() {
        assert_eq!(best_tap(&[0; TAP_VALUES]), Some(16));
    }
}
