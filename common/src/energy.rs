//! Cumulative energy from the front-end's 16-bit CF pulse counter.
//!
//! The counter wraps silently; each wrap flips bit 7 of the adjustment byte,
//! so counting toggles of that bit recovers the number of wraps.

use crate::frame::Measurement;

/// Edge detector for the pulse-overflow bit. The first observation only
/// seeds the reference value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverflowToggle {
    last: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Unchanged,
    Toggled,
}

impl OverflowToggle {
    pub fn observe(&mut self, bit: bool) -> Toggle {
        match self.last.replace(bit) {
            Some(previous) if previous != bit => Toggle::Toggled,
            _ => Toggle::Unchanged,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyAccumulator {
    ovflow: u32,
    pulses: u16,
    restored_pulses: u16,
    kp: u32,
    toggle: OverflowToggle,
}

impl EnergyAccumulator {
    pub fn new(ovflow: u32, restored_pulses: u16) -> Self {
        Self {
            ovflow,
            restored_pulses,
            ..Self::default()
        }
    }

    pub fn record(&mut self, measurement: &Measurement) {
        if self.toggle.observe(measurement.overflow_bit) == Toggle::Toggled {
            self.ovflow = self.ovflow.wrapping_add(1);
        }
        self.pulses = measurement.pulses;
        self.kp = measurement.kp;
    }

    pub fn ovflow(&self) -> u32 {
        self.ovflow
    }

    pub fn pulses(&self) -> u16 {
        self.pulses
    }

    pub fn restored_pulses(&self) -> u16 {
        self.restored_pulses
    }

    pub fn total_pulses(&self) -> f64 {
        f64::from(self.ovflow) * 65536.0
            + f64::from(self.pulses)
            + f64::from(self.restored_pulses)
    }

    /// `total_pulses / (F_cf * 3600)` with `F_cf = 1e9 / kP`.
    pub fn kwh(&self) -> f64 {
        self.total_pulses() * f64::from(self.kp) / 1e9 / 3600.0
    }
}

/// Folds the pre-outage counter into `restored` so that the front-end's
/// counter, which restarts at zero, continues the same total.
/// Returns `(ovflow, restored)`.
pub fn restore_after_power_on(ovflow: u32, pulses: u16, restored: u16) -> (u32, u16) {
    let sum = u32::from(pulses) + u32::from(restored);
    if sum > u32::from(u16::MAX) {
        (ovflow.wrapping_add(1), (sum - 65536) as u16)
    } else {
        (ovflow, sum as u16)
    }
}

/// Running mean of the instantaneous power between log appends.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerAverage {
    sum: f64,
    count: u32,
}

impl PowerAverage {
    pub fn add(&mut self, watts: f64) {
        self.sum += watts;
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns the mean and restarts the window seeded with `last`.
    pub fn take(&mut self, last: f64) -> f64 {
        let mean = if self.count == 0 {
            last
        } else {
            self.sum / f64::from(self.count)
        };
        self.sum = last;
        self.count = 1;
        mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reading(pulses: u16, overflow_bit: bool) -> Measurement {
        Measurement {
            pulses,
            overflow_bit,
            kp: 5_264_000,
            ..Measurement::default()
        }
    }

    #[test]
    fn first_observation_only_seeds() {
        let mut toggle = OverflowToggle::default();
        assert_eq!(toggle.observe(true), Toggle::Unchanged);
        assert_eq!(toggle.observe(true), Toggle::Unchanged);
        assert_eq!(toggle.observe(false), Toggle::Toggled);
        assert_eq!(toggle.observe(true), Toggle::Toggled);
    }

    #[test]
    fn counts_wraps_across_toggles() {
        let mut energy = EnergyAccumulator::new(0, 0);
        energy.record(&reading(65_000, false));
        energy.record(&reading(200, true));
        energy.record(&reading(400, true));

        assert_eq!(energy.ovflow(), 1);
        assert_eq!(energy.total_pulses(), 65_536.0 + 400.0);
    }

    #[test]
    fn kwh_uses_power_coefficient() {
        let mut energy = EnergyAccumulator::new(2, 100);
        energy.record(&reading(1000, false));

        let pulses = 2.0 * 65_536.0 + 1000.0 + 100.0;
        let expected = pulses / (1e9 / 5_264_000.0 * 3600.0);
        assert!((energy.kwh() - expected).abs() < 1e-12);
    }

    #[test]
    fn no_frame_yet_means_zero_energy() {
        let energy = EnergyAccumulator::new(3, 10);
        assert_eq!(energy.kwh(), 0.0);
    }

    #[test]
    fn restore_carries_into_overflow() {
        assert_eq!(restore_after_power_on(5, 40_000, 30_000), (6, 4464));
        assert_eq!(restore_after_power_on(5, 1000, 2000), (5, 3000));
        assert_eq!(restore_after_power_on(0, 65_535, 0), (0, 65_535));
        assert_eq!(restore_after_power_on(0, 65_535, 1), (1, 0));
    }

    #[test]
    fn average_restarts_with_last_sample() {
        let mut average = PowerAverage::default();
        average.add(10.0);
        average.add(20.0);
        average.add(30.0);

        assert_eq!(average.take(30.0), 20.0);
        assert_eq!(average.count(), 1);
        average.add(50.0);
        assert_eq!(average.take(50.0), 40.0);
    }
}
