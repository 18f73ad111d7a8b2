use std::f64::consts::TAU;

use thiserror::Error;

pub const MIN_CYCLE_RATE: u8 = 1;
pub const MAX_CYCLE_RATE: u8 = 6;
pub const DEFAULT_CYCLE_RATE: u8 = 6;
/// Signal period at cycle rate 1.
pub const BASE_PERIOD_SECS: f64 = 3_600.0;
pub const SIGNAL_AMPLITUDE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("cycle rate {0} is not a whole number in 1..=6")]
pub struct InvalidCycleRate(pub f64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalPair {
    pub a: f64,
    pub b: f64,
}

/// Sine/cosine pair at wall-clock second `t`. `None` for an out-of-range rate.
pub fn sine_pair(cycle_rate: u8, t: i64) -> Option<SignalPair> {
    if !(MIN_CYCLE_RATE..=MAX_CYCLE_RATE).contains(&cycle_rate) {
        return None;
    }

    let period = BASE_PERIOD_SECS / f64::from(cycle_rate);
    let phase = TAU * (t as f64 % period) / period;
    Some(SignalPair {
        a: SIGNAL_AMPLITUDE * phase.sin(),
        b: SIGNAL_AMPLITUDE * phase.cos(),
    })
}

pub fn parse_cycle_rate(value: f64) -> Result<u8, InvalidCycleRate> {
    let in_range = (f64::from(MIN_CYCLE_RATE)..=f64::from(MAX_CYCLE_RATE)).contains(&value);
    if in_range && value.fract() == 0.0 {
        Ok(value as u8)
    } else {
        Err(InvalidCycleRate(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineState {
    pub enabled: bool,
    pub cycle_rate: u8,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle_rate: DEFAULT_CYCLE_RATE,
        }
    }
}

impl MachineState {
    /// Rebuilds state from remotely stored values, defaulting what is
    /// missing or invalid.
    pub fn restored(enabled: Option<f64>, cycle_rate: Option<f64>) -> Self {
        let defaults = Self::default();
        Self {
            enabled: enabled.map_or(defaults.enabled, |value| value != 0.0),
            cycle_rate: cycle_rate
                .and_then(|value| parse_cycle_rate(value).ok())
                .unwrap_or(defaults.cycle_rate),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled != enabled {
            self.enabled = enabled;
            true
        } else {
            false
        }
    }

    pub fn set_cycle_rate(&mut self, value: f64) -> Result<bool, InvalidCycleRate> {
        let rate = parse_cycle_rate(value)?;
        if self.cycle_rate != rate {
            self.cycle_rate = rate;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Signals to emit this tick, if the machine is running.
    pub fn signals(&self, wall_secs: i64) -> Option<SignalPair> {
        if !self.enabled {
            return None;
        }
        sine_pair(self.cycle_rate, wall_secs)
    }
}
