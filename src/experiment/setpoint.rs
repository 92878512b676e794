//! Power-to-setpoint conversion and thermal resistance.

use crate::error::{RigError, RigResult};
use crate::instrument::SupplyLimits;
use serde::Serialize;

/// Supply operating point for a target heater power.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Setpoint {
    /// Target power (W)
    pub power_w: f64,
    /// Heater resistance (Ω)
    pub resistance_ohm: f64,
    /// `sqrt(P·R)` (V)
    pub voltage: f64,
    /// `V / R` (A)
    pub current: f64,
}

impl Setpoint {
    /// Operating point delivering `power_w` into `resistance_ohm`.
    pub fn for_power(power_w: f64, resistance_ohm: f64) -> Self {
        let voltage = (power_w * resistance_ohm).sqrt();
        let current = voltage / resistance_ohm;
        Self {
            power_w,
            resistance_ohm,
            voltage,
            current,
        }
    }

    /// Reject operating points the supply cannot produce.
    pub fn check_limits(&self, limits: &SupplyLimits) -> RigResult<()> {
        let within = self.voltage.is_finite()
            && self.current.is_finite()
            && self.voltage <= limits.voltage_max
            && self.current <= limits.current_max;
        if within {
            Ok(())
        } else {
            Err(RigError::LimitExceeded {
                power_w: self.power_w,
                resistance_ohm: self.resistance_ohm,
                voltage: self.voltage,
                current: self.current,
            })
        }
    }

    /// Current limit to program: the operating current times `margin`,
    /// clamped to the supply maximum.
    pub fn current_limit(&self, margin: f64, current_max: f64) -> f64 {
        (self.current * margin).min(current_max)
    }
}

/// `(T_evap − T_cond) / P` in °C/W; `None` when `P <= 0`.
pub fn thermal_resistance(t_evap: f64, t_cond: f64, power_w: f64) -> Option<f64> {
    if power_w > 0.0 && power_w.is_finite() {
        Some((t_evap - t_cond) / power_w)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_to_setpoint_law() {
        for (p, r) in [(1.0, 10.0), (2.0, 10.0), (25.0, 4.7), (0.5, 100.0), (900.0, 100.0)] {
            let sp = Setpoint::for_power(p, r);
            assert!((sp.voltage - (p * r).sqrt()).abs() < 1e-12);
            assert!((sp.current - sp.voltage / r).abs() < 1e-12);
            assert!((sp.voltage * sp.current - p).abs() < 1e-9, "P={} R={}", p, r);
        }
    }

    #[test]
    fn scenario_levels() {
        let one = Setpoint::for_power(1.0, 10.0);
        assert!((one.voltage - 3.162).abs() < 1e-3);
        assert!((one.current - 0.316).abs() < 1e-3);
        let two = Setpoint::for_power(2.0, 10.0);
        assert!((two.voltage - 4.472).abs() < 1e-3);
        assert!((two.current - 0.447).abs() < 1e-3);
    }

    #[test]
    fn limits() {
        let limits = SupplyLimits::default();
        assert!(Setpoint::for_power(3.0, 10.0).check_limits(&limits).is_ok());
        // 5.48 A > 5.2 A
        let err = Setpoint::for_power(300.0, 10.0).check_limits(&limits).unwrap_err();
        assert!(matches!(err, RigError::LimitExceeded { .. }));
        // 316 V > 300 V
        assert!(Setpoint::for_power(100.0, 1000.0).check_limits(&limits).is_err());
    }

    #[test]
    fn current_limit_is_clamped() {
        let sp = Setpoint::for_power(1.0, 10.0);
        assert!((sp.current_limit(1.1, 5.2) - 0.3479).abs() < 1e-4);
        let sp = Setpoint::for_power(250.0, 10.0);
        assert_eq!(sp.current_limit(1.1, 5.2), 5.2);
    }

    #[test]
    fn thermal_resistance_law() {
        assert_eq!(thermal_resistance(40.0, 30.0, 2.0), Some(5.0));
        assert_eq!(thermal_resistance(30.0, 40.0, 2.0), Some(-5.0));
        assert_eq!(thermal_resistance(40.0, 30.0, 0.0), None);
        assert_eq!(thermal_resistance(40.0, 30.0, -1.0), None);
    }
}
