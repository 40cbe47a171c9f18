use num_complex::Complex32;

/// One reflection/transmission measurement at a single frequency.
///
/// Produced by a [`crate::VnaSession`] during a binary scan cycle, or by the
/// [`crate::StreamReassembler`] from the external parser's text stream.
/// Immutable once constructed; consumers receive it by value.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Which analyzer produced this point (0-based, matches port order).
    pub device_id: u32,
    /// Stimulus frequency in Hz.
    pub frequency_hz: u32,
    /// Reflection coefficient at port 1.
    pub s11: Complex32,
    /// Forward transmission coefficient.
    pub s21: Complex32,
    /// Sweep index this point belongs to (0-based).
    pub sweep_number: u32,
    /// Seconds from the scan epoch to the command write.
    pub time_sent: f64,
    /// Seconds from the scan epoch to the record read.
    pub time_received: f64,
}

/// Floor reported for a zero-magnitude ratio, in dB.
const MAG_DB_FLOOR: f64 = -100.0;

impl DataPoint {
    /// S11 magnitude in dB.
    pub fn s11_mag_db(&self) -> f64 {
        mag_db(self.s11)
    }

    /// S21 magnitude in dB.
    pub fn s21_mag_db(&self) -> f64 {
        mag_db(self.s21)
    }

    /// S11 phase in degrees.
    pub fn s11_phase_deg(&self) -> f64 {
        f64::from(self.s11.im).atan2(f64::from(self.s11.re)).to_degrees()
    }

    /// S21 phase in degrees.
    pub fn s21_phase_deg(&self) -> f64 {
        f64::from(self.s21.im).atan2(f64::from(self.s21.re)).to_degrees()
    }

    /// Magnitude in dB of the selected scattering parameter.
    pub fn mag_db(&self, parameter: SParameter) -> f64 {
        match parameter {
            SParameter::S11 => self.s11_mag_db(),
            SParameter::S21 => self.s21_mag_db(),
        }
    }
}

fn mag_db(value: Complex32) -> f64 {
    let mag = f64::from(value.norm());
    if mag > 0.0 {
        20.0 * mag.log10()
    } else {
        MAG_DB_FLOOR
    }
}

/// Scattering parameter channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SParameter {
    S11,
    S21,
}

impl SParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            SParameter::S11 => "S11",
            SParameter::S21 => "S21",
        }
    }
}

/// Real or imaginary component of a scattering parameter.
///
/// The text protocol spells the imaginary component `IMG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Real,
    Imag,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Real => "REAL",
            Component::Imag => "IMG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(s11: Complex32, s21: Complex32) -> DataPoint {
        DataPoint {
            device_id: 0,
            frequency_hz: 50_000_000,
            s11,
            s21,
            sweep_number: 0,
            time_sent: 0.0,
            time_received: 0.0,
        }
    }

    #[test]
    fn test_unity_magnitude_is_zero_db() {
        let p = point(Complex32::new(1.0, 0.0), Complex32::new(0.0, 1.0));
        assert!(p.s11_mag_db().abs() < 1e-9);
        assert!(p.s21_mag_db().abs() < 1e-9);
    }

    #[test]
    fn test_zero_magnitude_hits_floor() {
        let p = point(Complex32::new(0.0, 0.0), Complex32::new(0.5, 0.0));
        assert_eq!(p.s11_mag_db(), -100.0);
        assert!(p.s21_mag_db() < 0.0);
    }

    #[test]
    fn test_phase_degrees() {
        let p = point(Complex32::new(0.0, 1.0), Complex32::new(-1.0, 0.0));
        assert!((p.s11_phase_deg() - 90.0).abs() < 1e-9);
        assert!((p.s21_phase_deg() - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_component_spelling() {
        assert_eq!(Component::Imag.as_str(), "IMG");
        assert_eq!(SParameter::S21.as_str(), "S21");
    }
}
