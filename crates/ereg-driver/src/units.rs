//! Pressure unit conversion between the display unit (mBar) and the
//! regulator's native unit (psi).

/// Upper bound of the display range in mBar.
pub const MAX_PRESSURE_MBAR: i32 = 3033;

const PSI_PER_MBAR: f64 = 0.014_503_773_8;
const MBAR_PER_PSI: f64 = 68.947_572_9;

/// Convert mBar to psi, rounded to two decimal places as sent on the wire.
pub fn mbar_to_psi(mbar: f64) -> f64 {
    (mbar * PSI_PER_MBAR * 100.0).round() / 100.0
}

/// Convert psi to mBar.
pub fn psi_to_mbar(psi: f64) -> f64 {
    psi * MBAR_PER_PSI
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbar_to_psi_rounds_to_hundredths() {
        assert_eq!(mbar_to_psi(1000.0), 14.5);
        assert_eq!(mbar_to_psi(0.0), 0.0);
        assert_eq!(mbar_to_psi(3033.0), 43.99);
    }

    #[test]
    fn test_psi_to_mbar() {
        assert!((psi_to_mbar(14.5) - 999.74).abs() < 0.01);
        assert!((psi_to_mbar(1.0) - 68.9476).abs() < 1e-3);
    }
}
