use crate::errors::{ProtocolError, Result};
use crate::messages::HourlyValue;

const HOUR_MAX: u32 = 23;
const WATTAGE_MIN: f64 = 0.0;

/// Validates an hourly energy or baseline figure.
pub fn validate_hourly(value: &HourlyValue) -> Result<()> {
    if value.hour > HOUR_MAX {
        return Err(ProtocolError::InvalidMessage(format!(
            "Hour {} out of range [0, {}]",
            value.hour, HOUR_MAX
        )));
    }

    if !value.wattage.is_finite() || value.wattage < WATTAGE_MIN {
        return Err(ProtocolError::InvalidMessage(format!(
            "Wattage {} is not a finite non-negative number",
            value.wattage
        )));
    }

    Ok(())
}

/// Device ids are lower-case hex hardware identifiers.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.is_empty() {
        return Err(ProtocolError::InvalidMessage(
            "Device ID cannot be empty".to_string(),
        ));
    }

    if !device_id
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(ProtocolError::InvalidMessage(format!(
            "Device ID {:?} is not lower-case hex",
            device_id
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_hourly() {
        let value = HourlyValue {
            hour: 14,
            wattage: 80.0,
        };

        assert!(validate_hourly(&value).is_ok());
    }

    #[test]
    fn test_invalid_hour() {
        let value = HourlyValue {
            hour: 24,
            wattage: 80.0,
        };

        assert!(validate_hourly(&value).is_err());
    }

    #[test]
    fn test_invalid_wattage() {
        for wattage in [-1.0, f64::NAN, f64::INFINITY] {
            let value = HourlyValue { hour: 3, wattage };
            assert!(validate_hourly(&value).is_err(), "accepted {}", wattage);
        }
    }

    #[test]
    fn test_device_id() {
        assert!(validate_device_id("b827eb01a2c3").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("B827EB01A2C3").is_err());
        assert!(validate_device_id("dev-1").is_err());
    }
}
