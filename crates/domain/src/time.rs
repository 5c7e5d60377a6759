//! Time and timestamp helpers.

use chrono::{DateTime, TimeDelta, Utc};

/// UTC timestamp used for slot boundaries, lock queue windows and events.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Convert a std duration into a chrono delta, saturating on overflow.
#[must_use]
pub fn to_delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Convert a chrono delta into a std duration, clamping negatives to zero.
#[must_use]
pub fn to_std(delta: TimeDelta) -> std::time::Duration {
    delta.to_std().unwrap_or_default()
}

/// Duration expressed in fractional seconds.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn seconds(delta: TimeDelta) -> f64 {
    delta.num_microseconds().map_or_else(
        || delta.num_milliseconds() as f64 / 1_000.0,
        |us| us as f64 / 1_000_000.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_return_current_utc_time() {
        let before = Utc::now();
        let ts = now();
        let after = Utc::now();
        assert!(ts >= before);
        assert!(ts <= after);
    }

    #[test]
    fn should_clamp_negative_delta_to_zero() {
        assert_eq!(to_std(TimeDelta::seconds(-3)), std::time::Duration::ZERO);
    }

    #[test]
    fn should_express_delta_in_fractional_seconds() {
        assert!((seconds(TimeDelta::milliseconds(1_500)) - 1.5).abs() < f64::EPSILON);
    }
}
