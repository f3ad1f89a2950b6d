use std::time::{SystemTime, UNIX_EPOCH};

use crate::objects::object::NativeObject;
use crate::value::{make_number_value, Value};

/// The `clock()` native: seconds since the Unix epoch, as a number.
pub struct ClockTime;

impl ClockTime {
    pub fn new() -> ClockTime {
        ClockTime
    }
}

impl Default for ClockTime {
    fn default() -> ClockTime {
        ClockTime::new()
    }
}

impl NativeObject for ClockTime {
    fn invoke(&self, _args: &[Value]) -> Result<Value, String> {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| "Time went backwards.".to_string())?;
        Ok(make_number_value(duration.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, is_number};

    #[test]
    fn clock_yields_increasing_seconds() {
        let clock = ClockTime::new();
        let first = clock.invoke(&[]).expect("clock should not fail");
        let second = clock.invoke(&[]).expect("clock should not fail");
        assert!(is_number(&first));
        assert!(as_number(&second) >= as_number(&first));
    }
}
