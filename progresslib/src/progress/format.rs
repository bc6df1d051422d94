use std::{
    fmt,
    time::Duration,
};

use number_prefix::NumberPrefix;

/// Type to represent a file size in base 2 units.
#[derive(Debug)]
pub struct BinarySize(pub u64);

impl fmt::Display for BinarySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NumberPrefix::binary(self.0 as f64) {
            NumberPrefix::Standalone(number) => {
                write!(f, "{number:.0}B")
            }
            NumberPrefix::Prefixed(prefix, number) => {
                write!(f, "{number:.2}{prefix}B")
            }
        }
    }
}

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

/// Type to represent a duration as its two most significant units, rounded
/// down to whole seconds (eg. `1h 5m`). Sub-second durations are shown as
/// `0s`.
#[derive(Debug)]
pub struct HumanDuration(pub Duration);

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();

        let units = [
            (secs / SECS_PER_DAY, "d"),
            (secs % SECS_PER_DAY / SECS_PER_HOUR, "h"),
            (secs % SECS_PER_HOUR / SECS_PER_MINUTE, "m"),
            (secs % SECS_PER_MINUTE, "s"),
        ];

        let first = match units.iter().position(|(v, _)| *v > 0) {
            Some(i) => i,
            None => return f.write_str("0s"),
        };

        let (value, unit) = units[first];
        write!(f, "{value}{unit}")?;

        if let Some((value, unit)) = units.get(first + 1) {
            if *value > 0 {
                write!(f, " {value}{unit}")?;
            }
        }

        Ok(())
    }
}
