//! Duration strings such as `"1h"`, `"30m"` or `"0d0h10m"`

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::EgsError;

/// A duration expressed as `[<n>d][<n>h][<n>m][<n>s]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GprDuration(Duration);

impl GprDuration {
    /// Longest accepted duration, ten years
    pub const MAX_SECS: u64 = 3650 * 86_400;

    pub fn as_std(&self) -> Duration {
        self.0
    }

    /// `None` if the duration does not fit a `chrono::Duration`
    pub fn as_chrono(&self) -> Option<chrono::Duration> {
        i64::try_from(self.0.as_secs())
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for GprDuration {
    type Err = EgsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EgsError::BadParameters("empty duration".to_string()));
        }

        let mut total: u64 = 0;
        let mut digits = String::new();
        for c in s.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let unit = match c {
                'd' => 86_400,
                'h' => 3_600,
                'm' => 60,
                's' => 1,
                _ => {
                    return Err(EgsError::BadParameters(format!(
                        "invalid duration unit '{}' in '{}'",
                        c, s
                    )))
                }
            };
            let value: u64 = digits.parse().map_err(|_| {
                EgsError::BadParameters(format!("missing value before '{}' in '{}'", c, s))
            })?;
            digits.clear();
            total = value
                .checked_mul(unit)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| EgsError::BadParameters(format!("duration '{}' overflows", s)))?;
        }

        if !digits.is_empty() {
            return Err(EgsError::BadParameters(format!(
                "duration '{}' is missing a unit",
                s
            )));
        }
        if total > Self::MAX_SECS {
            return Err(EgsError::BadParameters(format!(
                "duration '{}' exceeds the {}d limit",
                s,
                Self::MAX_SECS / 86_400
            )));
        }

        Ok(Self(Duration::from_secs(total)))
    }
}

impl fmt::Display for GprDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secs = self.0.as_secs();
        if secs == 0 {
            return write!(f, "0s");
        }
        for (unit, label) in [(86_400, 'd'), (3_600, 'h'), (60, 'm'), (1, 's')] {
            if secs >= unit {
                write!(f, "{}{}", secs / unit, label)?;
                secs %= unit;
            }
        }
        Ok(())
    }
}

impl Serialize for GprDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GprDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!("1h".parse::<GprDuration>().unwrap().as_std().as_secs(), 3600);
        assert_eq!("30m".parse::<GprDuration>().unwrap().as_std().as_secs(), 1800);
        assert_eq!("30s".parse::<GprDuration>().unwrap().as_std().as_secs(), 30);
        assert_eq!("1d".parse::<GprDuration>().unwrap().as_std().as_secs(), 86_400);
    }

    #[test]
    fn test_parse_compound() {
        let d: GprDuration = "0d0h10m".parse().unwrap();
        assert_eq!(d.as_std(), Duration::from_secs(600));
        assert_eq!(d.to_string(), "10m");

        let d: GprDuration = "1d2h3m4s".parse().unwrap();
        assert_eq!(d.to_string(), "1d2h3m4s");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<GprDuration>().is_err());
        assert!("10".parse::<GprDuration>().is_err());
        assert!("5w".parse::<GprDuration>().is_err());
        assert!("h".parse::<GprDuration>().is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range() {
        assert!("3650d".parse::<GprDuration>().is_ok());
        assert!(matches!(
            "3650d1s".parse::<GprDuration>(),
            Err(EgsError::BadParameters(_))
        ));
        assert!(matches!(
            "100000000d".parse::<GprDuration>(),
            Err(EgsError::BadParameters(_))
        ));
        assert!("99999999999999999999s".parse::<GprDuration>().is_err());
    }

    #[test]
    fn test_as_chrono() {
        let d: GprDuration = "1h30m".parse().unwrap();
        assert_eq!(d.as_chrono(), Some(chrono::Duration::minutes(90)));
    }

    #[test]
    fn test_serde_as_string() {
        let d: GprDuration = "90m".parse().unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"1h30m\"");
        let back: GprDuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
