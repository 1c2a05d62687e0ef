//! Board firmware version parsing and comparison.
//!
//! Versions reported by the board look like `"1.0.0"` or, in older firmware
//! announcements, carry a textual prefix like `"pcv-1.0.1"`. Components are
//! compared numerically, so `"1.10.0"` sorts after `"1.9.0"`.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A firmware version reported by a board, e.g. `"1.0.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoardVersion {
    /// Major version component.
    pub major: u32,
    /// Minor version component.
    pub minor: u32,
    /// Patch version component.
    pub patch: u32,
}

impl BoardVersion {
    /// Create a version from its components.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for BoardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for BoardVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Some firmware builds announce themselves with a prefix ("pcv-1.0.1").
        let numeric = s.rsplit('-').next().unwrap_or(s);

        let mut components = numeric.split('.');
        let mut next = |name: &str| -> Result<u32, Error> {
            components
                .next()
                .unwrap_or("0")
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::InvalidData {
                    context: format!("version component {name} in {s:?}"),
                })
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;

        if components.next().is_some() {
            return Err(Error::InvalidData {
                context: format!("too many version components in {s:?}"),
            });
        }

        Ok(Self::new(major, minor, patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_plain() {
        let v: BoardVersion = "1.0.0".parse().unwrap();
        assert_eq!(v, BoardVersion::new(1, 0, 0));
    }

    #[test]
    fn test_parse_prefixed() {
        let v: BoardVersion = "pcv-1.0.1".parse().unwrap();
        assert_eq!(v, BoardVersion::new(1, 0, 1));
    }

    #[test]
    fn test_parse_short() {
        // Missing components default to zero.
        let v: BoardVersion = "2.1".parse().unwrap();
        assert_eq!(v, BoardVersion::new(2, 1, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("garbage".parse::<BoardVersion>().is_err());
        assert!("1.x.0".parse::<BoardVersion>().is_err());
        assert!("1.2.3.4".parse::<BoardVersion>().is_err());
        assert!("".parse::<BoardVersion>().is_err());
    }

    #[test]
    fn test_numeric_ordering() {
        let v_1_9_0: BoardVersion = "1.9.0".parse().unwrap();
        let v_1_10_0: BoardVersion = "1.10.0".parse().unwrap();
        // Lexicographic comparison would get this backwards.
        assert!(v_1_10_0 > v_1_9_0);

        let v_0_9_0: BoardVersion = "0.9.0".parse().unwrap();
        assert!(v_0_9_0 < BoardVersion::new(1, 0, 0));
    }

    #[test]
    fn test_display_roundtrip() {
        let v = BoardVersion::new(1, 2, 3);
        assert_eq!(v.to_string(), "1.2.3");
        assert_eq!(v.to_string().parse::<BoardVersion>().unwrap(), v);
    }
}
