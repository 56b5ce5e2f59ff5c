//! Version extraction for runtime checks.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("version regex"));

/// A `major.minor[.patch]` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Find the first version number in free-form `--version` output.
    pub fn find_in(text: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(text)?;
        let part = |idx: usize| {
            caps.get(idx)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0)
        };
        Some(Self {
            major: part(1),
            minor: part(2),
            patch: part(3),
        })
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split('.');
        let mut next = |name: &str, required: bool| -> Result<u64, String> {
            match parts.next() {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid {name} component in version '{s}'")),
                None if required => Err(format!("missing {name} component in version '{s}'")),
                None => Ok(0),
            }
        };
        let version = Self {
            major: next("major", true)?,
            minor: next("minor", false)?,
            patch: next("patch", false)?,
        };
        if parts.next().is_some() {
            return Err(format!("too many components in version '{s}'"));
        }
        Ok(version)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_version_in_tool_output() {
        assert_eq!(
            Version::find_in("Python 3.12.1\n"),
            Some(Version {
                major: 3,
                minor: 12,
                patch: 1
            })
        );
        assert_eq!(
            Version::find_in("git version 2.43.0"),
            Some("2.43.0".parse().expect("parse"))
        );
        assert_eq!(Version::find_in("no digits here"), None);
    }

    #[test]
    fn orders_numerically() {
        let min: Version = "3.8".parse().expect("parse");
        assert!(Version::find_in("Python 3.10.0").expect("find") >= min);
        assert!(Version::find_in("Python 3.7.9").expect("find") < min);
    }

    #[test]
    fn rejects_bad_minimums() {
        assert!("".parse::<Version>().is_err());
        assert!("3.x".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
    }
}
