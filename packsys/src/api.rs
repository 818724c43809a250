//! Two-component API versions for the buildpack and platform protocols.
//!
//! These are not semver: there is no patch component, and in the 0.x range
//! every minor bump is treated as breaking.

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::Snafu;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn version_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^v?(\d+)\.(\d+)$").unwrap())
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("could not parse '{value}' as an API version"))]
pub struct ParseVersionError {
    value: String,
}

/// Buildpack API versions this engine can execute buildpacks against.
pub const SUPPORTED_BUILDPACK_APIS: &[ApiVersion] = &[
    ApiVersion::new(0, 1),
    ApiVersion::new(0, 2),
    ApiVersion::new(0, 3),
    ApiVersion::new(0, 4),
    ApiVersion::new(0, 5),
    ApiVersion::new(0, 6),
];

/// Platform API versions this engine can serve.
pub const SUPPORTED_PLATFORM_APIS: &[ApiVersion] = &[
    ApiVersion::new(0, 3),
    ApiVersion::new(0, 4),
    ApiVersion::new(0, 5),
];

/// Whether any supported version can serve a caller written against
/// `requested`.
pub fn is_supported(supported: &[ApiVersion], requested: &ApiVersion) -> bool {
    supported.iter().any(|host| host.supports(requested))
}

/// An `X.Y` protocol version. Ordering is lexicographic on (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    major: u32,
    minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Whether a host implementing `self` can serve a caller that was
    /// written against `requested`.
    ///
    /// Equal versions are always compatible. For major >= 1 the majors must
    /// match and the host's minor must be at least the requested minor. In
    /// the 0.x range minor bumps are breaking, so nothing but equality
    /// qualifies.
    pub fn supports(&self, requested: &ApiVersion) -> bool {
        if self == requested {
            return true;
        }
        if self.major != 0 {
            return self.major == requested.major && self.minor >= requested.minor;
        }
        false
    }
}

impl FromStr for ApiVersion {
    type Err = ParseVersionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let captures = version_regex()
            .captures(value)
            .ok_or_else(|| ParseVersionError {
                value: value.to_string(),
            })?;
        let parse = |idx: usize| -> Result<u32, ParseVersionError> {
            captures[idx].parse().map_err(|_| ParseVersionError {
                value: value.to_string(),
            })
        };
        Ok(Self {
            major: parse(1)?,
            minor: parse(2)?,
        })
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for ApiVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ApiVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}
