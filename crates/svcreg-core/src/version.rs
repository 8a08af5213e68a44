//! Four-part microservice versions and the rules that select them.
//!
//! A version is `major.minor.patch.build`; omitted trailing parts are 0.
//! Rules come in four shapes:
//!
//! ```text
//! latest        resolved against the known versions, not a predicate
//! 1.2+          start-from, accepts v >= 1.2.0.0
//! 1.0-2.0       range, accepts 1.0.0.0 <= v < 2.0.0.0
//! 1.0.3         fixed, accepts exactly 1.0.3.0
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const PART_NAMES: [&str; 4] = ["major", "minor", "patch", "build"];

/// A parsed microservice version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    major: u16,
    minor: u16,
    patch: u16,
    build: u16,
}

impl Version {
    pub const ZERO: Version = Version::new(0, 0, 0, 0);

    pub const fn new(major: u16, minor: u16, patch: u16, build: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Parse `"1"`, `"1.2"`, `"1.2.3"` or `"1.2.3.4"`.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() > PART_NAMES.len() {
            return Err(CoreError::InvalidVersion(format!(
                "Invalid version \"{text}\"."
            )));
        }

        let mut values = [0u16; 4];
        for (idx, part) in parts.iter().enumerate() {
            let name = PART_NAMES[idx];
            let value: i64 = part.parse().map_err(|_| {
                CoreError::InvalidVersion(format!(
                    "Invalid {name} \"{part}\", version \"{text}\"."
                ))
            })?;
            if value < 0 {
                return Err(CoreError::InvalidVersion(format!(
                    "{name} \"{part}\" can not be negative, version \"{text}\"."
                )));
            }
            values[idx] = u16::try_from(value).map_err(|_| {
                CoreError::InvalidVersion(format!(
                    "{name} \"{part}\" can not be greater than {}, version \"{text}\".",
                    u16::MAX
                ))
            })?;
        }

        Ok(Self::new(values[0], values[1], values[2], values[3]))
    }

    pub fn major(&self) -> u16 {
        self.major
    }

    pub fn minor(&self) -> u16 {
        self.minor
    }

    pub fn patch(&self) -> u16 {
        self.patch
    }

    pub fn build(&self) -> u16 {
        self.build
    }

    fn parts(&self) -> [u16; 4] {
        [self.major, self.minor, self.patch, self.build]
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts().cmp(&other.parts())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

impl FromStr for Version {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

/// The shape of a parsed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionRuleKind {
    Latest,
    StartFrom(Version),
    /// Inclusive `from`, exclusive `to`.
    Range { from: Version, to: Version },
    Fixed(Version),
}

/// An immutable version selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRule {
    /// Normalized rule text, e.g. `1.0.0.0+`.
    rule: String,
    kind: VersionRuleKind,
}

impl VersionRule {
    pub const LATEST: &'static str = "latest";

    pub const ALL: &'static str = "0.0.0.0+";

    pub fn parse(text: &str) -> CoreResult<Self> {
        let text = text.trim();
        let invalid = |reason: String| CoreError::InvalidVersionRule {
            rule: text.to_string(),
            reason,
        };

        if text.is_empty() {
            return Err(invalid("rule is empty".to_string()));
        }

        let kind = if text.eq_ignore_ascii_case(Self::LATEST) {
            VersionRuleKind::Latest
        } else if let Some(from) = text.strip_suffix('+') {
            VersionRuleKind::StartFrom(Version::parse(from).map_err(|e| invalid(e.to_string()))?)
        } else if let Some((from, to)) = text.split_once('-') {
            let from = Version::parse(from).map_err(|e| invalid(e.to_string()))?;
            let to = Version::parse(to).map_err(|e| invalid(e.to_string()))?;
            if from >= to {
                return Err(invalid(format!("range start {from} is not below end {to}")));
            }
            VersionRuleKind::Range { from, to }
        } else {
            VersionRuleKind::Fixed(Version::parse(text).map_err(|e| invalid(e.to_string()))?)
        };

        Ok(Self::from_kind(kind))
    }

    pub fn from_kind(kind: VersionRuleKind) -> Self {
        let rule = match kind {
            VersionRuleKind::Latest => Self::LATEST.to_string(),
            VersionRuleKind::StartFrom(v) => format!("{v}+"),
            VersionRuleKind::Range { from, to } => format!("{from}-{to}"),
            VersionRuleKind::Fixed(v) => v.to_string(),
        };
        Self { rule, kind }
    }

    /// The rule that accepts every version.
    pub fn all() -> Self {
        Self::from_kind(VersionRuleKind::StartFrom(Version::ZERO))
    }

    pub fn latest() -> Self {
        Self::from_kind(VersionRuleKind::Latest)
    }

    pub fn kind(&self) -> VersionRuleKind {
        self.kind
    }

    pub fn is_latest(&self) -> bool {
        self.kind == VersionRuleKind::Latest
    }

    pub fn as_str(&self) -> &str {
        &self.rule
    }

    /// Whether `version` is selected by this rule.
    ///
    /// `latest` accepts everything here; narrowing it to one version is
    /// done by the caller against the full version set.
    pub fn is_accept(&self, version: &Version) -> bool {
        match self.kind {
            VersionRuleKind::Latest => true,
            VersionRuleKind::StartFrom(from) => *version >= from,
            VersionRuleKind::Range { from, to } => *version >= from && *version < to,
            VersionRuleKind::Fixed(v) => *version == v,
        }
    }
}

impl fmt::Display for VersionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rule)
    }
}

impl FromStr for VersionRule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionRule::parse(s)
    }
}
