use serde::{Deserialize, Serialize};
use std::fmt;

/// Project descriptor format version.
///
/// Versions are totally ordered; migration steps are keyed by the version they
/// introduce and run iff the project's version is below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

/// Keyword prefix of versioned project descriptors (`QtVS_v304`).
pub const KEYWORD_PREFIX: &str = "QtVS_v";

/// Keyword prefix used by the first generation of descriptors.
pub const LEGACY_KEYWORD_PREFIX: &str = "Qt4VS";

impl SchemaVersion {
    pub const UNKNOWN: SchemaVersion = SchemaVersion(0);
    pub const V1: SchemaVersion = SchemaVersion(100);
    pub const V2: SchemaVersion = SchemaVersion(200);
    pub const V3: SchemaVersion = SchemaVersion(300);
    pub const V3_CL_PROPERTIES: SchemaVersion = SchemaVersion(301);
    pub const V3_GLOBAL_TOOL_PATH: SchemaVersion = SchemaVersion(302);
    pub const V3_PROPERTY_EVAL: SchemaVersion = SchemaVersion(303);
    pub const LATEST: SchemaVersion = SchemaVersion(304);

    /// Parse a `Keyword` property value.
    ///
    /// `QtVS_vNNN` yields `NNN` (exactly three digits); a `Qt4VS` keyword is the first
    /// format generation. Anything else is `UNKNOWN`.
    pub fn from_keyword(keyword: &str) -> SchemaVersion {
        if let Some(digits) = keyword.strip_prefix(KEYWORD_PREFIX) {
            let digits: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.len() == 3 {
                if let Ok(value) = digits.parse::<u32>() {
                    return SchemaVersion(value);
                }
            }
        }
        if keyword.starts_with(LEGACY_KEYWORD_PREFIX) {
            return SchemaVersion::V1;
        }
        SchemaVersion::UNKNOWN
    }

    /// Whether a keyword value identifies a tool-managed project at all.
    pub fn is_managed_keyword(keyword: &str) -> bool {
        keyword.starts_with(KEYWORD_PREFIX) || keyword.starts_with(LEGACY_KEYWORD_PREFIX)
    }

    pub fn keyword(self) -> String {
        format!("{}{:03}", KEYWORD_PREFIX, self.0)
    }

    pub fn is_known(self) -> bool {
        self > SchemaVersion::UNKNOWN && self <= SchemaVersion::LATEST
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SchemaVersion::UNKNOWN => write!(f, "unknown"),
            SchemaVersion(n) if n % 100 == 0 => write!(f, "v{}", n / 100),
            SchemaVersion(n) => write!(f, "v{}.{}", n / 100, n % 100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keywords() {
        assert_eq!(SchemaVersion::from_keyword("QtVS_v304"), SchemaVersion::LATEST);
        assert_eq!(SchemaVersion::from_keyword("QtVS_v300"), SchemaVersion::V3);
        assert_eq!(SchemaVersion::from_keyword("QtVS_v200"), SchemaVersion::V2);
        assert_eq!(SchemaVersion::from_keyword("Qt4VSv1.0"), SchemaVersion::V1);
        assert_eq!(SchemaVersion::from_keyword("Win32Proj"), SchemaVersion::UNKNOWN);
        assert_eq!(SchemaVersion::from_keyword("QtVS_v3"), SchemaVersion::UNKNOWN);
    }

    #[test]
    fn test_ordering_and_keyword() {
        assert!(SchemaVersion::V2 < SchemaVersion::V3);
        assert!(SchemaVersion::V3_PROPERTY_EVAL < SchemaVersion::LATEST);
        assert_eq!(SchemaVersion::LATEST.keyword(), "QtVS_v304");
        assert!(!SchemaVersion(305).is_known());
        assert!(!SchemaVersion::UNKNOWN.is_known());
    }

    #[test]
    fn test_display() {
        assert_eq!(SchemaVersion::V3_CL_PROPERTIES.to_string(), "v3.1");
        assert_eq!(SchemaVersion::V1.to_string(), "v1");
        assert_eq!(SchemaVersion::V3.to_string(), "v3");
    }
}
