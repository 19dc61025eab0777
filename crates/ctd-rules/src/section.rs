//! CTD section identifiers
//!
//! Sections arrive in many spellings ("M2.6", "2.6", "m26", "M-2.6").
//! [`Section::parse`] is lenient and maps anything unrecognised to
//! [`Section::Unknown`]; [`Section::from_key`] is strict and is used where an
//! unrecognised name is an authoring error (rule-file keys).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A CTD module / section
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Section {
    /// M1 regional administrative information
    Administrative,
    /// M2.3 quality overall summary
    QualityOverallSummary,
    /// M2.4 nonclinical overview
    NonclinicalOverview,
    /// M2.5 clinical overview
    ClinicalOverview,
    /// M2.6 nonclinical written and tabulated summaries
    NonclinicalSummary,
    /// M2.7 clinical summary
    ClinicalSummary,
    /// Section could not be determined
    #[default]
    Unknown,
}

impl Section {
    /// All known sections, in module order
    pub const KNOWN: [Section; 6] = [
        Section::Administrative,
        Section::QualityOverallSummary,
        Section::NonclinicalOverview,
        Section::ClinicalOverview,
        Section::NonclinicalSummary,
        Section::ClinicalSummary,
    ];

    /// Canonical token ("M2.6")
    #[inline]
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Administrative => "M1",
            Self::QualityOverallSummary => "M2.3",
            Self::NonclinicalOverview => "M2.4",
            Self::ClinicalOverview => "M2.5",
            Self::NonclinicalSummary => "M2.6",
            Self::ClinicalSummary => "M2.7",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Human-readable title
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Administrative => "Regional Administrative Information",
            Self::QualityOverallSummary => "Quality Overall Summary",
            Self::NonclinicalOverview => "Nonclinical Overview",
            Self::ClinicalOverview => "Clinical Overview",
            Self::NonclinicalSummary => "Nonclinical Written and Tabulated Summaries",
            Self::ClinicalSummary => "Clinical Summary",
            Self::Unknown => "Unknown Section",
        }
    }

    /// Whether the section is a real CTD section
    #[inline]
    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Lenient parse; unrecognised input yields `Unknown`
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self::from_key(raw).unwrap_or(Self::Unknown)
    }

    /// Strict parse; `None` for anything that is not a known section
    #[must_use]
    pub fn from_key(raw: &str) -> Option<Self> {
        let compact: String = raw
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        let digits = compact.strip_prefix('M').unwrap_or(&compact);

        match digits {
            "1" => Some(Self::Administrative),
            "2.3" | "23" => Some(Self::QualityOverallSummary),
            "2.4" | "24" => Some(Self::NonclinicalOverview),
            "2.5" | "25" => Some(Self::ClinicalOverview),
            "2.6" | "26" => Some(Self::NonclinicalSummary),
            "2.7" | "27" => Some(Self::ClinicalSummary),
            _ => None,
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl Serialize for Section {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.token())
    }
}

impl<'de> Deserialize<'de> for Section {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}
