//src/types.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a species in `ReferenceDatabase::species`.
pub type SpeciesIdx = usize;
/// Position of a marker in `ReferenceDatabase::markers`.
pub type MarkerIdx = usize;

/// Static dietary status of a species, as tagged in the reference database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HalalStatus {
    Halal,
    Haram,
    /// Mashbooh: scholarly opinion is divided.
    Doubtful,
    Unknown,
}

impl HalalStatus {
    /// Parses the status word used in database text files.
    pub fn from_word(word: &str) -> Option<Self> {
        match word.trim().to_ascii_lowercase().as_str() {
            "halal" => Some(HalalStatus::Halal),
            "haram" => Some(HalalStatus::Haram),
            "doubtful" | "mashbooh" => Some(HalalStatus::Doubtful),
            "unknown" => Some(HalalStatus::Unknown),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HalalStatus::Halal => "Halal",
            HalalStatus::Haram => "Haram",
            HalalStatus::Doubtful => "Doubtful",
            HalalStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for HalalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sample-level outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

impl Verdict {
    /// One-line headline shown to the end user.
    pub fn headline(self) -> &'static str {
        match self {
            Verdict::Pass => "HALAL - No haram content detected",
            Verdict::Fail => "NOT HALAL - Haram content detected",
            Verdict::Inconclusive => "INCONCLUSIVE - Unable to determine",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Inconclusive => "INCONCLUSIVE",
        };
        f.write_str(s)
    }
}

/// One read (or read pair) as handed from the reader to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    pub id: String,
    pub seq: Vec<u8>,
    /// Second mate for paired samples.
    pub mate: Option<Vec<u8>>,
}

impl Read {
    pub fn single(id: impl Into<String>, seq: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            seq: seq.into(),
            mate: None,
        }
    }

    pub fn paired(id: impl Into<String>, seq: impl Into<Vec<u8>>, mate: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            seq: seq.into(),
            mate: Some(mate.into()),
        }
    }
}

/// Calibrated result for one species in one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesResult {
    pub species_id: String,
    pub common_name: String,
    pub halal_status: HalalStatus,
    /// Copy-number and bias corrected share of the sample, in percent.
    pub weight_pct: f64,
    /// Raw share of reads assigned to this species, in percent.
    pub read_pct: f64,
    pub ci_lo: f64,
    pub ci_hi: f64,
    pub read_count: u64,
}
