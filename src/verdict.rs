//src/verdict.rs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{HalalStatus, SpeciesResult, Verdict};

/// Verdict thresholds. Policy constants, not derived from data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictPolicy {
    /// A Haram species above this weight percentage fails the sample.
    pub haram_threshold_pct: f64,
    pub max_unmatched_pct: f64,
    pub min_agreement: f64,
    pub min_classified_reads: u64,
    /// Doubtful species above `haram_threshold_pct` make the sample inconclusive.
    pub doubtful_is_inconclusive: bool,
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        Self {
            haram_threshold_pct: 1.0,
            max_unmatched_pct: 50.0,
            min_agreement: 0.70,
            min_classified_reads: 10,
            doubtful_is_inconclusive: true,
        }
    }
}

/// Sample-wide quality figures the verdict depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleQuality {
    pub classified_reads: u64,
    pub unmatched_pct: f64,
    pub cross_marker_agreement: f64,
    pub converged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InconclusiveReason {
    TooFewClassifiedReads { found: u64, required: u64 },
    TooManyUnmatched { pct: f64, max_pct: f64 },
    NotConverged,
    LowAgreement { score: f64, min: f64 },
    DoubtfulSpecies { species: String, weight_pct: f64 },
}

impl fmt::Display for InconclusiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InconclusiveReason::TooFewClassifiedReads { found, required } => {
                write!(f, "only {} classified reads (need {})", found, required)
            }
            InconclusiveReason::TooManyUnmatched { pct, max_pct } => {
                write!(f, "{:.1}% of reads unmatched (max {:.1}%)", pct, max_pct)
            }
            InconclusiveReason::NotConverged => f.write_str("abundance estimate did not converge"),
            InconclusiveReason::LowAgreement { score, min } => {
                write!(f, "markers disagree (agreement {:.2}, min {:.2})", score, min)
            }
            InconclusiveReason::DoubtfulSpecies { species, weight_pct } => {
                write!(f, "doubtful species {} at {:.2}%", species, weight_pct)
            }
        }
    }
}

/// Confidence label derived from cross-marker agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ConfidenceLevel {
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn from_agreement(score: f64) -> Self {
        if score >= 0.95 {
            ConfidenceLevel::VeryHigh
        } else if score >= 0.85 {
            ConfidenceLevel::High
        } else if score >= 0.70 {
            ConfidenceLevel::Moderate
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "Low",
            ConfidenceLevel::Moderate => "Moderate",
            ConfidenceLevel::High => "High",
            ConfidenceLevel::VeryHigh => "Very High",
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerdictDecision {
    pub verdict: Verdict,
    /// Empty unless `verdict` is `Inconclusive`.
    pub reasons: Vec<InconclusiveReason>,
    pub confidence: ConfidenceLevel,
}

/// Sample verdict. A detected Haram species fails the sample outright;
/// otherwise any quality problem makes it inconclusive.
pub fn decide(results: &[SpeciesResult], quality: &SampleQuality, policy: &VerdictPolicy) -> VerdictDecision {
    let confidence = ConfidenceLevel::from_agreement(quality.cross_marker_agreement);

    let haram: Vec<&SpeciesResult> = results
        .iter()
        .filter(|r| r.halal_status == HalalStatus::Haram && r.weight_pct > policy.haram_threshold_pct)
        .collect();
    if !haram.is_empty() {
        for r in &haram {
            log::info!("Haram species {} detected at {:.2}%", r.species_id, r.weight_pct);
        }
        return VerdictDecision {
            verdict: Verdict::Fail,
            reasons: Vec::new(),
            confidence,
        };
    }

    let mut reasons = Vec::new();
    if quality.classified_reads < policy.min_classified_reads {
        reasons.push(InconclusiveReason::TooFewClassifiedReads {
            found: quality.classified_reads,
            required: policy.min_classified_reads,
        });
    }
    if quality.unmatched_pct > policy.max_unmatched_pct {
        reasons.push(InconclusiveReason::TooManyUnmatched {
            pct: quality.unmatched_pct,
            max_pct: policy.max_unmatched_pct,
        });
    }
    if !quality.converged {
        reasons.push(InconclusiveReason::NotConverged);
    }
    if quality.cross_marker_agreement < policy.min_agreement {
        reasons.push(InconclusiveReason::LowAgreement {
            score: quality.cross_marker_agreement,
            min: policy.min_agreement,
        });
    }
    if policy.doubtful_is_inconclusive {
        reasons.extend(
            results
                .iter()
                .filter(|r| r.halal_status == HalalStatus::Doubtful && r.weight_pct > policy.haram_threshold_pct)
                .map(|r| InconclusiveReason::DoubtfulSpecies {
                    species: r.species_id.clone(),
                    weight_pct: r.weight_pct,
                }),
        );
    }

    let verdict = if reasons.is_empty() {
        Verdict::Pass
    } else {
        Verdict::Inconclusive
    };
    VerdictDecision {
        verdict,
        reasons,
        confidence,
    }
}
