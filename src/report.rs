// src/report.rs

use std::fmt;

use serde::Serialize;

use crate::estimate::AbundanceEstimate;
use crate::types::{SpeciesResult, Verdict};
use crate::verdict::{ConfidenceLevel, InconclusiveReason, VerdictDecision};

/// Final result for one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub sample: String,
    pub verdict: Verdict,
    /// Reads classified (after subsampling, if any).
    pub total_reads: u64,
    pub classified_reads: u64,
    pub unmatched_pct: f64,
    pub cross_marker_agreement: f64,
    pub confidence: ConfidenceLevel,
    pub converged: bool,
    pub subsampled: bool,
    /// Reads read from input, before subsampling.
    pub reads_seen: u64,
    pub inconclusive_reasons: Vec<InconclusiveReason>,
    /// Sorted by `weight_pct`, highest first.
    pub species: Vec<SpeciesResult>,
}

impl Report {
    pub fn new(
        sample: impl Into<String>,
        estimate: AbundanceEstimate,
        decision: VerdictDecision,
        subsampled: bool,
        reads_seen: u64,
    ) -> Self {
        Self {
            sample: sample.into(),
            verdict: decision.verdict,
            total_reads: estimate.total_reads,
            classified_reads: estimate.classified_reads,
            unmatched_pct: estimate.unmatched_pct,
            cross_marker_agreement: estimate.cross_marker_agreement,
            confidence: decision.confidence,
            converged: estimate.converged,
            subsampled,
            reads_seen,
            inconclusive_reasons: decision.reasons,
            species: estimate.species,
        }
    }

    pub fn headline(&self) -> &'static str {
        self.verdict.headline()
    }

    /// Species with a non-zero estimate.
    pub fn detected(&self) -> impl Iterator<Item = &SpeciesResult> {
        self.species.iter().filter(|s| s.weight_pct > 0.0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# sample\t{}", self.sample)?;
        writeln!(f, "# verdict\t{}\t{}", self.verdict, self.headline())?;
        if self.subsampled {
            writeln!(f, "# reads\t{} (subsampled from {})", self.total_reads, self.reads_seen)?;
        } else {
            writeln!(f, "# reads\t{}", self.total_reads)?;
        }
        writeln!(f, "# classified\t{}", self.classified_reads)?;
        writeln!(f, "# unmatched\t{:.2}%", self.unmatched_pct)?;
        writeln!(
            f,
            "# agreement\t{:.3}\t{}",
            self.cross_marker_agreement, self.confidence
        )?;
        if !self.converged {
            writeln!(f, "# estimate did not converge")?;
        }
        for reason in &self.inconclusive_reasons {
            writeln!(f, "# inconclusive\t{}", reason)?;
        }
        writeln!(f, "%weight\tci_lo\tci_hi\t%reads\treads\tstatus\tspecies\tname")?;
        for s in &self.species {
            writeln!(
                f,
                "{:.2}\t{:.2}\t{:.2}\t{:.2}\t{}\t{}\t{}\t{}",
                s.weight_pct,
                s.ci_lo,
                s.ci_hi,
                s.read_pct,
                s.read_count,
                s.halal_status,
                s.species_id,
                s.common_name
            )?;
        }
        Ok(())
    }
}
