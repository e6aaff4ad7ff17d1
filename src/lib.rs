// src/lib.rs
pub mod types;
pub mod error;
pub mod config;
pub mod kmer;
pub mod refdb;
pub mod index;
pub mod sample;
pub mod fastq;
pub mod reader;
pub mod classify;
pub mod estimate;
pub mod verdict;
pub mod report;
pub mod pipeline;

#[cfg(test)]
mod test_fixtures;

use std::path::Path;

pub use crate::config::AnalysisConfig;
pub use crate::error::{AnalysisError, DatabaseLoadError, FileReadError, IndexLoadError, RunWarning};
pub use crate::index::{load_index, ClassificationIndex};
pub use crate::pipeline::{
    AnalysisContext, AnalysisPipeline, PipelineState, ProgressEvent, RunOutcome, StatusSnapshot,
};
pub use crate::reader::{estimate_memory, MemoryEstimate};
pub use crate::refdb::ReferenceDatabase;
pub use crate::report::Report;
pub use crate::sample::{detect_samples, Sample};
pub use crate::types::{HalalStatus, SpeciesResult, Verdict};

/// Loads species/marker metadata from a text database or from an index file.
pub fn load_database<P: AsRef<Path>>(path: P) -> Result<ReferenceDatabase, DatabaseLoadError> {
    let db = ReferenceDatabase::load(path)?;
    log::info!("Loaded reference database: {}", db.summary());
    Ok(db)
}

/// Unified blocking entry point: starts a run and waits for it.
///
/// Start-up failures (bad config, no samples) are returned as `Err`; anything
/// that happens once the worker runs ends up in the returned `RunOutcome`.
pub fn run_analysis(context: AnalysisContext) -> Result<RunOutcome, AnalysisError> {
    let pipeline = AnalysisPipeline::new();
    pipeline.start(context)?;
    Ok(pipeline.wait())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FileReadErrorKind;
    use crate::test_fixtures::{fixture_reads, noise_reads, write_fastq, write_fastq_gz, write_fixture_index};
    use crate::types::Read;
    use std::path::PathBuf;

    fn quick_config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.estimator.bootstrap_draws = 100;
        config
    }

    fn reads_on_both_markers(species: usize, n: usize) -> Vec<Read> {
        let mut reads = fixture_reads(species, 0, n);
        reads.extend(fixture_reads(species, 1, n));
        reads
    }

    fn write_sample(dir: &Path, name: &str, reads: &[Read]) -> PathBuf {
        let path = dir.join(format!("{}.fastq", name));
        write_fastq(&path, reads);
        path
    }

    fn weight(report: &Report, species: &str) -> f64 {
        report
            .species
            .iter()
            .find(|s| s.species_id == species)
            .map(|s| s.weight_pct)
            .unwrap()
    }

    #[test]
    fn test_pork_sample_fails() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let pork = write_sample(dir.path(), "pork", &reads_on_both_markers(1, 40));

        let ctx = AnalysisContext::new(detect_samples(&[pork]), &index).with_config(quick_config());
        let outcome = run_analysis(ctx).unwrap();
        assert!(outcome.is_complete());
        let report = &outcome.reports[0];

        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(report.headline(), "NOT HALAL - Haram content detected");
        assert_eq!(report.species[0].species_id, "Sus_scrofa");
        assert_eq!(report.species[0].halal_status, HalalStatus::Haram);
        assert!((weight(report, "Sus_scrofa") - 100.0).abs() < 1e-6);
        assert_eq!(report.classified_reads, 80);
        assert!(report.cross_marker_agreement > 0.99);
    }

    #[test]
    fn test_cow_sample_passes() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let cow = write_sample(dir.path(), "cow", &reads_on_both_markers(0, 30));

        let outcome = run_analysis(
            AnalysisContext::new(detect_samples(&[cow]), &index).with_config(quick_config()),
        )
        .unwrap();
        let report = &outcome.reports[0];
        assert_eq!(report.verdict, Verdict::Pass);
        assert!(report.inconclusive_reasons.is_empty());
        assert_eq!(weight(report, "Sus_scrofa"), 0.0);
        assert_eq!(report.detected().count(), 1);
    }

    #[test]
    fn test_noise_is_inconclusive() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let noise = write_sample(dir.path(), "noise", &noise_reads(50));

        let outcome = run_analysis(
            AnalysisContext::new(detect_samples(&[noise]), &index).with_config(quick_config()),
        )
        .unwrap();
        let report = &outcome.reports[0];
        assert_eq!(report.verdict, Verdict::Inconclusive);
        assert_eq!(report.classified_reads, 0);
        assert_eq!(report.unmatched_pct, 100.0);
        assert_eq!(report.cross_marker_agreement, 0.0);
        assert!(report.species.iter().all(|s| s.weight_pct == 0.0));
    }

    #[test]
    fn test_mixture_percentages_and_intervals() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let mut reads = reads_on_both_markers(0, 60);
        reads.extend(reads_on_both_markers(2, 20));
        reads.extend(noise_reads(10));
        let mix = write_sample(dir.path(), "mix", &reads);

        let outcome = run_analysis(
            AnalysisContext::new(detect_samples(&[mix]), &index).with_config(quick_config()),
        )
        .unwrap();
        let report = &outcome.reports[0];
        let total: f64 = report.species.iter().map(|s| s.weight_pct).sum::<f64>() + report.unmatched_pct;
        assert!((total - 100.0).abs() < 1e-6, "sum {}", total);
        for s in &report.species {
            assert!(s.ci_lo <= s.weight_pct && s.weight_pct <= s.ci_hi, "{:?}", s);
        }
        assert_eq!(report.species[0].species_id, "Bos_taurus");
        assert!(weight(report, "Bos_taurus") > weight(report, "Gallus_gallus"));
        assert_eq!(report.verdict, Verdict::Pass);
    }

    #[test]
    fn test_runs_are_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let mut reads = reads_on_both_markers(0, 25);
        reads.extend(reads_on_both_markers(1, 5));
        let path = write_sample(dir.path(), "repeat", &reads);

        let mut config = quick_config();
        config.subsample = true;
        config.subsample_cap = 40;
        let run = || {
            run_analysis(AnalysisContext::new(detect_samples(&[&path]), &index).with_config(config.clone()))
                .unwrap()
                .reports
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_paired_gzip_sample() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let r1 = dir.path().join("burger_R1.fastq.gz");
        let r2 = dir.path().join("burger_R2.fastq.gz");
        write_fastq_gz(&r1, &fixture_reads(2, 0, 20));
        write_fastq_gz(&r2, &fixture_reads(2, 0, 20));

        let samples = detect_samples(&[&r2, &r1]);
        assert_eq!(samples.len(), 1);
        assert!(samples[0].is_paired());

        let outcome = run_analysis(AnalysisContext::new(samples, &index).with_config(quick_config())).unwrap();
        let report = &outcome.reports[0];
        assert_eq!(report.sample, "burger");
        assert_eq!(report.total_reads, 20);
        assert_eq!(report.species[0].species_id, "Gallus_gallus");
    }

    #[test]
    fn test_unreadable_sample_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let good = write_sample(dir.path(), "a_good", &reads_on_both_markers(0, 20));
        let bad = dir.path().join("b_bad.fastq");
        std::fs::write(&bad, "@r1\nACGT\n+\nII\n").unwrap();

        let samples = vec![Sample::single("a_good", &good), Sample::single("b_bad", &bad)];
        let outcome = run_analysis(AnalysisContext::new(samples, &index).with_config(quick_config())).unwrap();
        assert_eq!(outcome.reports.len(), 1);
        match outcome.error {
            Some(AnalysisError::FileRead(e)) => {
                assert_eq!(e.sample, "b_bad");
                assert!(matches!(e.kind, FileReadErrorKind::Malformed { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_load_database_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let db = load_database(&index).unwrap();
        assert_eq!(db.summary(), "3 species, 2 markers, 6 references");
        assert!(matches!(run_analysis(AnalysisContext::new(Vec::new(), &index)), Err(AnalysisError::NoSamples)));
    }
}
