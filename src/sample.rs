//src/sample.rs

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use serde::Serialize;

/// Extensions stripped before looking for a mate suffix; `.gz` first.
const EXTENSIONS: [&str; 6] = [".gz", ".fastq", ".fq", ".fasta", ".fa", ".fna"];

/// Mate suffixes, longest first so `_R1_001` wins over `_1`.
const MATE_SUFFIXES: [(&str, Mate); 10] = [
    ("_R1_001", Mate::First),
    ("_R2_001", Mate::Second),
    ("_R1", Mate::First),
    ("_R2", Mate::Second),
    (".R1", Mate::First),
    (".R2", Mate::Second),
    ("-R1", Mate::First),
    ("-R2", Mate::Second),
    ("_1", Mate::First),
    ("_2", Mate::Second),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mate {
    First,
    Second,
}

/// Input files of a sample. Always one or two paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SampleFiles {
    Single(PathBuf),
    /// R1 then R2.
    Paired(PathBuf, PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub name: String,
    pub files: SampleFiles,
}

impl Sample {
    pub fn single(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            files: SampleFiles::Single(path.into()),
        }
    }

    pub fn paired(name: impl Into<String>, r1: impl Into<PathBuf>, r2: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            files: SampleFiles::Paired(r1.into(), r2.into()),
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(self.files, SampleFiles::Paired(..))
    }

    pub fn paths(&self) -> Vec<&Path> {
        match &self.files {
            SampleFiles::Single(p) => vec![p.as_path()],
            SampleFiles::Paired(a, b) => vec![a.as_path(), b.as_path()],
        }
    }
}

fn strip_extensions(name: &str) -> &str {
    let mut stem = name;
    for ext in EXTENSIONS {
        let lower = stem.to_ascii_lowercase();
        if lower.ends_with(ext) && stem.len() > ext.len() {
            stem = &stem[..stem.len() - ext.len()];
        }
    }
    stem
}

fn split_mate(stem: &str) -> (&str, Option<Mate>) {
    for (suffix, mate) in MATE_SUFFIXES {
        if let Some(prefix) = stem.strip_suffix(suffix) {
            if !prefix.is_empty() {
                return (prefix, Some(mate));
            }
        }
    }
    (stem, None)
}

#[derive(Default)]
struct Slot {
    name: String,
    first: Option<PathBuf>,
    second: Option<PathBuf>,
    single: Option<PathBuf>,
}

/// Groups input files into samples, pairing R1/R2 mates that share a
/// directory and name prefix. Output order follows the first appearance
/// of each sample's first file.
pub fn detect_samples<P: AsRef<Path>>(paths: &[P]) -> Vec<Sample> {
    let mut slots: Vec<Slot> = Vec::new();
    // (directory, prefix) -> slots still open for pairing
    let mut open: AHashMap<(PathBuf, String), Vec<usize>> = AHashMap::new();

    for path in paths {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = strip_extensions(&file_name);
        let (prefix, mate) = split_mate(stem);

        let Some(mate) = mate else {
            slots.push(Slot {
                name: stem.to_string(),
                single: Some(path.to_path_buf()),
                ..Slot::default()
            });
            continue;
        };

        let key = (
            path.parent().map(Path::to_path_buf).unwrap_or_default(),
            prefix.to_string(),
        );
        let candidates = open.entry(key).or_default();
        let free = candidates.iter().copied().find(|&i| match mate {
            Mate::First => slots[i].first.is_none(),
            Mate::Second => slots[i].second.is_none(),
        });
        let idx = match free {
            Some(i) => i,
            None => {
                slots.push(Slot {
                    name: prefix.to_string(),
                    ..Slot::default()
                });
                candidates.push(slots.len() - 1);
                slots.len() - 1
            }
        };
        match mate {
            Mate::First => slots[idx].first = Some(path.to_path_buf()),
            Mate::Second => slots[idx].second = Some(path.to_path_buf()),
        }
    }

    let samples: Vec<Sample> = slots
        .into_iter()
        .filter_map(|slot| match (slot.single, slot.first, slot.second) {
            (Some(p), _, _) => Some(Sample::single(slot.name, p)),
            (None, Some(r1), Some(r2)) => Some(Sample::paired(slot.name, r1, r2)),
            (None, Some(p), None) | (None, None, Some(p)) => Some(Sample::single(slot.name, p)),
            (None, None, None) => None,
        })
        .collect();

    log::debug!(
        "Detected {} sample(s) from {} file(s)",
        samples.len(),
        paths.len()
    );
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_and_singles() {
        let samples = detect_samples(&[
            "run/sampleA_R1.fastq",
            "run/sampleB.fastq",
            "run/sampleA_R2.fastq",
        ]);
        assert_eq!(samples.len(), 2);
        assert_eq!(
            samples[0],
            Sample::paired("sampleA", "run/sampleA_R1.fastq", "run/sampleA_R2.fastq")
        );
        assert_eq!(samples[1], Sample::single("sampleB", "run/sampleB.fastq"));
        assert_eq!(samples[0].paths().len(), 2);
        assert!(!samples[1].is_paired());
    }

    #[test]
    fn test_r2_listed_first_still_orders_mates() {
        let samples = detect_samples(&["x/meat-R2.fq.gz", "x/meat-R1.fq.gz"]);
        assert_eq!(samples, vec![Sample::paired("meat", "x/meat-R1.fq.gz", "x/meat-R2.fq.gz")]);
    }

    #[test]
    fn test_suffix_variants() {
        assert_eq!(split_mate("s_R1_001"), ("s", Some(Mate::First)));
        assert_eq!(split_mate("s.R2"), ("s", Some(Mate::Second)));
        assert_eq!(split_mate("s_2"), ("s", Some(Mate::Second)));
        assert_eq!(split_mate("plain"), ("plain", None));
        assert_eq!(strip_extensions("a.FASTQ.GZ"), "a");
        assert_eq!(strip_extensions("reads.fna"), "reads");
    }

    #[test]
    fn test_orphan_mate_and_duplicate_r1() {
        let samples = detect_samples(&[
            "d/lone_R1.fastq",
            "d/dup_R1.fastq",
            "d/dup_R2.fastq",
            "e/dup_R1.fastq",
            "d/dup_1.fastq",
        ]);
        assert_eq!(samples[0], Sample::single("lone", "d/lone_R1.fastq"));
        assert!(samples[1].is_paired());
        // other directory, never paired with d/
        assert_eq!(samples[2], Sample::single("dup", "e/dup_R1.fastq"));
        // second R1 for an already paired prefix
        assert_eq!(samples[3], Sample::single("dup", "d/dup_1.fastq"));
        assert_eq!(samples.len(), 4);
    }

    #[test]
    fn test_empty_input() {
        let none: [&str; 0] = [];
        assert!(detect_samples(&none).is_empty());
    }
}
