//src/reader.rs

use std::fs;
use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::error::{FileReadError, FileReadErrorKind, MemoryBudgetExceeded};
use crate::fastq::RecordReader;
use crate::sample::{Sample, SampleFiles};
use crate::types::Read;

/// Average on-disk bytes per record, by format.
const FASTQ_RECORD_BYTES: u64 = 250;
const FASTA_RECORD_BYTES: u64 = 150;
const FASTQ_GZ_RECORD_BYTES: u64 = 70;
const FASTA_GZ_RECORD_BYTES: u64 = 45;

const BASE_RAM_BYTES: u64 = 64 * 1024 * 1024;
const RAM_BYTES_PER_READ: u64 = 256;

/// Cheap, scan-free sizing of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryEstimate {
    pub file_bytes: u64,
    /// Reads, or read pairs for paired samples.
    pub estimated_reads: u64,
    pub estimated_ram_mb: u64,
}

impl MemoryEstimate {
    /// Warning for `sample` if the estimate is above `budget_mb`.
    pub fn check_budget(&self, sample: &Sample, budget_mb: u64) -> Option<MemoryBudgetExceeded> {
        (self.estimated_ram_mb > budget_mb).then(|| MemoryBudgetExceeded {
            sample: sample.name.clone(),
            estimated_mb: self.estimated_ram_mb,
            budget_mb,
        })
    }
}

fn record_bytes(path: &Path) -> u64 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let gz = name.ends_with(".gz");
    let stem = name.trim_end_matches(".gz");
    let fasta = [".fasta", ".fa", ".fna"].iter().any(|e| stem.ends_with(e));
    match (fasta, gz) {
        (false, false) => FASTQ_RECORD_BYTES,
        (true, false) => FASTA_RECORD_BYTES,
        (false, true) => FASTQ_GZ_RECORD_BYTES,
        (true, true) => FASTA_GZ_RECORD_BYTES,
    }
}

fn file_len(sample: &Sample, path: &Path) -> Result<u64, FileReadError> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| FileReadError::new(&sample.name, path, FileReadErrorKind::Open(e)))
}

/// Estimates read count and RAM from file sizes alone.
pub fn estimate_memory(sample: &Sample) -> Result<MemoryEstimate, FileReadError> {
    let (file_bytes, estimated_reads) = match &sample.files {
        SampleFiles::Single(p) => {
            let len = file_len(sample, p)?;
            (len, len / record_bytes(p))
        }
        SampleFiles::Paired(r1, r2) => {
            let len1 = file_len(sample, r1)?;
            let len2 = file_len(sample, r2)?;
            (len1 + len2, len1 / record_bytes(r1))
        }
    };
    let ram_bytes = BASE_RAM_BYTES + estimated_reads * RAM_BYTES_PER_READ;
    Ok(MemoryEstimate {
        file_bytes,
        estimated_reads,
        estimated_ram_mb: ram_bytes.div_ceil(1024 * 1024),
    })
}

// ---------------------------------------------------------------------------
//  Streaming
// ---------------------------------------------------------------------------

/// Lazy, non-restartable stream of reads from one sample. Paired files are
/// read in lockstep and emitted as one read with its mate.
pub struct SequenceReader {
    sample: String,
    first: (PathBuf, RecordReader),
    second: Option<(PathBuf, RecordReader)>,
    emitted: u64,
    done: bool,
}

impl SequenceReader {
    pub fn open(sample: &Sample) -> Result<Self, FileReadError> {
        let open = |path: &Path| {
            RecordReader::open(path)
                .map(|r| (path.to_path_buf(), r))
                .map_err(|kind| FileReadError::new(&sample.name, path, kind))
        };
        let (first, second) = match &sample.files {
            SampleFiles::Single(p) => (open(p)?, None),
            SampleFiles::Paired(r1, r2) => (open(r1)?, Some(open(r2)?)),
        };
        Ok(Self {
            sample: sample.name.clone(),
            first,
            second,
            emitted: 0,
            done: false,
        })
    }

    /// Reads (or pairs) produced so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn fail(&mut self, path: PathBuf, kind: FileReadErrorKind) -> Option<Result<Read, FileReadError>> {
        self.done = true;
        Some(Err(FileReadError::new(self.sample.clone(), path, kind)))
    }
}

impl Iterator for SequenceReader {
    type Item = Result<Read, FileReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let r1 = match self.first.1.next_record() {
            Ok(r) => r,
            Err(kind) => return self.fail(self.first.0.clone(), kind),
        };

        let Some((r2_path, r2_reader)) = self.second.as_mut() else {
            return match r1 {
                Some(rec) => {
                    self.emitted += 1;
                    Some(Ok(Read::single(rec.id, rec.seq)))
                }
                None => {
                    self.done = true;
                    None
                }
            };
        };

        let r2 = match r2_reader.next_record() {
            Ok(r) => r,
            Err(kind) => {
                let path = r2_path.clone();
                return self.fail(path, kind);
            }
        };
        match (r1, r2) {
            (Some(a), Some(b)) => {
                self.emitted += 1;
                Some(Ok(Read::paired(a.id, a.seq, b.seq)))
            }
            (None, None) => {
                self.done = true;
                None
            }
            (Some(_), None) | (None, Some(_)) => {
                let pairs = self.emitted;
                let path = r2_path.clone();
                self.fail(path, FileReadErrorKind::MateCountMismatch { pairs })
            }
        }
    }
}

// ---------------------------------------------------------------------------
//  Subsampling
// ---------------------------------------------------------------------------

/// Uniform fixed-size sample of a stream of unknown length (Algorithm R).
pub struct Reservoir<T> {
    capacity: usize,
    items: Vec<T>,
    seen: u64,
    rng: ChaCha8Rng,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity.min(1 << 16)),
            seen: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn offer(&mut self, item: T) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let j = self.rng.gen_range(0..self.seen);
        if j < self.capacity as u64 {
            self.items[j as usize] = item;
        }
    }

    /// Items offered so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True once more items were offered than kept.
    pub fn overflowed(&self) -> bool {
        self.seen > self.capacity as u64
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}
