//src/error.rs

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to load a classification index. Fatal to the whole run and
/// raised before any sample is touched.
#[derive(Debug, Error)]
pub enum IndexLoadError {
    #[error("index file not found: {0}")]
    Missing(PathBuf),

    #[error("cannot read index {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not a HalalSeq index (bad magic)")]
    BadMagic(PathBuf),

    #[error("index format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("index truncated: payload declares {expected} bytes, file holds {found}")]
    Truncated { expected: u64, found: u64 },

    #[error("index corrupt: {0}")]
    Corrupt(String),
}

/// Invalid input while assembling an index from amplicon sequences.
#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("k-mer length {0} outside 1..=32")]
    InvalidK(usize),

    #[error("unknown species '{0}'")]
    UnknownSpecies(String),

    #[error("unknown marker '{0}'")]
    UnknownMarker(String),

    #[error("amplicon for ({species}, {marker}) is shorter than k")]
    AmpliconTooShort { species: String, marker: String },

    #[error("cannot write index: {0}")]
    Io(#[from] io::Error),

    #[error("cannot encode index payload: {0}")]
    Encode(#[from] bincode::Error),
}

/// Failure to load the reference database (text form or from an index).
#[derive(Debug, Error)]
pub enum DatabaseLoadError {
    #[error("database file not found: {0}")]
    Missing(PathBuf),

    #[error("cannot read database: {0}")]
    Io(#[from] io::Error),

    #[error("database line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("database invalid: {0}")]
    Invalid(String),

    #[error(transparent)]
    Index(#[from] IndexLoadError),
}

/// What went wrong while reading one sample file.
#[derive(Debug, Error)]
pub enum FileReadErrorKind {
    #[error("cannot open file: {0}")]
    Open(#[source] io::Error),

    #[error("read failed: {0}")]
    Io(#[source] io::Error),

    #[error("malformed record {record}: {reason}")]
    Malformed { record: u64, reason: String },

    #[error("file truncated inside record {record}")]
    Truncated { record: u64 },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("mate files differ in length after {pairs} pairs")]
    MateCountMismatch { pairs: u64 },
}

/// An unreadable or corrupt sample file. Fatal to that sample only.
#[derive(Debug, Error)]
#[error("sample '{sample}', file {}: {kind}", .path.display())]
pub struct FileReadError {
    pub sample: String,
    pub path: PathBuf,
    #[source]
    pub kind: FileReadErrorKind,
}

impl FileReadError {
    pub fn new(sample: impl Into<String>, path: impl Into<PathBuf>, kind: FileReadErrorKind) -> Self {
        Self {
            sample: sample.into(),
            path: path.into(),
            kind,
        }
    }
}

/// Invalid analysis configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config value `{field}` out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Estimated RAM for a sample is above the configured budget. A warning
/// only: the caller may enable subsampling in response.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("sample '{sample}' needs an estimated {estimated_mb} MB of RAM (budget {budget_mb} MB); consider subsampling")]
pub struct MemoryBudgetExceeded {
    pub sample: String,
    pub estimated_mb: u64,
    pub budget_mb: u64,
}

/// Abundance reconciliation hit its iteration cap. The last iterate is
/// still reported, flagged as lower confidence.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("sample '{sample}': abundance estimate did not converge after {iterations} iterations (last change {last_delta:.2e})")]
pub struct EstimatorNonConvergence {
    pub sample: String,
    pub iterations: usize,
    pub last_delta: f64,
}

/// Non-fatal conditions collected during a run.
#[derive(Debug, Clone, Error)]
pub enum RunWarning {
    #[error(transparent)]
    MemoryBudget(#[from] MemoryBudgetExceeded),

    #[error(transparent)]
    NonConvergence(#[from] EstimatorNonConvergence),
}

/// Errors surfaced by the analysis pipeline.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("an analysis run is already in progress")]
    AlreadyRunning,

    #[error("no samples to analyse")]
    NoSamples,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    IndexLoad(#[from] IndexLoadError),

    #[error(transparent)]
    FileRead(#[from] FileReadError),

    #[error("analysis worker failed: {0}")]
    Worker(String),
}
