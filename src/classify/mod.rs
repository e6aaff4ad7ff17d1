pub mod classify_reads;
pub mod classify_sequence;
pub mod classify_stats;

pub use classify_reads::classify_batch;
pub use classify_sequence::{classify_read, ClassificationOutcome, UnmatchedReason};
pub use classify_stats::ClassificationCounts;
