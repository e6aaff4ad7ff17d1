use rayon::prelude::*;

use super::classify_sequence::classify_read;
use super::classify_stats::ClassificationCounts;
use crate::index::ClassificationIndex;
use crate::types::Read;

/// Parallel classification of a batch of reads.
///
/// Each rayon worker folds outcomes into its own partial counts; the partials
/// are merged once the batch is done, so no counter is shared between reads.
pub fn classify_batch(reads: &[Read], index: &ClassificationIndex, threshold: f64) -> ClassificationCounts {
    let (n_species, n_markers) = (index.species_count(), index.marker_count());
    reads
        .par_iter()
        .fold(
            || ClassificationCounts::new(n_species, n_markers),
            |mut acc, read| {
                acc.record(&classify_read(read, index, threshold));
                acc
            },
        )
        .reduce(
            || ClassificationCounts::new(n_species, n_markers),
            ClassificationCounts::merge,
        )
}
