use serde::Serialize;

use crate::index::ClassificationIndex;
use crate::kmer::CanonicalKmers;
use crate::types::{MarkerIdx, Read, SpeciesIdx};

/// Why a read was not assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum UnmatchedReason {
    /// No complete k-mer in the read.
    TooShort,
    /// No species sketch contains any of the read's k-mers.
    NoCandidates,
    /// Best confirmed score is under the acceptance threshold.
    BelowThreshold,
    /// Two or more species share the best score.
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ClassificationOutcome {
    Matched {
        species: SpeciesIdx,
        marker: MarkerIdx,
        /// Fraction of the read's k-mers confirmed by the fine set.
        score: f64,
    },
    Unmatched(UnmatchedReason),
}

impl ClassificationOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, ClassificationOutcome::Matched { .. })
    }
}

/// Both mates of a pair are scored as one read.
fn read_kmers(read: &Read, k: usize) -> Vec<u64> {
    let mut kmers: Vec<u64> = CanonicalKmers::new(&read.seq, k).collect();
    if let Some(mate) = &read.mate {
        kmers.extend(CanonicalKmers::new(mate, k));
    }
    kmers
}

/// Markers whose primers are seen at least twice in the read. Empty when
/// the read carries no primer sequence (trimmed input).
fn localise_markers(read: &Read, index: &ClassificationIndex) -> Vec<MarkerIdx> {
    let pk = index.primer_k();
    let mut hits = vec![0u32; index.marker_count()];
    let mates = std::iter::once(read.seq.as_slice()).chain(read.mate.as_deref());
    for seq in mates {
        for kmer in CanonicalKmers::new(seq, pk) {
            for (m, h) in hits.iter_mut().enumerate() {
                if index.primer_match(m, kmer) {
                    *h += 1;
                }
            }
        }
    }
    hits.iter()
        .enumerate()
        .filter(|&(_, &h)| h >= 2)
        .map(|(m, _)| m)
        .collect()
}

/// Classifies one read against the two-tier index.
///
/// Every k-mer is screened through the species sketches; species that could
/// still reach `threshold` are then confirmed k-mer by k-mer against the exact
/// (marker, species) sets. All scratch state is local to the call.
pub fn classify_read(read: &Read, index: &ClassificationIndex, threshold: f64) -> ClassificationOutcome {
    let k = index.k();
    let kmers = read_kmers(read, k);
    if kmers.is_empty() {
        return ClassificationOutcome::Unmatched(UnmatchedReason::TooShort);
    }
    let total = kmers.len();

    // 1) coarse screen
    let mut coarse_hits = vec![0usize; index.species_count()];
    let mut candidates = Vec::with_capacity(index.species_count());
    for &kmer in &kmers {
        index.coarse_candidates_into(kmer, &mut candidates);
        for &s in &candidates {
            coarse_hits[s] += 1;
        }
    }
    if coarse_hits.iter().all(|&h| h == 0) {
        return ClassificationOutcome::Unmatched(UnmatchedReason::NoCandidates);
    }

    // Sketches have no false negatives, so coarse hits bound the fine score.
    let reaches = |hits: usize| hits as f64 / total as f64 >= threshold;
    let survivors: Vec<SpeciesIdx> = coarse_hits
        .iter()
        .enumerate()
        .filter(|&(_, &h)| h > 0 && reaches(h))
        .map(|(s, _)| s)
        .collect();
    if survivors.is_empty() {
        return ClassificationOutcome::Unmatched(UnmatchedReason::BelowThreshold);
    }

    // 2) primer localisation
    let localised = localise_markers(read, index);
    let markers: Vec<MarkerIdx> = if localised.is_empty() {
        (0..index.marker_count()).collect()
    } else {
        localised
    };

    // 3) fine confirmation; best marker per species, lower index wins ties
    let mut best: Option<(SpeciesIdx, MarkerIdx, usize)> = None;
    let mut tied = false;
    for &s in &survivors {
        let mut species_best: Option<(MarkerIdx, usize)> = None;
        for &m in &markers {
            if !index.has_reference(m, s) {
                continue;
            }
            let confirmed = kmers.iter().filter(|&&x| index.fine_match(m, s, x)).count();
            if species_best.map_or(true, |(_, c)| confirmed > c) {
                species_best = Some((m, confirmed));
            }
        }
        let Some((m, confirmed)) = species_best else {
            continue;
        };
        if confirmed == 0 {
            continue;
        }
        match best {
            Some((_, _, c)) if confirmed < c => {}
            Some((_, _, c)) if confirmed == c => tied = true,
            _ => {
                best = Some((s, m, confirmed));
                tied = false;
            }
        }
    }

    let Some((species, marker, confirmed)) = best else {
        return ClassificationOutcome::Unmatched(UnmatchedReason::BelowThreshold);
    };
    let score = confirmed as f64 / total as f64;
    if score < threshold {
        return ClassificationOutcome::Unmatched(UnmatchedReason::BelowThreshold);
    }
    if tied {
        return ClassificationOutcome::Unmatched(UnmatchedReason::Ambiguous);
    }
    ClassificationOutcome::Matched {
        species,
        marker,
        score,
    }
}
