// src/classify/classify_stats.rs

use super::classify_sequence::{ClassificationOutcome, UnmatchedReason};
use crate::types::{MarkerIdx, SpeciesIdx};

/// Per-sample read tallies: a dense species x marker matrix of matched
/// reads plus the unmatched bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationCounts {
    n_species: usize,
    n_markers: usize,
    /// Row-major `[species][marker]`.
    cells: Vec<u64>,
    unmatched: u64,
    /// Subset of `unmatched` lost to ties between species.
    ambiguous: u64,
}

impl ClassificationCounts {
    pub fn new(n_species: usize, n_markers: usize) -> Self {
        Self {
            n_species,
            n_markers,
            cells: vec![0; n_species * n_markers],
            unmatched: 0,
            ambiguous: 0,
        }
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn n_markers(&self) -> usize {
        self.n_markers
    }

    #[inline]
    pub fn record(&mut self, outcome: &ClassificationOutcome) {
        match *outcome {
            ClassificationOutcome::Matched { species, marker, .. } => {
                self.add(species, marker, 1);
            }
            ClassificationOutcome::Unmatched(reason) => {
                self.unmatched += 1;
                if reason == UnmatchedReason::Ambiguous {
                    self.ambiguous += 1;
                }
            }
        }
    }

    #[inline]
    pub fn add(&mut self, species: SpeciesIdx, marker: MarkerIdx, n: u64) {
        self.cells[species * self.n_markers + marker] += n;
    }

    pub fn add_unmatched(&mut self, n: u64) {
        self.unmatched += n;
    }

    pub fn get(&self, species: SpeciesIdx, marker: MarkerIdx) -> u64 {
        self.cells[species * self.n_markers + marker]
    }

    /// Matched reads, row-major `[species][marker]`.
    pub fn cells(&self) -> &[u64] {
        &self.cells
    }

    pub fn species_total(&self, species: SpeciesIdx) -> u64 {
        let row = species * self.n_markers;
        self.cells[row..row + self.n_markers].iter().sum()
    }

    pub fn marker_total(&self, marker: MarkerIdx) -> u64 {
        (0..self.n_species).map(|s| self.get(s, marker)).sum()
    }

    pub fn matched(&self) -> u64 {
        self.cells.iter().sum()
    }

    pub fn unmatched(&self) -> u64 {
        self.unmatched
    }

    pub fn ambiguous(&self) -> u64 {
        self.ambiguous
    }

    pub fn total(&self) -> u64 {
        self.matched() + self.unmatched
    }

    /// Adds `other` into `self`. Both must share dimensions.
    pub fn merge(mut self, other: Self) -> Self {
        debug_assert_eq!(
            (self.n_species, self.n_markers),
            (other.n_species, other.n_markers)
        );
        for (a, b) in self.cells.iter_mut().zip(other.cells) {
            *a += b;
        }
        self.unmatched += other.unmatched;
        self.ambiguous += other.ambiguous;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_totals() {
        let mut c = ClassificationCounts::new(3, 2);
        c.record(&ClassificationOutcome::Matched { species: 1, marker: 0, score: 0.9 });
        c.record(&ClassificationOutcome::Matched { species: 1, marker: 1, score: 0.7 });
        c.record(&ClassificationOutcome::Matched { species: 2, marker: 1, score: 1.0 });
        c.record(&ClassificationOutcome::Unmatched(UnmatchedReason::Ambiguous));
        c.record(&ClassificationOutcome::Unmatched(UnmatchedReason::TooShort));

        assert_eq!(c.species_total(1), 2);
        assert_eq!(c.marker_total(1), 2);
        assert_eq!(c.matched(), 3);
        assert_eq!(c.unmatched(), 2);
        assert_eq!(c.ambiguous(), 1);
        assert_eq!(c.total(), 5);
        assert_eq!(c.cells(), &[0, 0, 1, 1, 0, 1]);
    }

    #[test]
    fn test_merge_adds_cellwise() {
        let mut a = ClassificationCounts::new(2, 2);
        a.add(0, 1, 4);
        a.add_unmatched(2);
        let mut b = ClassificationCounts::new(2, 2);
        b.add(0, 1, 1);
        b.add(1, 0, 3);
        let m = a.merge(b);
        assert_eq!(m.get(0, 1), 5);
        assert_eq!(m.get(1, 0), 3);
        assert_eq!(m.total(), 10);
    }
}
