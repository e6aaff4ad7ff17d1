//src/estimate.rs

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Binomial, Distribution};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::classify::ClassificationCounts;
use crate::error::EstimatorNonConvergence;
use crate::refdb::ReferenceDatabase;
use crate::types::SpeciesResult;

/// Keeps the bias coefficient finite when a marker agrees exactly.
const BIAS_FLOOR: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorSettings {
    pub bootstrap_draws: usize,
    /// Two-sided level of the bootstrap interval, e.g. 0.95.
    pub confidence_level: f64,
    pub epsilon: f64,
    pub max_iterations: usize,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            bootstrap_draws: 1000,
            confidence_level: 0.95,
            epsilon: 1e-6,
            max_iterations: 200,
        }
    }
}

/// Output of reconciliation for one count matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    /// Calibrated species fractions summing to 1, or all zero without reads.
    pub abundance: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub last_delta: f64,
}

/// Everything the verdict and report need from one sample's counts.
#[derive(Debug, Clone, PartialEq)]
pub struct AbundanceEstimate {
    /// Every database species, by `weight_pct` descending.
    pub species: Vec<SpeciesResult>,
    pub unmatched_pct: f64,
    pub cross_marker_agreement: f64,
    pub converged: bool,
    pub iterations: usize,
    pub classified_reads: u64,
    pub total_reads: u64,
    pub warning: Option<EstimatorNonConvergence>,
}

fn normalise(v: &mut [f64]) {
    let sum: f64 = v.iter().sum();
    if sum > 0.0 {
        v.iter_mut().for_each(|x| *x /= sum);
    }
}

/// Copy-number corrected view of one marker that has reads.
struct MarkerProfile {
    reads: f64,
    /// Sums to 1 over the species the marker has references for.
    fractions: Vec<f64>,
    /// `[species]`: true where the marker has a reference.
    sees: Vec<bool>,
}

impl MarkerProfile {
    /// Share of `estimate` falling on the species this marker can see.
    fn visible_mass(&self, estimate: &[f64]) -> f64 {
        estimate
            .iter()
            .zip(&self.sees)
            .filter(|&(_, &seen)| seen)
            .map(|(a, _)| a)
            .sum()
    }
}

/// `cells` and `coverage` are row-major `[species][marker]`.
fn marker_profiles(cells: &[f64], n_markers: usize, copy_numbers: &[f64], coverage: &[bool]) -> Vec<MarkerProfile> {
    let n_species = copy_numbers.len();
    (0..n_markers)
        .filter_map(|m| {
            let total: f64 = (0..n_species).map(|s| cells[s * n_markers + m]).sum();
            if total <= 0.0 {
                return None;
            }
            let mut fractions: Vec<f64> = (0..n_species)
                .map(|s| cells[s * n_markers + m] / total / copy_numbers[s])
                .collect();
            normalise(&mut fractions);
            Some(MarkerProfile {
                reads: total,
                fractions,
                sees: (0..n_species).map(|s| coverage[s * n_markers + m]).collect(),
            })
        })
        .collect()
}

/// Iteratively reweights markers by their agreement with the running
/// estimate until no species moves by more than `epsilon`.
///
/// A marker only speaks for the species it has references for: its profile
/// is scaled to the estimate's mass on those species, and species it cannot
/// see neither receive its weight nor count towards its distance.
pub fn reconcile(
    cells: &[f64],
    n_markers: usize,
    copy_numbers: &[f64],
    coverage: &[bool],
    settings: &EstimatorSettings,
) -> Reconciled {
    let n_species = copy_numbers.len();
    let profiles = marker_profiles(cells, n_markers, copy_numbers, coverage);
    if profiles.is_empty() {
        return Reconciled {
            abundance: vec![0.0; n_species],
            converged: true,
            iterations: 0,
            last_delta: 0.0,
        };
    }

    let combine = |weights: &[f64], scales: &[f64]| {
        let mut num = vec![0.0; n_species];
        let mut den = vec![0.0; n_species];
        for ((p, w), scale) in profiles.iter().zip(weights).zip(scales) {
            for s in (0..n_species).filter(|&s| p.sees[s]) {
                num[s] += w * scale * p.fractions[s];
                den[s] += w;
            }
        }
        let mut a: Vec<f64> = num
            .iter()
            .zip(&den)
            .map(|(n, d)| if *d > 0.0 { n / d } else { 0.0 })
            .collect();
        normalise(&mut a);
        a
    };

    let read_weights: Vec<f64> = profiles.iter().map(|p| p.reads).collect();
    let mut current = combine(&read_weights, &vec![1.0; profiles.len()]);
    let mut last_delta = f64::INFINITY;

    for iteration in 1..=settings.max_iterations {
        let scales: Vec<f64> = profiles.iter().map(|p| p.visible_mass(&current)).collect();
        let mut bias: Vec<f64> = profiles
            .iter()
            .zip(&scales)
            .map(|(p, scale)| {
                let d: f64 = (0..n_species)
                    .filter(|&s| p.sees[s])
                    .map(|s| (scale * p.fractions[s] - current[s]).powi(2))
                    .sum();
                1.0 / (BIAS_FLOOR + d)
            })
            .collect();
        let mean = bias.iter().sum::<f64>() / bias.len() as f64;
        bias.iter_mut().for_each(|b| *b /= mean);

        let weights: Vec<f64> = read_weights.iter().zip(&bias).map(|(t, b)| t * b).collect();
        let next = combine(&weights, &scales);
        last_delta = next
            .iter()
            .zip(&current)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max);
        current = next;
        if last_delta < settings.epsilon {
            return Reconciled {
                abundance: current,
                converged: true,
                iterations: iteration,
                last_delta,
            };
        }
    }

    Reconciled {
        abundance: current,
        converged: false,
        iterations: settings.max_iterations,
        last_delta,
    }
}

/// Mean pairwise cosine similarity of the per-marker calibrated vectors,
/// each pair compared over the species both markers have references for.
/// 1.0 with a single informative marker (or no comparable pair), 0.0 with none.
pub fn cross_marker_agreement(cells: &[f64], n_markers: usize, copy_numbers: &[f64], coverage: &[bool]) -> f64 {
    let profiles = marker_profiles(cells, n_markers, copy_numbers, coverage);
    if profiles.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for (i, a) in profiles.iter().enumerate() {
        for b in &profiles[i + 1..] {
            let shared: Vec<usize> = (0..copy_numbers.len()).filter(|&s| a.sees[s] && b.sees[s]).collect();
            let dot: f64 = shared.iter().map(|&s| a.fractions[s] * b.fractions[s]).sum();
            let na = shared.iter().map(|&s| a.fractions[s].powi(2)).sum::<f64>().sqrt();
            let nb = shared.iter().map(|&s| b.fractions[s].powi(2)).sum::<f64>().sqrt();
            if na == 0.0 && nb == 0.0 {
                continue;
            }
            pairs += 1;
            if na > 0.0 && nb > 0.0 {
                sum += dot / (na * nb);
            }
        }
    }
    if pairs == 0 {
        1.0
    } else {
        sum / pairs as f64
    }
}

/// Linear-interpolated percentile of sorted data, `q` in `[0, 1]`.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Species weight percentages for a count matrix: calibrated abundance
/// scaled by the matched share of all reads.
fn weight_pcts(
    cells: &[f64],
    unmatched: f64,
    n_markers: usize,
    copy_numbers: &[f64],
    coverage: &[bool],
    settings: &EstimatorSettings,
) -> (Reconciled, Vec<f64>) {
    let matched: f64 = cells.iter().sum();
    let total = matched + unmatched;
    let rec = reconcile(cells, n_markers, copy_numbers, coverage, settings);
    let scale = if total > 0.0 { matched / total * 100.0 } else { 0.0 };
    let pcts = rec.abundance.iter().map(|a| a * scale).collect();
    (rec, pcts)
}

/// One multinomial resample of `buckets` at their observed total, drawn as a
/// chain of conditional binomials.
fn resample(buckets: &[u64], rng: &mut ChaCha8Rng) -> Vec<u64> {
    let total: u64 = buckets.iter().sum();
    let mut remaining_n = total;
    let mut remaining_p = 1.0;
    let mut out = Vec::with_capacity(buckets.len());
    for (i, &c) in buckets.iter().enumerate() {
        let p = if total > 0 { c as f64 / total as f64 } else { 0.0 };
        let x = if i + 1 == buckets.len() {
            remaining_n
        } else if remaining_n == 0 || p <= 0.0 || remaining_p <= 0.0 {
            0
        } else {
            let cond = (p / remaining_p).clamp(0.0, 1.0);
            Binomial::new(remaining_n, cond)
                .map(|b| b.sample(rng))
                .unwrap_or(0)
        };
        out.push(x);
        remaining_n -= x;
        remaining_p -= p;
    }
    out
}

/// Reconciles one sample's counts and bootstraps confidence intervals.
///
/// Bootstrap draw `i` uses ChaCha stream `i` of `seed`, so the result does not
/// depend on how rayon schedules the draws.
pub fn estimate(
    sample: &str,
    counts: &ClassificationCounts,
    db: &ReferenceDatabase,
    settings: &EstimatorSettings,
    seed: u64,
) -> AbundanceEstimate {
    let n_markers = counts.n_markers();
    let copy_numbers: Vec<f64> = db.species.iter().map(|s| s.mito_copy_number).collect();
    let cells: Vec<f64> = counts.cells().iter().map(|&c| c as f64).collect();
    let total = counts.total();
    let unmatched = counts.unmatched();
    // a cell with reads always has a reference behind it
    let coverage: Vec<bool> = db
        .coverage()
        .into_iter()
        .zip(&cells)
        .map(|(covered, &c)| covered || c > 0.0)
        .collect();

    let (rec, point) = weight_pcts(&cells, unmatched as f64, n_markers, &copy_numbers, &coverage, settings);
    let unmatched_pct = if total > 0 {
        unmatched as f64 / total as f64 * 100.0
    } else {
        100.0
    };
    let agreement = cross_marker_agreement(&cells, n_markers, &copy_numbers, &coverage);

    // draws x species
    let mut buckets: Vec<u64> = counts.cells().to_vec();
    buckets.push(unmatched);
    let draws: Vec<Vec<f64>> = if total == 0 {
        Vec::new()
    } else {
        (0..settings.bootstrap_draws)
            .into_par_iter()
            .map(|i| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                rng.set_stream(i as u64);
                let drawn = resample(&buckets, &mut rng);
                let (cells_i, unmatched_i) = drawn.split_at(drawn.len() - 1);
                let cells_i: Vec<f64> = cells_i.iter().map(|&c| c as f64).collect();
                weight_pcts(&cells_i, unmatched_i[0] as f64, n_markers, &copy_numbers, &coverage, settings).1
            })
            .collect()
    };

    let alpha = (1.0 - settings.confidence_level) / 2.0;
    let mut species: Vec<SpeciesResult> = db
        .species
        .iter()
        .enumerate()
        .map(|(s, sp)| {
            let weight = point[s];
            let (lo, hi) = if draws.is_empty() {
                (weight, weight)
            } else {
                let mut dist: Vec<f64> = draws.iter().map(|d| d[s]).collect();
                dist.sort_by(f64::total_cmp);
                (percentile(&dist, alpha), percentile(&dist, 1.0 - alpha))
            };
            let read_count = counts.species_total(s);
            SpeciesResult {
                species_id: sp.id.clone(),
                common_name: sp.common_name.clone(),
                halal_status: sp.status,
                weight_pct: weight,
                read_pct: if total > 0 {
                    read_count as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
                ci_lo: lo.min(weight),
                ci_hi: hi.max(weight),
                read_count,
            }
        })
        .collect();
    // stable: database order on ties
    species.sort_by(|a, b| b.weight_pct.total_cmp(&a.weight_pct));

    let warning = (!rec.converged).then(|| {
        let w = EstimatorNonConvergence {
            sample: sample.to_string(),
            iterations: rec.iterations,
            last_delta: rec.last_delta,
        };
        log::warn!("{}", w);
        w
    });

    log::debug!(
        "Sample '{}': {} of {} reads classified, {} iterations, agreement {:.3}",
        sample,
        counts.matched(),
        total,
        rec.iterations,
        agreement
    );

    AbundanceEstimate {
        species,
        unmatched_pct,
        cross_marker_agreement: agreement,
        converged: rec.converged,
        iterations: rec.iterations,
        classified_reads: counts.matched(),
        total_reads: total,
        warning,
    }
}
