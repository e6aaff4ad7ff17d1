//src/index.rs

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IndexBuildError, IndexLoadError};
use crate::kmer::{self, MAX_K};
use crate::refdb::{MarkerRef, ReferenceDatabase};
use crate::types::{MarkerIdx, SpeciesIdx};

/// File type code at the start of every index file.
pub const INDEX_MAGIC: &[u8; 8] = b"HALALIDX";

/// Bumped whenever the payload layout changes.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// magic + version + payload length
const HEADER_LEN: usize = 8 + 4 + 8;

pub const DEFAULT_K: usize = 21;
pub const DEFAULT_PRIMER_K: usize = 12;
pub const DEFAULT_SKETCH_FPR: f64 = 0.01;

/// splitmix64 finaliser. Persisted sketches depend on it, so it must never change.
#[inline]
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

// ---------------------------------------------------------------------------
//  Coarse tier: per-species Bloom sketch
// ---------------------------------------------------------------------------

/// Approximate membership over canonical k-mers. Never reports a false
/// negative; false positives occur at roughly the configured rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomSketch {
    bits: Vec<u64>,
    n_bits: u64,
    n_hashes: u32,
}

impl BloomSketch {
    pub fn with_capacity(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * p.ln() / (ln2 * ln2)).ceil().max(64.0) as u64;
        let words = m.div_ceil(64);
        let n_bits = words * 64;
        let n_hashes = ((n_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;
        Self {
            bits: vec![0; words as usize],
            n_bits,
            n_hashes,
        }
    }

    #[inline]
    fn positions(&self, kmer: u64) -> impl Iterator<Item = u64> {
        let h1 = mix64(kmer);
        let h2 = mix64(h1 ^ 0x5851F42D4C957F2D) | 1;
        let n_bits = self.n_bits;
        (0..self.n_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % n_bits)
    }

    pub fn insert(&mut self, kmer: u64) {
        for pos in self.positions(kmer) {
            self.bits[(pos / 64) as usize] |= 1u64 << (pos % 64);
        }
    }

    #[inline]
    pub fn contains(&self, kmer: u64) -> bool {
        self.positions(kmer)
            .all(|pos| self.bits[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0)
    }

    fn is_well_formed(&self) -> bool {
        self.n_hashes >= 1 && self.n_bits > 0 && self.bits.len() as u64 * 64 == self.n_bits
    }
}

// ---------------------------------------------------------------------------
//  Fine tier: exact k-mer set
// ---------------------------------------------------------------------------

/// Sorted, de-duplicated canonical k-mers queried by binary search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmerSet {
    kmers: Vec<u64>,
}

impl KmerSet {
    pub fn from_kmers<I: IntoIterator<Item = u64>>(kmers: I) -> Self {
        let mut kmers: Vec<u64> = kmers.into_iter().collect();
        kmers.sort_unstable();
        kmers.dedup();
        Self { kmers }
    }

    #[inline]
    pub fn contains(&self, kmer: u64) -> bool {
        self.kmers.binary_search(&kmer).is_ok()
    }

    pub fn len(&self) -> usize {
        self.kmers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kmers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.kmers.iter().copied()
    }

    fn is_strictly_sorted(&self) -> bool {
        self.kmers.windows(2).all(|w| w[0] < w[1])
    }
}

// ---------------------------------------------------------------------------
//  The two-tier index
// ---------------------------------------------------------------------------

/// Coarse sketches, fine sets and primer sets. Immutable after load and
/// shared read-only between classification workers.
#[derive(Debug, Clone)]
pub struct ClassificationIndex {
    k: usize,
    primer_k: usize,
    /// `[species]`
    coarse: Vec<BloomSketch>,
    /// `[marker][species]`
    fine: Vec<Vec<KmerSet>>,
    /// `[marker]`
    primers: Vec<KmerSet>,
}

impl ClassificationIndex {
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn primer_k(&self) -> usize {
        self.primer_k
    }

    pub fn species_count(&self) -> usize {
        self.coarse.len()
    }

    pub fn marker_count(&self) -> usize {
        self.fine.len()
    }

    /// Species whose sketch may contain `kmer`. Includes every true owner.
    pub fn coarse_candidates(&self, kmer: u64) -> Vec<SpeciesIdx> {
        let mut out = Vec::new();
        self.coarse_candidates_into(kmer, &mut out);
        out
    }

    /// Allocation-free variant of [`coarse_candidates`](Self::coarse_candidates).
    pub fn coarse_candidates_into(&self, kmer: u64, out: &mut Vec<SpeciesIdx>) {
        out.clear();
        out.extend(
            self.coarse
                .iter()
                .enumerate()
                .filter(|(_, sketch)| sketch.contains(kmer))
                .map(|(s, _)| s),
        );
    }

    /// Exact test against the (marker, species) reference k-mers.
    #[inline]
    pub fn fine_match(&self, marker: MarkerIdx, species: SpeciesIdx, kmer: u64) -> bool {
        self.fine
            .get(marker)
            .and_then(|row| row.get(species))
            .is_some_and(|set| set.contains(kmer))
    }

    /// True when a reference amplicon exists for (marker, species).
    pub fn has_reference(&self, marker: MarkerIdx, species: SpeciesIdx) -> bool {
        self.fine
            .get(marker)
            .and_then(|row| row.get(species))
            .is_some_and(|set| !set.is_empty())
    }

    pub fn fine_set(&self, marker: MarkerIdx, species: SpeciesIdx) -> Option<&KmerSet> {
        self.fine.get(marker).and_then(|row| row.get(species))
    }

    /// True if `primer_kmer` (canonical, `primer_k` long) occurs in a primer of `marker`.
    #[inline]
    pub fn primer_match(&self, marker: MarkerIdx, primer_kmer: u64) -> bool {
        self.primers
            .get(marker)
            .is_some_and(|set| set.contains(primer_kmer))
    }

    fn check_shape(&self, db: &ReferenceDatabase) -> Result<(), IndexLoadError> {
        let corrupt = |msg: String| Err(IndexLoadError::Corrupt(msg));
        if !(1..=MAX_K).contains(&self.k) || !(1..=MAX_K).contains(&self.primer_k) {
            return corrupt(format!("k={} primer_k={} outside 1..=32", self.k, self.primer_k));
        }
        let (n_species, n_markers) = (db.species.len(), db.markers.len());
        if self.coarse.len() != n_species {
            return corrupt(format!("{} sketches for {} species", self.coarse.len(), n_species));
        }
        if self.fine.len() != n_markers || self.primers.len() != n_markers {
            return corrupt(format!("fine/primer tables do not match {} markers", n_markers));
        }
        if self.fine.iter().any(|row| row.len() != n_species) {
            return corrupt("fine table row width differs from species count".into());
        }
        if self.coarse.iter().any(|s| !s.is_well_formed()) {
            return corrupt("malformed coarse sketch".into());
        }
        let mut all_sets = self.fine.iter().flatten().chain(self.primers.iter());
        if all_sets.any(|set| !set.is_strictly_sorted()) {
            return corrupt("unsorted k-mer set".into());
        }
        for m in 0..n_markers {
            for s in 0..n_species {
                if self.has_reference(m, s) != db.reference(s, m).is_some() {
                    return corrupt(format!(
                        "reference table disagrees with k-mer sets for {} / {}",
                        db.species[s].id, db.markers[m].id
                    ));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
//  Container I/O
// ---------------------------------------------------------------------------

// Both payload structs must keep identical field order and types.
#[derive(Serialize)]
struct IndexPayloadRef<'a> {
    database: &'a ReferenceDatabase,
    k: u8,
    primer_k: u8,
    coarse: &'a [BloomSketch],
    fine: &'a [Vec<KmerSet>],
    primers: &'a [KmerSet],
}

#[derive(Deserialize)]
struct IndexPayload {
    database: ReferenceDatabase,
    k: u8,
    primer_k: u8,
    coarse: Vec<BloomSketch>,
    fine: Vec<Vec<KmerSet>>,
    primers: Vec<KmerSet>,
}

/// Reads a `u64` from a little-endian byte slice.
fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    u64::from_le_bytes(arr)
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    u32::from_le_bytes(arr)
}

/// Loads an index file into two independently owned halves: the reference
/// database and the classification index.
pub fn load_index<P: AsRef<Path>>(
    path: P,
) -> Result<(ReferenceDatabase, ClassificationIndex), IndexLoadError> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => IndexLoadError::Missing(path.to_path_buf()),
        _ => IndexLoadError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    if data.len() < INDEX_MAGIC.len() || &data[..INDEX_MAGIC.len()] != INDEX_MAGIC {
        return Err(IndexLoadError::BadMagic(path.to_path_buf()));
    }
    if data.len() < HEADER_LEN {
        return Err(IndexLoadError::Truncated {
            expected: HEADER_LEN as u64,
            found: data.len() as u64,
        });
    }

    let version = read_u32_le(&data[8..12]);
    if version != INDEX_FORMAT_VERSION {
        return Err(IndexLoadError::VersionMismatch {
            found: version,
            expected: INDEX_FORMAT_VERSION,
        });
    }

    let payload_len = read_u64_le(&data[12..20]);
    let available = (data.len() - HEADER_LEN) as u64;
    if available < payload_len {
        return Err(IndexLoadError::Truncated {
            expected: payload_len,
            found: available,
        });
    }
    if available > payload_len {
        return Err(IndexLoadError::Corrupt(format!(
            "{} trailing bytes after payload",
            available - payload_len
        )));
    }

    let payload: IndexPayload = bincode::deserialize(&data[HEADER_LEN..])
        .map_err(|e| IndexLoadError::Corrupt(e.to_string()))?;

    payload
        .database
        .validate()
        .map_err(|e| IndexLoadError::Corrupt(e.to_string()))?;

    let index = ClassificationIndex {
        k: payload.k as usize,
        primer_k: payload.primer_k as usize,
        coarse: payload.coarse,
        fine: payload.fine,
        primers: payload.primers,
    };
    index.check_shape(&payload.database)?;

    log::info!(
        "Loaded index {} (format v{}): {}, k={}, primer_k={}",
        path.display(),
        version,
        payload.database.summary(),
        index.k,
        index.primer_k
    );

    Ok((payload.database, index))
}

/// Writes `database` and `index` as a versioned index container.
pub fn write_index<P: AsRef<Path>>(
    path: P,
    database: &ReferenceDatabase,
    index: &ClassificationIndex,
) -> Result<(), IndexBuildError> {
    let payload = bincode::serialize(&IndexPayloadRef {
        database,
        k: index.k as u8,
        primer_k: index.primer_k as u8,
        coarse: &index.coarse,
        fine: &index.fine,
        primers: &index.primers,
    })?;

    let mut out = BufWriter::new(File::create(path.as_ref())?);
    out.write_all(INDEX_MAGIC)?;
    out.write_all(&INDEX_FORMAT_VERSION.to_le_bytes())?;
    out.write_all(&(payload.len() as u64).to_le_bytes())?;
    out.write_all(&payload)?;
    out.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
//  Builder
// ---------------------------------------------------------------------------

/// Assembles an index from known amplicon sequences. Used for test fixtures
/// and small custom panels; extracting amplicons from genomes is done elsewhere.
pub struct IndexBuilder {
    database: ReferenceDatabase,
    k: usize,
    primer_k: usize,
    false_positive_rate: f64,
    amplicons: Vec<(SpeciesIdx, MarkerIdx, Vec<u8>)>,
}

impl IndexBuilder {
    pub fn new(database: ReferenceDatabase, k: usize) -> Result<Self, IndexBuildError> {
        if !(1..=MAX_K).contains(&k) {
            return Err(IndexBuildError::InvalidK(k));
        }
        Ok(Self {
            database,
            k,
            primer_k: DEFAULT_PRIMER_K,
            false_positive_rate: DEFAULT_SKETCH_FPR,
            amplicons: Vec::new(),
        })
    }

    pub fn primer_k(mut self, primer_k: usize) -> Result<Self, IndexBuildError> {
        if !(1..=MAX_K).contains(&primer_k) {
            return Err(IndexBuildError::InvalidK(primer_k));
        }
        self.primer_k = primer_k;
        Ok(self)
    }

    pub fn false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }

    pub fn add_amplicon(
        &mut self,
        species_id: &str,
        marker_id: &str,
        sequence: &[u8],
    ) -> Result<&mut Self, IndexBuildError> {
        let species = self
            .database
            .species_index(species_id)
            .ok_or_else(|| IndexBuildError::UnknownSpecies(species_id.to_string()))?;
        let marker = self
            .database
            .marker_index(marker_id)
            .ok_or_else(|| IndexBuildError::UnknownMarker(marker_id.to_string()))?;
        if sequence.len() < self.k {
            return Err(IndexBuildError::AmpliconTooShort {
                species: species_id.to_string(),
                marker: marker_id.to_string(),
            });
        }
        self.amplicons.push((species, marker, sequence.to_vec()));
        Ok(self)
    }

    pub fn build(self) -> (ReferenceDatabase, ClassificationIndex) {
        let mut database = self.database;
        let n_species = database.species.len();
        let n_markers = database.markers.len();

        let mut fine_kmers: Vec<Vec<Vec<u64>>> = vec![vec![Vec::new(); n_species]; n_markers];
        for (species, marker, seq) in &self.amplicons {
            fine_kmers[*marker][*species].extend(kmer::CanonicalKmers::new(seq, self.k));
            if database.reference(*species, *marker).is_none() {
                database.refs.push(MarkerRef {
                    species: *species,
                    marker: *marker,
                    amplicon_len: seq.len() as u32,
                });
            }
        }
        let fine: Vec<Vec<KmerSet>> = fine_kmers
            .into_iter()
            .map(|row| row.into_iter().map(KmerSet::from_kmers).collect())
            .collect();
        database.refs.retain(|r| !fine[r.marker][r.species].is_empty());

        let coarse: Vec<BloomSketch> = (0..n_species)
            .map(|s| {
                let expected: usize = fine.iter().map(|row| row[s].len()).sum();
                let mut sketch = BloomSketch::with_capacity(expected, self.false_positive_rate);
                for row in &fine {
                    for kmer in row[s].iter() {
                        sketch.insert(kmer);
                    }
                }
                sketch
            })
            .collect();

        let shortest_primer = database
            .markers
            .iter()
            .flat_map(|m| [m.forward_primer.len(), m.reverse_primer.len()])
            .min()
            .unwrap_or(self.primer_k);
        let primer_k = self.primer_k.min(shortest_primer).max(1);
        let primers: Vec<KmerSet> = database
            .markers
            .iter()
            .map(|m| {
                KmerSet::from_kmers(
                    kmer::CanonicalKmers::new(m.forward_primer.as_bytes(), primer_k)
                        .chain(kmer::CanonicalKmers::new(m.reverse_primer.as_bytes(), primer_k)),
                )
            })
            .collect();

        log::debug!(
            "Built index: {} species x {} markers, k={}, primer_k={}",
            n_species,
            n_markers,
            self.k,
            primer_k
        );

        let index = ClassificationIndex {
            k: self.k,
            primer_k,
            coarse,
            fine,
            primers,
        };
        (database, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{fixture_amplicon, fixture_db, fixture_index};

    #[test]
    fn test_bloom_has_no_false_negatives() {
        let mut sketch = BloomSketch::with_capacity(1_000, 0.01);
        for x in 0..1_000u64 {
            sketch.insert(x * 7919);
        }
        assert!((0..1_000u64).all(|x| sketch.contains(x * 7919)));
        let false_hits = (1_000_000..1_010_000u64).filter(|&x| sketch.contains(x)).count();
        // 1% target; allow generous slack
        assert!(false_hits < 500, "false positive count {}", false_hits);
    }

    #[test]
    fn test_fine_and_coarse_queries() {
        let (_db, index) = fixture_index();
        assert_eq!(index.species_count(), 3);
        assert_eq!(index.marker_count(), 2);

        let pig_cytb = fixture_amplicon(1, 0);
        let kmer = kmer::canonical_kmers(&pig_cytb[100..100 + DEFAULT_K], DEFAULT_K)[0];
        assert!(index.fine_match(0, 1, kmer));
        assert!(!index.fine_match(1, 1, kmer));
        assert!(!index.fine_match(7, 1, kmer));
        assert!(index.coarse_candidates(kmer).contains(&1));
        assert!(index.has_reference(0, 1));
    }

    #[test]
    fn test_primer_kmers_are_indexed() {
        let (db, index) = fixture_index();
        let fwd = db.markers[1].forward_primer.as_bytes();
        let pk = index.primer_k();
        let first = kmer::canonical_kmers(&fwd[..pk], pk)[0];
        assert!(index.primer_match(1, first));
        assert!(!index.primer_match(0, first));
    }

    #[test]
    fn test_write_then_load_splits_database_and_index() {
        let (db, index) = fixture_index();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.idx");
        write_index(&path, &db, &index).unwrap();

        let (db2, index2) = load_index(&path).unwrap();
        assert_eq!(db2, db);
        assert_eq!(index2.k(), index.k());
        assert_eq!(index2.primer_k(), index.primer_k());
        assert_eq!(index2.fine_set(0, 1), index.fine_set(0, 1));
        assert_eq!(db2.refs.len(), 6);
    }

    #[test]
    fn test_load_failures_are_classified() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("nope.idx");
        assert!(matches!(load_index(&missing), Err(IndexLoadError::Missing(_))));

        let junk = dir.path().join("junk.idx");
        fs::write(&junk, b"not an index at all").unwrap();
        assert!(matches!(load_index(&junk), Err(IndexLoadError::BadMagic(_))));

        let (db, index) = fixture_index();
        let good = dir.path().join("good.idx");
        write_index(&good, &db, &index).unwrap();
        let bytes = fs::read(&good).unwrap();

        let mut wrong_version = bytes.clone();
        wrong_version[8..12].copy_from_slice(&99u32.to_le_bytes());
        let p = dir.path().join("v99.idx");
        fs::write(&p, &wrong_version).unwrap();
        assert!(matches!(
            load_index(&p),
            Err(IndexLoadError::VersionMismatch { found: 99, expected: 1 })
        ));

        let p = dir.path().join("short.idx");
        fs::write(&p, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(load_index(&p), Err(IndexLoadError::Truncated { .. })));

        let mut garbled = bytes.clone();
        for b in garbled[HEADER_LEN..HEADER_LEN + 16].iter_mut() {
            *b = 0xFF;
        }
        let p = dir.path().join("garbled.idx");
        fs::write(&p, &garbled).unwrap();
        assert!(matches!(load_index(&p), Err(IndexLoadError::Corrupt(_))));
    }

    #[test]
    fn test_load_rejects_bad_database_values() {
        let dir = tempfile::tempdir().unwrap();
        let (mut db, index) = fixture_index();
        db.species[0].mito_copy_number = 0.0;
        let p = dir.path().join("zero_cn.idx");
        write_index(&p, &db, &index).unwrap();
        match load_index(&p) {
            Err(IndexLoadError::Corrupt(msg)) => assert!(msg.contains("copy number"), "{}", msg),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(crate::refdb::ReferenceDatabase::load(&p).is_err());

        let (mut db, index) = fixture_index();
        db.refs.pop();
        let p = dir.path().join("missing_ref.idx");
        write_index(&p, &db, &index).unwrap();
        assert!(matches!(load_index(&p), Err(IndexLoadError::Corrupt(_))));
    }

    #[test]
    fn test_incomplete_panel_keeps_only_built_references() {
        let mut builder = IndexBuilder::new(fixture_db(), DEFAULT_K).unwrap();
        for (s, id) in ["Bos_taurus", "Sus_scrofa", "Gallus_gallus"].iter().enumerate() {
            builder.add_amplicon(id, "cytb", &fixture_amplicon(s, 0)).unwrap();
        }
        builder.add_amplicon("Bos_taurus", "coi", &fixture_amplicon(0, 1)).unwrap();
        let (db, index) = builder.build();
        assert_eq!(db.refs.len(), 4);
        assert!(db.reference(2, 1).is_none());
        assert!(!index.has_reference(1, 2));

        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("partial.idx");
        write_index(&p, &db, &index).unwrap();
        let (db2, _) = load_index(&p).unwrap();
        assert_eq!(db2.coverage(), vec![true, true, true, false, true, false]);
    }

    #[test]
    fn test_builder_rejects_unknown_names() {
        let (db, _) = fixture_index();
        let mut builder = IndexBuilder::new(db, DEFAULT_K).unwrap();
        assert!(matches!(
            builder.add_amplicon("Felis_catus", "cytb", &fixture_amplicon(0, 0)),
            Err(IndexBuildError::UnknownSpecies(_))
        ));
        assert!(matches!(
            builder.add_amplicon("Bos_taurus", "cytb", b"ACGT"),
            Err(IndexBuildError::AmpliconTooShort { .. })
        ));
        assert!(IndexBuilder::new(ReferenceDatabase::default(), 40).is_err());
    }
}
