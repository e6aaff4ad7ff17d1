//! Shared fixtures for unit tests: a three-species, two-marker panel built
//! from deterministic synthetic amplicons.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::index::{write_index, ClassificationIndex, IndexBuilder, DEFAULT_K};
use crate::refdb::{Marker, MarkerRef, ReferenceDatabase, Species};
use crate::types::{HalalStatus, Read};

pub const AMPLICON_LEN: usize = 300;
pub const READ_LEN: usize = 100;

/// Deterministic pseudo-random ACGT sequence.
pub fn synthetic_seq(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x2545F4914F6CDD1D) ^ 0x9E3779B97F4A7C15;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            b"ACGT"[(state >> 62) as usize]
        })
        .collect()
}

pub fn fixture_db() -> ReferenceDatabase {
    let species = |id: &str, name: &str, status, cn| Species {
        id: id.to_string(),
        common_name: name.to_string(),
        status,
        mito_copy_number: cn,
    };
    ReferenceDatabase {
        species: vec![
            species("Bos_taurus", "Beef (Cow)", HalalStatus::Halal, 1000.0),
            species("Sus_scrofa", "Pork (Pig)", HalalStatus::Haram, 2000.0),
            species("Gallus_gallus", "Chicken", HalalStatus::Halal, 1000.0),
        ],
        markers: vec![
            Marker {
                id: "cytb".into(),
                forward_primer: "CCATCCAACATCTCAGCATGATGAAA".into(),
                reverse_primer: "GCCCCTCAGAATGATATTTGTCCTCA".into(),
            },
            Marker {
                id: "coi".into(),
                forward_primer: "TTCTCAACTAACCACAAAGACATTGG".into(),
                reverse_primer: "TAGACTTCTGGGTGGCCAAAGAATCA".into(),
            },
        ],
        refs: (0..3)
            .flat_map(|species| (0..2).map(move |marker| (species, marker)))
            .map(|(species, marker)| MarkerRef {
                species,
                marker,
                amplicon_len: AMPLICON_LEN as u32,
            })
            .collect(),
    }
}

pub fn fixture_amplicon(species: usize, marker: usize) -> Vec<u8> {
    synthetic_seq(1 + (species as u64) * 16 + marker as u64, AMPLICON_LEN)
}

pub fn fixture_index() -> (ReferenceDatabase, ClassificationIndex) {
    let db = fixture_db();
    let names: Vec<(String, String)> = (0..db.species.len())
        .flat_map(|s| (0..db.markers.len()).map(move |m| (s, m)))
        .map(|(s, m)| (db.species[s].id.clone(), db.markers[m].id.clone()))
        .collect();
    let mut builder = IndexBuilder::new(db, DEFAULT_K).unwrap();
    for (i, (species_id, marker_id)) in names.iter().enumerate() {
        let (s, m) = (i / 2, i % 2);
        builder
            .add_amplicon(species_id, marker_id, &fixture_amplicon(s, m))
            .unwrap();
    }
    builder.build()
}

/// `n` reads of `READ_LEN` tiled across the (species, marker) amplicon.
pub fn fixture_reads(species: usize, marker: usize, n: usize) -> Vec<Read> {
    let amplicon = fixture_amplicon(species, marker);
    let span = AMPLICON_LEN - READ_LEN;
    (0..n)
        .map(|i| {
            let start = (i * 37) % span;
            Read::single(
                format!("s{}m{}r{}", species, marker, i),
                amplicon[start..start + READ_LEN].to_vec(),
            )
        })
        .collect()
}

/// Reads unrelated to any reference.
pub fn noise_reads(n: usize) -> Vec<Read> {
    (0..n)
        .map(|i| Read::single(format!("noise{}", i), synthetic_seq(10_000 + i as u64, READ_LEN)))
        .collect()
}

pub fn write_fixture_index(dir: &Path) -> PathBuf {
    let (db, index) = fixture_index();
    let path = dir.join("fixture.idx");
    write_index(&path, &db, &index).unwrap();
    path
}

fn fastq_text(reads: &[Read]) -> String {
    let mut text = String::new();
    for r in reads {
        let seq = String::from_utf8_lossy(&r.seq);
        text.push_str(&format!("@{}\n{}\n+\n{}\n", r.id, seq, "I".repeat(r.seq.len())));
    }
    text
}

pub fn write_fastq(path: &Path, reads: &[Read]) {
    fs::write(path, fastq_text(reads)).unwrap();
}

pub fn write_fastq_gz(path: &Path, reads: &[Read]) {
    let mut enc = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
    enc.write_all(fastq_text(reads).as_bytes()).unwrap();
    enc.finish().unwrap();
}

#[test]
fn test_fixture_amplicons_are_distinct() {
    let a = fixture_amplicon(0, 0);
    let b = fixture_amplicon(1, 0);
    assert_eq!(a.len(), AMPLICON_LEN);
    assert_ne!(a, b);
    assert_eq!(synthetic_seq(5, 50), synthetic_seq(5, 50));
}
