//src/refdb.rs

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseLoadError;
use crate::index::INDEX_MAGIC;
use crate::types::{HalalStatus, MarkerIdx, SpeciesIdx};

fn is_plain_dna(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b"ACGTacgt".contains(&b))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    /// Latin binomial with underscores, e.g. `Sus_scrofa`.
    pub id: String,
    pub common_name: String,
    pub status: HalalStatus,
    /// Mitochondrial genome copies per cell; divides raw read shares.
    pub mito_copy_number: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub forward_primer: String,
    pub reverse_primer: String,
}

/// Reference amplicon for one (species, marker) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRef {
    pub species: SpeciesIdx,
    pub marker: MarkerIdx,
    pub amplicon_len: u32,
}

/// Static species/marker metadata. Read-only once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDatabase {
    pub species: Vec<Species>,
    pub markers: Vec<Marker>,
    pub refs: Vec<MarkerRef>,
}

impl ReferenceDatabase {
    pub fn species_index(&self, id: &str) -> Option<SpeciesIdx> {
        self.species.iter().position(|s| s.id == id)
    }

    pub fn marker_index(&self, id: &str) -> Option<MarkerIdx> {
        self.markers.iter().position(|m| m.id == id)
    }

    pub fn reference(&self, species: SpeciesIdx, marker: MarkerIdx) -> Option<&MarkerRef> {
        self.refs
            .iter()
            .find(|r| r.species == species && r.marker == marker)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} species, {} markers, {} references",
            self.species.len(),
            self.markers.len(),
            self.refs.len()
        )
    }

    /// Loads a database from its text form, or the database half of an index file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseLoadError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DatabaseLoadError::Missing(path.to_path_buf()),
            _ => DatabaseLoadError::Io(e),
        })?;

        let mut magic = [0u8; 8];
        let is_index = match file.read_exact(&mut magic) {
            Ok(()) => &magic == INDEX_MAGIC,
            Err(_) => false,
        };
        if is_index {
            let (db, _index) = crate::index::load_index(path)?;
            return Ok(db);
        }

        let file = File::open(path)?;
        Self::parse_tsv(BufReader::new(file))
    }

    /// Parses the tab-separated text form:
    /// ```text
    /// S  <species_id>  <common_name>  <status>  <mito_copy_number>
    /// M  <marker_id>   <forward_primer>  <reverse_primer>
    /// R  <species_id>  <marker_id>  <amplicon_len>
    /// ```
    /// Blank lines and lines starting with `#` are skipped.
    pub fn parse_tsv<R: BufRead>(reader: R) -> Result<Self, DatabaseLoadError> {
        let mut db = ReferenceDatabase::default();
        let mut species_ids: AHashMap<String, SpeciesIdx> = AHashMap::new();
        let mut marker_ids: AHashMap<String, MarkerIdx> = AHashMap::new();
        // References may precede the species/markers they name.
        let mut pending_refs: Vec<(usize, String, String, u32)> = Vec::new();

        for (line_no, line_result) in reader.lines().enumerate() {
            let line_no = line_no + 1;
            let line = line_result?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = trimmed.split('\t').map(str::trim).collect();
            let parse_err = |reason: String| DatabaseLoadError::Parse { line: line_no, reason };

            match parts[0] {
                "S" => {
                    if parts.len() != 5 {
                        return Err(parse_err(format!("species record needs 5 fields, found {}", parts.len())));
                    }
                    let status = HalalStatus::from_word(parts[3])
                        .ok_or_else(|| parse_err(format!("unknown status '{}'", parts[3])))?;
                    let mito_copy_number: f64 = parts[4]
                        .parse()
                        .map_err(|_| parse_err(format!("bad copy number '{}'", parts[4])))?;
                    if !(mito_copy_number > 0.0 && mito_copy_number.is_finite()) {
                        return Err(parse_err(format!("copy number must be positive, found {}", parts[4])));
                    }
                    if species_ids.contains_key(parts[1]) {
                        return Err(parse_err(format!("duplicate species '{}'", parts[1])));
                    }
                    species_ids.insert(parts[1].to_string(), db.species.len());
                    db.species.push(Species {
                        id: parts[1].to_string(),
                        common_name: parts[2].to_string(),
                        status,
                        mito_copy_number,
                    });
                }
                "M" => {
                    if parts.len() != 4 {
                        return Err(parse_err(format!("marker record needs 4 fields, found {}", parts.len())));
                    }
                    for primer in &parts[2..4] {
                        if !is_plain_dna(primer) {
                            return Err(parse_err(format!("primer '{}' is not plain ACGT", primer)));
                        }
                    }
                    if marker_ids.contains_key(parts[1]) {
                        return Err(parse_err(format!("duplicate marker '{}'", parts[1])));
                    }
                    marker_ids.insert(parts[1].to_string(), db.markers.len());
                    db.markers.push(Marker {
                        id: parts[1].to_string(),
                        forward_primer: parts[2].to_ascii_uppercase(),
                        reverse_primer: parts[3].to_ascii_uppercase(),
                    });
                }
                "R" => {
                    if parts.len() != 4 {
                        return Err(parse_err(format!("reference record needs 4 fields, found {}", parts.len())));
                    }
                    let amplicon_len: u32 = parts[3]
                        .parse()
                        .map_err(|_| parse_err(format!("bad amplicon length '{}'", parts[3])))?;
                    pending_refs.push((line_no, parts[1].to_string(), parts[2].to_string(), amplicon_len));
                }
                other => return Err(parse_err(format!("unknown record tag '{}'", other))),
            }
        }

        for (line, species, marker, amplicon_len) in pending_refs {
            let species = *species_ids.get(&species).ok_or_else(|| DatabaseLoadError::Parse {
                line,
                reason: format!("reference names unknown species '{}'", species),
            })?;
            let marker = *marker_ids.get(&marker).ok_or_else(|| DatabaseLoadError::Parse {
                line,
                reason: format!("reference names unknown marker '{}'", marker),
            })?;
            db.refs.push(MarkerRef {
                species,
                marker,
                amplicon_len,
            });
        }

        db.validate()?;
        Ok(db)
    }

    /// Checks shared by the text loader and the index loader.
    pub fn validate(&self) -> Result<(), DatabaseLoadError> {
        let invalid = |msg: String| Err(DatabaseLoadError::Invalid(msg));
        if self.species.is_empty() {
            return invalid("no species defined".into());
        }
        if self.markers.is_empty() {
            return invalid("no markers defined".into());
        }

        let mut species_ids: AHashSet<&str> = AHashSet::new();
        for s in &self.species {
            if !species_ids.insert(&s.id) {
                return invalid(format!("duplicate species '{}'", s.id));
            }
            if !(s.mito_copy_number > 0.0 && s.mito_copy_number.is_finite()) {
                return invalid(format!(
                    "species '{}' copy number must be positive, found {}",
                    s.id, s.mito_copy_number
                ));
            }
        }

        let mut marker_ids: AHashSet<&str> = AHashSet::new();
        for m in &self.markers {
            if !marker_ids.insert(&m.id) {
                return invalid(format!("duplicate marker '{}'", m.id));
            }
            for primer in [&m.forward_primer, &m.reverse_primer] {
                if !is_plain_dna(primer) {
                    return invalid(format!("marker '{}' primer '{}' is not plain ACGT", m.id, primer));
                }
            }
        }

        let mut pairs: AHashSet<(SpeciesIdx, MarkerIdx)> = AHashSet::new();
        for r in &self.refs {
            if r.species >= self.species.len() || r.marker >= self.markers.len() {
                return invalid(format!("reference ({}, {}) out of range", r.species, r.marker));
            }
            if !pairs.insert((r.species, r.marker)) {
                return invalid(format!(
                    "duplicate reference for {} / {}",
                    self.species[r.species].id, self.markers[r.marker].id
                ));
            }
        }
        Ok(())
    }

    /// Row-major `[species][marker]` flags: true where a reference amplicon exists.
    pub fn coverage(&self) -> Vec<bool> {
        let n_markers = self.markers.len();
        let mut mask = vec![false; self.species.len() * n_markers];
        for r in &self.refs {
            if let Some(cell) = mask.get_mut(r.species * n_markers + r.marker) {
                *cell = true;
            }
        }
        mask
    }
}
