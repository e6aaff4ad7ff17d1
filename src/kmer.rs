//src/kmer.rs

/// Longest k-mer that fits a `u64` at two bits per base.
pub const MAX_K: usize = 32;

#[inline]
fn encode_base_2bit(b: u8) -> Option<u64> {
    match b {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

#[inline]
fn kmer_mask(k: usize) -> u64 {
    if k >= MAX_K {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    }
}

/// Reverse complement of a 2-bit packed k-mer of `k` bases.
pub fn reverse_complement(mut kmer: u64, k: usize) -> u64 {
    // Reverse the 2-bit groups, then complement and shift into place.
    kmer = ((kmer >> 2) & 0x3333333333333333) | ((kmer & 0x3333333333333333) << 2);
    kmer = ((kmer >> 4) & 0x0F0F0F0F0F0F0F0F) | ((kmer & 0x0F0F0F0F0F0F0F0F) << 4);
    kmer = ((kmer >> 8) & 0x00FF00FF00FF00FF) | ((kmer & 0x00FF00FF00FF00FF) << 8);
    kmer = ((kmer >> 16) & 0x0000FFFF0000FFFF) | ((kmer & 0x0000FFFF0000FFFF) << 16);
    kmer = (kmer >> 32) | (kmer << 32);
    (u64::MAX - kmer) >> (64 - 2 * k)
}

/// Lexicographically smaller of `(kmer, revcom(kmer))`.
#[inline]
pub fn canonical(kmer: u64, k: usize) -> u64 {
    kmer.min(reverse_complement(kmer, k))
}

/// Packs `seq` (exactly `k` bases) into a forward k-mer, or `None` on a non-ACGT base.
pub fn encode(seq: &[u8]) -> Option<u64> {
    if seq.is_empty() || seq.len() > MAX_K {
        return None;
    }
    seq.iter()
        .try_fold(0u64, |acc, &b| encode_base_2bit(b).map(|code| (acc << 2) | code))
}

/// Rolling iterator over the canonical k-mers of a sequence.
///
/// Both strands are updated incrementally. A non-ACGT base resets the window,
/// so no k-mer spanning it is produced.
pub struct CanonicalKmers<'a> {
    seq: &'a [u8],
    k: usize,
    pos: usize,
    fwd: u64,
    rev: u64,
    filled: usize,
    mask: u64,
    rev_shift: usize,
}

impl<'a> CanonicalKmers<'a> {
    pub fn new(seq: &'a [u8], k: usize) -> Self {
        debug_assert!((1..=MAX_K).contains(&k));
        Self {
            seq,
            k,
            pos: 0,
            fwd: 0,
            rev: 0,
            filled: 0,
            mask: kmer_mask(k),
            rev_shift: 2 * (k - 1),
        }
    }
}

impl Iterator for CanonicalKmers<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.pos < self.seq.len() {
            let b = self.seq[self.pos];
            self.pos += 1;
            match encode_base_2bit(b) {
                Some(code) => {
                    self.fwd = ((self.fwd << 2) | code) & self.mask;
                    self.rev = (self.rev >> 2) | ((3 - code) << self.rev_shift);
                    self.filled += 1;
                    if self.filled >= self.k {
                        return Some(self.fwd.min(self.rev));
                    }
                }
                None => {
                    self.fwd = 0;
                    self.rev = 0;
                    self.filled = 0;
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.seq.len() - self.pos;
        let upper = (remaining + self.filled.min(self.k - 1)).saturating_sub(self.k - 1);
        (0, Some(upper))
    }
}

/// Convenience wrapper collecting the canonical k-mers of `seq`.
pub fn canonical_kmers(seq: &[u8], k: usize) -> Vec<u64> {
    if seq.len() < k {
        return Vec::new();
    }
    CanonicalKmers::new(seq, k).collect()
}
