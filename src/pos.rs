//! # Proof-of-Space
//!
//! Storage-backed Sybil resistance for the join handshake. A peer commits
//! disk space by generating a **plot**: N records
//! `(index: u64, hash = SHA256("<hex64(peer_id)>_<index>"))`, stored sorted
//! by hash as a packed array of 40-byte records. To prove possession, the
//! server samples a T-bit prefix and the prover must return any plot entry
//! whose hash starts with it — a binary search on the sorted file, O(log N)
//! reads, no full scan.
//!
//! ## Generation
//!
//! The plot is built with an external merge sort so memory stays bounded by
//! one chunk: entries are generated and sorted 50,000 at a time into temp
//! files, then k-way merged into the final file. A correctly-sized existing
//! plot is reused across restarts; the file name embeds the first 8 bytes of
//! the owning peer id.
//!
//! ## Security tunables
//!
//! With T = 16 the expected brute-force cost of answering a challenge
//! without a plot is ~65,536 hashes, which modern hardware computes well
//! inside the server's 5-second proof deadline — the deterrent is not the
//! single challenge but the requirement to keep the O(N·40 B) artifact
//! available across repeated admissions. Deployments wanting a harder gate
//! raise `prefix_bits` and N together and shrink the proof deadline; all
//! three live in [`PosParams`](crate::config::PosParams).
//!
//! With N = 400,000 and T = 16 a plot answers ~99.78% of challenges; a miss
//! is legal and surfaces as [`PosError::NoProof`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{PosParams, PLOT_ENTRY_BYTES};
use crate::identity::PeerId;
use crate::messages::{PosChallengePayload, PosProofPayload};

/// Subdirectory of the data directory that holds plots and temp chunks.
pub const PLOT_DIR_NAME: &str = "plots";

/// Proof-of-space verification failures, in the order verification checks
/// them. The first failed check wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosError {
    /// The raw value is not `"<hex64>_<decimal>"`.
    Format,
    /// The raw value embeds a different peer id than expected.
    IdentityMismatch,
    /// SHA-256 of the raw value does not equal the proof's hash.
    HashMismatch,
    /// The hash does not start with the challenged prefix.
    PrefixMismatch,
    /// The plot holds no entry matching the challenge.
    NoProof,
}

impl std::fmt::Display for PosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PosError::Format => write!(f, "malformed proof value"),
            PosError::IdentityMismatch => write!(f, "proof bound to a different identity"),
            PosError::HashMismatch => write!(f, "hash does not match proof value"),
            PosError::PrefixMismatch => write!(f, "hash does not satisfy challenge prefix"),
            PosError::NoProof => write!(f, "no plot entry matches the challenge"),
        }
    }
}

impl std::error::Error for PosError {}

// ============================================================================
// Challenge
// ============================================================================

/// A T-bit prefix challenge. The prefix is MSB-aligned in `ceil(T/8)` bytes;
/// unused low bits of the final byte are zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub prefix_bits: u32,
    pub prefix: Vec<u8>,
}

impl Challenge {
    /// Sample a fresh random challenge of `bits` prefix bits.
    pub fn random(bits: u32) -> Self {
        let len = bits.div_ceil(8) as usize;
        let mut prefix = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut prefix);
        let rem = bits % 8;
        if rem != 0 {
            if let Some(last) = prefix.last_mut() {
                *last &= 0xFFu8 << (8 - rem);
            }
        }
        Self {
            prefix_bits: bits,
            prefix,
        }
    }

    /// Validate and adopt a challenge received over the wire.
    pub fn from_payload(payload: &PosChallengePayload) -> Result<Self, PosError> {
        if payload.prefix_bits == 0 || payload.prefix_bits > 256 {
            return Err(PosError::Format);
        }
        if payload.prefix.len() != payload.prefix_bits.div_ceil(8) as usize {
            return Err(PosError::Format);
        }
        Ok(Self {
            prefix_bits: payload.prefix_bits,
            prefix: payload.prefix.clone(),
        })
    }

    pub fn to_payload(&self) -> PosChallengePayload {
        PosChallengePayload {
            prefix_bits: self.prefix_bits,
            prefix: self.prefix.clone(),
        }
    }

    /// Whether the top T bits of `hash` equal this prefix. The final prefix
    /// byte is compared only over its significant high bits.
    pub fn matches(&self, hash: &[u8; 32]) -> bool {
        self.compare_prefix(hash) == Ordering::Equal
    }

    /// Order `hash`'s T-bit prefix against the challenge prefix, MSB-first.
    fn compare_prefix(&self, hash: &[u8; 32]) -> Ordering {
        let full = (self.prefix_bits / 8) as usize;
        let rem = self.prefix_bits % 8;
        match hash[..full].cmp(&self.prefix[..full]) {
            Ordering::Equal => {}
            other => return other,
        }
        if rem != 0 {
            let shift = 8 - rem;
            return (hash[full] >> shift).cmp(&(self.prefix[full] >> shift));
        }
        Ordering::Equal
    }
}

// ============================================================================
// Proof
// ============================================================================

/// A single plot entry presented as proof of storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    /// The hash preimage, `"<hex64(peer_id)>_<decimal(index)>"`.
    pub raw_value: String,
    pub index: u64,
    pub hash: [u8; 32],
}

impl Proof {
    pub fn from_payload(payload: &PosProofPayload) -> Self {
        Self {
            raw_value: payload.raw_value.clone(),
            index: payload.index,
            hash: payload.hash,
        }
    }

    pub fn to_payload(&self) -> PosProofPayload {
        PosProofPayload {
            raw_value: self.raw_value.clone(),
            index: self.index,
            hash: self.hash,
        }
    }
}

/// The canonical preimage for a plot entry.
pub fn raw_value(peer_id: &PeerId, index: u64) -> String {
    format!("{}_{}", peer_id.to_hex(), index)
}

/// `SHA256(raw_value(peer_id, index))`.
pub fn entry_hash(peer_id: &PeerId, index: u64) -> [u8; 32] {
    Sha256::digest(raw_value(peer_id, index).as_bytes()).into()
}

/// Verify a proof against a challenge for the expected peer.
///
/// Checks run in order: format, identity binding, hash integrity, prefix
/// satisfaction. The caller supplies the peer id it believes it is talking
/// to; a proof valid for any other identity fails.
pub fn verify(peer_id: &PeerId, challenge: &Challenge, proof: &Proof) -> Result<(), PosError> {
    let Some((hex_part, index_part)) = proof.raw_value.split_once('_') else {
        return Err(PosError::Format);
    };
    if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PosError::Format);
    }
    if index_part.is_empty() || index_part.parse::<u64>().is_err() {
        return Err(PosError::Format);
    }
    if hex_part != peer_id.to_hex() {
        return Err(PosError::IdentityMismatch);
    }
    let digest: [u8; 32] = Sha256::digest(proof.raw_value.as_bytes()).into();
    if digest != proof.hash {
        return Err(PosError::HashMismatch);
    }
    if !challenge.matches(&proof.hash) {
        return Err(PosError::PrefixMismatch);
    }
    Ok(())
}

// ============================================================================
// Plot
// ============================================================================

/// Handle to an on-disk plot. The file is read-only after generation, so the
/// handle is cheap to clone and safe to search from blocking tasks.
#[derive(Clone, Debug)]
pub struct Plot {
    peer_id: PeerId,
    path: PathBuf,
    entries: u64,
}

fn plot_file_name(peer_id: &PeerId) -> String {
    format!("plot_{}.dat", hex::encode(&peer_id.as_bytes()[..8]))
}

fn plot_path(peer_id: &PeerId, data_dir: &Path) -> PathBuf {
    data_dir.join(PLOT_DIR_NAME).join(plot_file_name(peer_id))
}

impl Plot {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Open an existing plot, failing if it is missing or wrongly sized.
    /// A size mismatch means a corrupt or foreign artifact; callers abort.
    pub fn load(peer_id: PeerId, data_dir: &Path, params: &PosParams) -> Result<Self> {
        let path = plot_path(&peer_id, data_dir);
        let expected = params.entries * PLOT_ENTRY_BYTES as u64;
        let metadata = fs::metadata(&path)
            .with_context(|| format!("plot file missing at {}", path.display()))?;
        ensure!(
            metadata.len() == expected,
            "plot file {} has size {} (expected {})",
            path.display(),
            metadata.len(),
            expected
        );
        Ok(Self {
            peer_id,
            path,
            entries: params.entries,
        })
    }

    /// Reuse a correctly-sized existing plot or generate a fresh one.
    ///
    /// Generation streams sorted chunks to temp files and k-way merges them;
    /// temp files are removed on success and on error, and a partial final
    /// file never survives a failed merge.
    pub fn generate_or_load(peer_id: PeerId, data_dir: &Path, params: &PosParams) -> Result<Self> {
        let dir = data_dir.join(PLOT_DIR_NAME);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating plot directory {}", dir.display()))?;
        let path = dir.join(plot_file_name(&peer_id));
        let expected = params.entries * PLOT_ENTRY_BYTES as u64;

        if let Ok(metadata) = fs::metadata(&path) {
            if metadata.len() == expected {
                info!(path = %path.display(), "reusing existing plot");
                return Ok(Self {
                    peer_id,
                    path,
                    entries: params.entries,
                });
            }
            warn!(
                path = %path.display(),
                size = metadata.len(),
                expected,
                "plot file has wrong size, regenerating"
            );
            fs::remove_file(&path)
                .with_context(|| format!("removing stale plot {}", path.display()))?;
        }

        info!(
            entries = params.entries,
            size_mb = expected / (1024 * 1024),
            "generating proof-of-space plot"
        );

        let mut chunk_paths = Vec::new();
        let generated = write_sorted_chunks(&peer_id, &path, params, &mut chunk_paths);
        let result = generated.and_then(|()| merge_chunks(&chunk_paths, &path));

        for chunk in &chunk_paths {
            let _ = fs::remove_file(chunk);
        }
        if result.is_err() {
            let _ = fs::remove_file(&path);
        }
        result?;

        info!(path = %path.display(), "plot generation complete");
        Ok(Self {
            peer_id,
            path,
            entries: params.entries,
        })
    }

    /// Find any entry whose hash starts with the challenged prefix: a lower
    /// bound binary search on the T-bit prefix, then a check of the first
    /// candidate (the file is sorted, so if that one does not match, none
    /// does). Returns `None` when the plot cannot answer this challenge.
    pub fn search(&self, challenge: &Challenge) -> Result<Option<Proof>> {
        let mut file = File::open(&self.path)
            .with_context(|| format!("opening plot {}", self.path.display()))?;

        let mut lo = 0u64;
        let mut hi = self.entries;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (_, hash) = read_entry_at(&mut file, mid)?;
            if challenge.compare_prefix(&hash) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo < self.entries {
            let (index, hash) = read_entry_at(&mut file, lo)?;
            if challenge.matches(&hash) {
                debug!(index, probes = self.entries.ilog2() + 1, "plot search hit");
                return Ok(Some(Proof {
                    raw_value: raw_value(&self.peer_id, index),
                    index,
                    hash,
                }));
            }
        }
        Ok(None)
    }
}

/// Generate the plot's entries in bounded-memory chunks, each sorted by hash
/// and persisted as a packed temp file next to the final plot.
fn write_sorted_chunks(
    peer_id: &PeerId,
    plot_path: &Path,
    params: &PosParams,
    chunk_paths: &mut Vec<PathBuf>,
) -> Result<()> {
    let mut start = 0u64;
    let mut chunk_no = 0usize;
    while start < params.entries {
        let count = params.chunk_entries.min(params.entries - start);
        let mut entries: Vec<(u64, [u8; 32])> = (start..start + count)
            .map(|index| (index, entry_hash(peer_id, index)))
            .collect();
        entries.sort_unstable_by(|a, b| a.1.cmp(&b.1));

        let chunk_path = plot_path.with_extension(format!("chunk{chunk_no}.tmp"));
        let file = File::create(&chunk_path)
            .with_context(|| format!("creating chunk file {}", chunk_path.display()))?;
        chunk_paths.push(chunk_path);
        let mut writer = BufWriter::new(file);
        for (index, hash) in &entries {
            writer.write_all(&index.to_le_bytes())?;
            writer.write_all(hash)?;
        }
        writer.flush()?;

        debug!(
            chunk = chunk_no,
            generated = start + count,
            total = params.entries,
            "plot chunk sorted"
        );
        start += count;
        chunk_no += 1;
    }
    Ok(())
}

/// K-way merge of the sorted chunk files into the final plot file.
fn merge_chunks(chunk_paths: &[PathBuf], plot_path: &Path) -> Result<()> {
    let mut readers = Vec::with_capacity(chunk_paths.len());
    for chunk in chunk_paths {
        let file =
            File::open(chunk).with_context(|| format!("opening chunk {}", chunk.display()))?;
        readers.push(BufReader::new(file));
    }

    // Min-heap ordered by (hash, index, slot); slot breaks exact ties.
    let mut heap = BinaryHeap::new();
    for (slot, reader) in readers.iter_mut().enumerate() {
        if let Some((index, hash)) = read_record(reader)? {
            heap.push(std::cmp::Reverse((hash, index, slot)));
        }
    }

    let file = File::create(plot_path)
        .with_context(|| format!("creating plot file {}", plot_path.display()))?;
    let mut writer = BufWriter::new(file);
    while let Some(std::cmp::Reverse((hash, index, slot))) = heap.pop() {
        writer.write_all(&index.to_le_bytes())?;
        writer.write_all(&hash)?;
        if let Some((next_index, next_hash)) = read_record(&mut readers[slot])? {
            heap.push(std::cmp::Reverse((next_hash, next_index, slot)));
        }
    }
    writer.flush()?;
    Ok(())
}

/// Read one packed record, distinguishing clean EOF from truncation.
fn read_record(reader: &mut impl Read) -> Result<Option<(u64, [u8; 32])>> {
    let mut buf = [0u8; PLOT_ENTRY_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            anyhow::bail!("truncated plot record");
        }
        filled += n;
    }
    Ok(Some(parse_record(&buf)))
}

/// Random-access read of record `index` in a plot file.
fn read_entry_at(file: &mut File, index: u64) -> Result<(u64, [u8; 32])> {
    file.seek(SeekFrom::Start(index * PLOT_ENTRY_BYTES as u64))?;
    let mut buf = [0u8; PLOT_ENTRY_BYTES];
    file.read_exact(&mut buf)?;
    Ok(parse_record(&buf))
}

fn parse_record(buf: &[u8; PLOT_ENTRY_BYTES]) -> (u64, [u8; 32]) {
    let index = u64::from_le_bytes(buf[..8].try_into().expect("record index slice"));
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&buf[8..]);
    (index, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_params() -> PosParams {
        PosParams {
            entries: 4096,
            chunk_entries: 1000,
            prefix_bits: 12,
            proof_timeout: Duration::from_secs(5),
        }
    }

    fn test_peer() -> PeerId {
        PeerId::for_key(b"plot-owner")
    }

    fn read_all_records(plot: &Plot) -> Vec<(u64, [u8; 32])> {
        let mut file = File::open(plot.path()).unwrap();
        let mut reader = BufReader::new(&mut file);
        let mut records = Vec::new();
        while let Some(record) = read_record(&mut reader).unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn generated_plot_is_sorted_complete_and_correct() {
        let dir = tempfile::tempdir().unwrap();
        let params = test_params();
        let peer = test_peer();

        let plot = Plot::generate_or_load(peer, dir.path(), &params).unwrap();
        assert_eq!(
            fs::metadata(plot.path()).unwrap().len(),
            params.entries * PLOT_ENTRY_BYTES as u64
        );

        let records = read_all_records(&plot);
        assert_eq!(records.len() as u64, params.entries);

        let mut seen_indices: Vec<u64> = records.iter().map(|(i, _)| *i).collect();
        seen_indices.sort_unstable();
        assert_eq!(seen_indices, (0..params.entries).collect::<Vec<_>>());

        for window in records.windows(2) {
            assert!(window[0].1 <= window[1].1, "plot not sorted by hash");
        }
        for (index, hash) in records.iter().take(64) {
            assert_eq!(*hash, entry_hash(&peer, *index));
        }

        // No leftover temp chunks.
        let plots_dir = dir.path().join(PLOT_DIR_NAME);
        for entry in fs::read_dir(&plots_dir).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                name.to_string_lossy().ends_with(".dat"),
                "leftover temp file {name:?}"
            );
        }
    }

    #[test]
    fn existing_plot_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let params = test_params();
        let peer = test_peer();

        let plot = Plot::generate_or_load(peer, dir.path(), &params).unwrap();
        let before = fs::read(plot.path()).unwrap();

        let again = Plot::generate_or_load(peer, dir.path(), &params).unwrap();
        assert_eq!(fs::read(again.path()).unwrap(), before);
    }

    #[test]
    fn wrong_size_plot_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let params = test_params();
        let peer = test_peer();

        let plot = Plot::generate_or_load(peer, dir.path(), &params).unwrap();
        fs::write(plot.path(), b"junk").unwrap();

        let again = Plot::generate_or_load(peer, dir.path(), &params).unwrap();
        assert_eq!(
            fs::metadata(again.path()).unwrap().len(),
            params.entries * PLOT_ENTRY_BYTES as u64
        );
    }

    #[test]
    fn load_rejects_missing_or_missized_plot() {
        let dir = tempfile::tempdir().unwrap();
        let params = test_params();
        let peer = test_peer();

        assert!(Plot::load(peer, dir.path(), &params).is_err());

        let plot = Plot::generate_or_load(peer, dir.path(), &params).unwrap();
        assert!(Plot::load(peer, dir.path(), &params).is_ok());

        fs::write(plot.path(), b"short").unwrap();
        assert!(Plot::load(peer, dir.path(), &params).is_err());
    }

    #[test]
    fn search_then_verify_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let params = test_params();
        let peer = test_peer();
        let plot = Plot::generate_or_load(peer, dir.path(), &params).unwrap();

        // Build a challenge from a known entry so a match must exist.
        let hash = entry_hash(&peer, 137);
        let challenge = Challenge {
            prefix_bits: params.prefix_bits,
            prefix: vec![hash[0], hash[1] & 0xF0],
        };

        let proof = plot.search(&challenge).unwrap().expect("entry must match");
        assert!(challenge.matches(&proof.hash));
        assert_eq!(proof.hash, entry_hash(&peer, proof.index));
        verify(&peer, &challenge, &proof).unwrap();
    }

    #[test]
    fn search_misses_when_no_prefix_present() {
        let dir = tempfile::tempdir().unwrap();
        let params = PosParams {
            entries: 2,
            chunk_entries: 2,
            prefix_bits: 16,
            proof_timeout: Duration::from_secs(5),
        };
        let peer = test_peer();
        let plot = Plot::generate_or_load(peer, dir.path(), &params).unwrap();

        // A prefix adjacent to entry 0's, guaranteed absent in a 2-entry plot
        // unless both entries collide on it (retry with the other entry).
        for index in 0..2 {
            let hash = entry_hash(&peer, index);
            let flipped = [hash[0], hash[1] ^ 0x01];
            let challenge = Challenge {
                prefix_bits: 16,
                prefix: flipped.to_vec(),
            };
            let other = entry_hash(&peer, 1 - index);
            if challenge.matches(&other) {
                continue;
            }
            assert!(plot.search(&challenge).unwrap().is_none());
            return;
        }
        panic!("both entries collided with the flipped prefix");
    }

    #[test]
    fn verify_rejects_tampered_hash() {
        let peer = test_peer();
        let hash = entry_hash(&peer, 42);
        let challenge = Challenge {
            prefix_bits: 16,
            prefix: vec![hash[0], hash[1]],
        };
        let mut proof = Proof {
            raw_value: raw_value(&peer, 42),
            index: 42,
            hash,
        };
        verify(&peer, &challenge, &proof).unwrap();

        proof.hash[5] ^= 0x01;
        assert_eq!(
            verify(&peer, &challenge, &proof),
            Err(PosError::HashMismatch)
        );
    }

    #[test]
    fn verify_rejects_wrong_identity() {
        let peer = test_peer();
        let other = PeerId::for_key(b"someone-else");
        let hash = entry_hash(&peer, 42);
        let challenge = Challenge {
            prefix_bits: 16,
            prefix: vec![hash[0], hash[1]],
        };
        let proof = Proof {
            raw_value: raw_value(&peer, 42),
            index: 42,
            hash,
        };
        assert_eq!(
            verify(&other, &challenge, &proof),
            Err(PosError::IdentityMismatch)
        );
    }

    #[test]
    fn verify_rejects_malformed_raw_values() {
        let peer = test_peer();
        let challenge = Challenge::random(16);
        let make = |raw: &str| Proof {
            raw_value: raw.to_string(),
            index: 0,
            hash: [0u8; 32],
        };

        assert_eq!(
            verify(&peer, &challenge, &make("no-separator")),
            Err(PosError::Format)
        );
        assert_eq!(
            verify(&peer, &challenge, &make("abcd_12")),
            Err(PosError::Format)
        );
        let valid_hex = peer.to_hex();
        assert_eq!(
            verify(&peer, &challenge, &make(&format!("{valid_hex}_"))),
            Err(PosError::Format)
        );
        assert_eq!(
            verify(&peer, &challenge, &make(&format!("{valid_hex}_12x"))),
            Err(PosError::Format)
        );
    }

    #[test]
    fn verify_rejects_prefix_mismatch() {
        let peer = test_peer();
        let hash = entry_hash(&peer, 7);
        let mut prefix = vec![hash[0], hash[1]];
        prefix[1] ^= 0x01;
        let challenge = Challenge {
            prefix_bits: 16,
            prefix,
        };
        let proof = Proof {
            raw_value: raw_value(&peer, 7),
            index: 7,
            hash,
        };
        assert_eq!(
            verify(&peer, &challenge, &proof),
            Err(PosError::PrefixMismatch)
        );
    }

    #[test]
    fn partial_byte_prefix_comparison() {
        // T = 12: second byte compared only on its high nibble.
        let challenge = Challenge {
            prefix_bits: 12,
            prefix: vec![0xAB, 0xC0],
        };
        let mut hash = [0u8; 32];
        hash[0] = 0xAB;

        hash[1] = 0xC0;
        assert!(challenge.matches(&hash));
        hash[1] = 0xCF; // low nibble differs, still a match
        assert!(challenge.matches(&hash));
        hash[1] = 0xD0;
        assert!(!challenge.matches(&hash));
        hash[0] = 0xAC;
        hash[1] = 0xC0;
        assert!(!challenge.matches(&hash));
    }

    #[test]
    fn random_challenge_shape() {
        for bits in [1u32, 7, 8, 12, 16, 17] {
            let challenge = Challenge::random(bits);
            assert_eq!(challenge.prefix.len(), bits.div_ceil(8) as usize);
            let rem = bits % 8;
            if rem != 0 {
                let mask = 0xFFu8 >> rem;
                assert_eq!(challenge.prefix.last().unwrap() & mask, 0);
            }
        }
    }

    #[test]
    fn challenge_payload_validation() {
        let good = PosChallengePayload {
            prefix_bits: 12,
            prefix: vec![0xAA, 0xB0],
        };
        assert!(Challenge::from_payload(&good).is_ok());

        let short = PosChallengePayload {
            prefix_bits: 16,
            prefix: vec![0xAA],
        };
        assert_eq!(Challenge::from_payload(&short), Err(PosError::Format));

        let zero = PosChallengePayload {
            prefix_bits: 0,
            prefix: vec![],
        };
        assert_eq!(Challenge::from_payload(&zero), Err(PosError::Format));
    }
}
