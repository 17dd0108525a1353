//! # Identity and Peer-ID Algebra
//!
//! This module defines the cryptographic identity types used throughout the
//! overlay:
//!
//! - [`Keypair`]: ECDSA P-256 signing keypair, persisted as PKCS#8 PEM
//! - [`PeerId`]: 256-bit identifier derived from the public key
//! - [`Contact`]: a remote peer's addressable record (id + endpoint)
//!
//! ## Identity Model
//!
//! A peer's identity is bound to its key material:
//! `peer_id = SHA256(sec1_public_key || SALT)`. Any peer can verify the
//! binding by recomputing the derivation from a presented public key, which
//! is the basis of the join handshake's Sybil check.
//!
//! Application keys live in the same 256-bit space: [`PeerId::for_key`]
//! hashes arbitrary bytes with SHA-256.
//!
//! ## Distance
//!
//! The only distance operations the rest of the system may assume:
//! [`PeerId::xor_distance`], [`PeerId::prefix_len`] (leading equal bits,
//! 0..=256) and unsigned lexicographic ordering ([`distance_cmp`]).
//!
//! ## Signatures
//!
//! Messages are hashed with SHA-256 and signed with ECDSA; signatures travel
//! as ASN.1 DER. Verification works from raw SEC1 public-key bytes so the
//! handshake can verify before trusting anything about the sender.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::SALT;

/// Length of the random nonce used in signature challenges, in bytes.
/// Rendered as hex, so the wire form is twice this many characters.
pub const NONCE_BYTES: usize = 32;

/// File name of the persisted private key inside the data directory.
pub const KEY_FILE_NAME: &str = "private_key.pem";

/// Returns current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// PeerId (256-bit identifier, shared by peers and keys)
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the id for an application key: SHA-256 of the raw bytes.
    pub fn for_key(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(digest.into())
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits this id shares with `other`, in `0..=256`.
    pub fn prefix_len(&self, other: &PeerId) -> usize {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let x = a ^ b;
            if x != 0 {
                return i * 8 + x.leading_zeros() as usize;
            }
        }
        256
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compare two XOR distances as unsigned 256-bit integers.
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

// ============================================================================
// Key derivation and signatures
// ============================================================================

/// Derive a peer id from SEC1-encoded public key bytes.
pub fn derive_peer_id(public_key_sec1: &[u8]) -> PeerId {
    let mut hasher = Sha256::new();
    hasher.update(public_key_sec1);
    hasher.update(SALT.as_bytes());
    PeerId(hasher.finalize().into())
}

/// Check that a presented public key derives the claimed peer id.
pub fn check_peer_id(public_key_sec1: &[u8], claimed: &PeerId) -> bool {
    derive_peer_id(public_key_sec1) == *claimed
}

/// Verify an ASN.1 DER ECDSA signature over `message` with raw SEC1 public
/// key bytes. Any parse failure counts as an invalid signature.
pub fn verify_signature(public_key_sec1: &[u8], message: &[u8], signature_der: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_sec1_bytes(public_key_sec1) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(signature_der) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Generate a fresh challenge nonce: 32 bytes of OS randomness, hex encoded.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Identity self-check failures. These are fatal at startup: a node whose
/// key material disagrees with its claimed id must not serve traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    /// The public key does not derive the claimed peer id.
    IdMismatch,
    /// A fresh sign/verify round trip with our own key failed.
    SignatureRoundTrip,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::IdMismatch => {
                write!(f, "public key does not derive the claimed peer id")
            }
            IdentityError::SignatureRoundTrip => {
                write!(f, "self sign/verify round trip failed")
            }
        }
    }
}

impl std::error::Error for IdentityError {}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// SEC1 uncompressed encoding of the public key. This is the byte string
    /// that peer-id derivation and the join handshake operate on.
    pub fn public_key_sec1(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn peer_id(&self) -> PeerId {
        derive_peer_id(&self.public_key_sec1())
    }

    /// Sign a message: SHA-256 digest, ECDSA P-256, ASN.1 DER encoding.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_der().as_bytes().to_vec()
    }

    pub fn verify(&self, message: &[u8], signature_der: &[u8]) -> bool {
        verify_signature(&self.public_key_sec1(), message, signature_der)
    }

    /// Assert that this key derives `claimed` and that a sign/verify round
    /// trip on a fresh nonce succeeds. Callers terminate on failure.
    pub fn verify_identity(&self, claimed: PeerId) -> Result<(), IdentityError> {
        if !check_peer_id(&self.public_key_sec1(), &claimed) {
            return Err(IdentityError::IdMismatch);
        }
        let nonce = new_nonce();
        let signature = self.sign(nonce.as_bytes());
        if !self.verify(nonce.as_bytes(), &signature) {
            return Err(IdentityError::SignatureRoundTrip);
        }
        Ok(())
    }

    /// Load the key from `<data_dir>/private_key.pem`, or generate and
    /// persist a new one. Returns the keypair and whether it was generated.
    pub fn load_or_generate(data_dir: &Path) -> Result<(Self, bool)> {
        let path = key_file_path(data_dir);
        if path.exists() {
            let pem = std::fs::read_to_string(&path)
                .with_context(|| format!("reading private key at {}", path.display()))?;
            let signing_key = SigningKey::from_pkcs8_pem(&pem)
                .with_context(|| format!("parsing private key at {}", path.display()))?;
            let keypair = Self { signing_key };
            info!(
                peer = &keypair.peer_id().to_hex()[..16],
                "loaded existing identity"
            );
            return Ok((keypair, false));
        }

        let keypair = Self::generate();
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let pem = keypair
            .signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .context("encoding private key")?;
        std::fs::write(&path, pem.as_bytes())
            .with_context(|| format!("writing private key to {}", path.display()))?;
        info!(
            peer = &keypair.peer_id().to_hex()[..16],
            path = %path.display(),
            "generated new identity"
        );
        Ok((keypair, true))
    }
}

pub fn key_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(KEY_FILE_NAME)
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id().to_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Contact (remote peer's addressable record)
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
    /// Milliseconds since epoch when the contact was last refreshed.
    /// 0 for records received over the wire before local observation.
    #[serde(default)]
    pub last_seen_ms: u64,
}

impl Contact {
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            ip: addr.ip(),
            port: addr.port(),
            last_seen_ms: now_ms(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn touch(&mut self) {
        self.last_seen_ms = now_ms();
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_generation_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.peer_id(), b.peer_id());
        assert_ne!(a.public_key_sec1(), b.public_key_sec1());
    }

    #[test]
    fn peer_id_derivation_is_salted_sha256() {
        let kp = Keypair::generate();
        let public = kp.public_key_sec1();

        let mut hasher = Sha256::new();
        hasher.update(&public);
        hasher.update(SALT.as_bytes());
        let expected: [u8; 32] = hasher.finalize().into();

        assert_eq!(kp.peer_id().as_bytes(), &expected);
        assert!(check_peer_id(&public, &kp.peer_id()));
    }

    #[test]
    fn check_peer_id_rejects_foreign_key() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert!(!check_peer_id(&b.public_key_sec1(), &a.peer_id()));
    }

    #[test]
    fn check_peer_id_rejects_mutated_id() {
        let kp = Keypair::generate();
        for i in 0..32 {
            let mut bytes = *kp.peer_id().as_bytes();
            bytes[i] ^= 1;
            assert!(!check_peer_id(
                &kp.public_key_sec1(),
                &PeerId::from_bytes(bytes)
            ));
        }
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Keypair::generate();
        let message = b"challenge nonce";
        let signature = kp.sign(message);

        assert!(kp.verify(message, &signature));
        assert!(!kp.verify(b"different message", &signature));

        let other = Keypair::generate();
        assert!(!verify_signature(
            &other.public_key_sec1(),
            message,
            &signature
        ));
    }

    #[test]
    fn verify_signature_rejects_garbage() {
        let kp = Keypair::generate();
        assert!(!verify_signature(&kp.public_key_sec1(), b"msg", b"not-der"));
        assert!(!verify_signature(b"not-a-key", b"msg", &kp.sign(b"msg")));
    }

    #[test]
    fn verify_identity_holds_for_fresh_keypair() {
        let kp = Keypair::generate();
        assert!(kp.verify_identity(kp.peer_id()).is_ok());
    }

    #[test]
    fn verify_identity_rejects_mutated_id() {
        let kp = Keypair::generate();
        let mut bytes = *kp.peer_id().as_bytes();
        bytes[7] ^= 0x40;
        assert_eq!(
            kp.verify_identity(PeerId::from_bytes(bytes)),
            Err(IdentityError::IdMismatch)
        );
    }

    #[test]
    fn nonce_length_and_uniqueness() {
        let a = new_nonce();
        let b = new_nonce();
        assert_eq!(a.len(), NONCE_BYTES * 2);
        assert!(a.len() >= 32);
        assert_ne!(a, b);
    }

    #[test]
    fn xor_distance_properties() {
        let a = PeerId::from_bytes([0xAB; 32]);
        let b = PeerId::from_bytes([0x12; 32]);

        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xAB ^ 0x12; 32]);
    }

    #[test]
    fn prefix_len_counts_leading_equal_bits() {
        let a = PeerId::from_bytes([0u8; 32]);
        assert_eq!(a.prefix_len(&a), 256);

        let mut bytes = [0u8; 32];
        bytes[0] = 0x80;
        assert_eq!(a.prefix_len(&PeerId::from_bytes(bytes)), 0);

        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        assert_eq!(a.prefix_len(&PeerId::from_bytes(bytes)), 7);

        let mut bytes = [0u8; 32];
        bytes[2] = 0x10;
        assert_eq!(a.prefix_len(&PeerId::from_bytes(bytes)), 19);

        let mut bytes = [0u8; 32];
        bytes[31] = 0x01;
        assert_eq!(a.prefix_len(&PeerId::from_bytes(bytes)), 255);
    }

    #[test]
    fn distance_ordering_is_unsigned_lexicographic() {
        let mut lo = [0u8; 32];
        lo[0] = 0x01;
        let mut hi = [0u8; 32];
        hi[0] = 0x80;
        assert_eq!(distance_cmp(&lo, &hi), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&hi, &lo), std::cmp::Ordering::Greater);
        assert_eq!(distance_cmp(&lo, &lo), std::cmp::Ordering::Equal);
    }

    #[test]
    fn key_id_is_plain_sha256() {
        let id = PeerId::for_key(b"file-hash-42");
        let expected: [u8; 32] = Sha256::digest(b"file-hash-42").into();
        assert_eq!(id.as_bytes(), &expected);
    }

    #[test]
    fn hex_roundtrip() {
        let kp = Keypair::generate();
        let id = kp.peer_id();
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        let (first, generated) = Keypair::load_or_generate(dir.path()).unwrap();
        assert!(generated);
        assert!(key_file_path(dir.path()).exists());

        let (second, generated) = Keypair::load_or_generate(dir.path()).unwrap();
        assert!(!generated);
        assert_eq!(first.peer_id(), second.peer_id());

        let message = b"persistence check";
        assert!(second.verify(message, &first.sign(message)));
    }

    #[test]
    fn contact_equality_by_id() {
        let id = PeerId::from_bytes([3u8; 32]);
        let a = Contact::new(id, "127.0.0.1:8080".parse().unwrap());
        let b = Contact::new(id, "10.0.0.1:9000".parse().unwrap());
        assert_eq!(a, b);
        assert_eq!(a.addr(), "127.0.0.1:8080".parse().unwrap());
    }
}
