//! Process-wide protocol constants and runtime node configuration.
//!
//! Everything here is fixed at startup. The overlay parameters (`K`, `ALPHA`,
//! the timeout set) and the proof-of-space parameters (`PLOT_ENTRIES`,
//! `CHALLENGE_PREFIX_BITS`, `POS_PROOF_TIMEOUT`) must agree across all nodes
//! of a deployment; mixing parameter sets partitions the overlay.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Salt bound into peer-id derivation: `peer_id = SHA256(public_key || SALT)`.
/// Changing it creates a disjoint identity universe.
pub const SALT: &str = "dfss-ulak-bibliotheca";

/// Identifier width in bytes. Peers and keys share the same 256-bit space.
pub const ID_BYTES: usize = 32;

/// Identifier width in bits, and the number of routing buckets.
pub const ID_BITS: usize = 256;

/// Bucket capacity and replication set size.
pub const K: usize = 20;

/// Declared lookup concurrency. The lookup engine currently keeps one query
/// in flight; raising this is a local change to `Dht::node_lookup`.
pub const ALPHA: usize = 3;

/// Timeout for routine request/response RPCs (ping, find, store).
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for each step of the join handshake, on the joiner side.
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifetime of a server-side pending join challenge. Responses arriving
/// later are rejected as if no challenge had been issued.
pub const PENDING_CHALLENGE_TTL: Duration = Duration::from_secs(10);

/// Server-side deadline between issuing a space challenge and receiving the
/// proof. This is a security tunable: together with `CHALLENGE_PREFIX_BITS`
/// it bounds how much of the plot an attacker could compute on the fly
/// instead of storing. See `pos` module docs.
pub const POS_PROOF_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the per-key republication timer.
pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Number of entries in a proof-of-space plot (N). At 40 bytes per entry the
/// reference plot weighs 16 MB.
pub const PLOT_ENTRIES: u64 = 400_000;

/// Entries generated and sorted in memory per chunk during plot generation.
/// Bounds peak memory of the external merge sort.
pub const PLOT_CHUNK_ENTRIES: u64 = 50_000;

/// On-disk size of one plot record: u64 little-endian index + 32-byte hash.
pub const PLOT_ENTRY_BYTES: usize = 40;

/// Challenge prefix width in bits (T). With N = 400,000 the probability that
/// a plot contains a matching entry is ~99.78%; a miss is legal and the
/// server may re-challenge.
pub const CHALLENGE_PREFIX_BITS: u32 = 16;

/// Upper bound on a single datagram. Large enough for K contacts plus
/// framing; receive buffers are allocated at this size.
pub const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// Proof-of-space parameter set. Defaults mirror the process-wide constants;
/// tests shrink the plot to keep generation fast.
#[derive(Clone, Debug)]
pub struct PosParams {
    pub entries: u64,
    pub chunk_entries: u64,
    pub prefix_bits: u32,
    pub proof_timeout: Duration,
}

impl Default for PosParams {
    fn default() -> Self {
        Self {
            entries: PLOT_ENTRIES,
            chunk_entries: PLOT_CHUNK_ENTRIES,
            prefix_bits: CHALLENGE_PREFIX_BITS,
            proof_timeout: POS_PROOF_TIMEOUT,
        }
    }
}

/// Runtime configuration for a single node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// UDP bind address. Port 0 binds an ephemeral port.
    pub bind: SocketAddr,
    /// Directory holding the private key and the plot subdirectory.
    pub data_dir: PathBuf,
    /// Proof-of-space admission capability. `None` disables the space gate:
    /// joins complete after the signature challenge alone.
    pub pos: Option<PosParams>,
    /// Republication period. One configurable constant, per the protocol.
    pub republish_interval: Duration,
}

impl NodeConfig {
    pub fn new(bind: SocketAddr, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind,
            data_dir: data_dir.into(),
            pos: Some(PosParams::default()),
            republish_interval: REPUBLISH_INTERVAL,
        }
    }
}
