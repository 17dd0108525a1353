//! # Ulak - Distributed Hash Table with Proof-of-Space Admission
//!
//! Ulak is a Kademlia-style DHT node that applications use as a pointer
//! service (e.g. file-hash → storage-server URL), hardened with two
//! admission extensions:
//!
//! - **Identity binding**: a peer's id is `SHA256(public_key || SALT)`, and
//!   joining requires signing a fresh nonce with the matching P-256 key
//! - **Proof-of-Space**: joiners must answer a prefix challenge from a
//!   precomputed on-disk plot, making bulk identity minting cost real disk
//!
//! ## Architecture
//!
//! Components are wired through capability traits, never back-pointers: the
//! transport dispatches inbound requests to handler capabilities, and the
//! DHT core reaches the network through the [`protocols::DhtRpc`] trait (so
//! the lookup engine runs against a mock in tests).
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `config` | Process-wide constants, runtime configuration |
//! | `identity` | P-256 keypairs, peer-id derivation, contacts |
//! | `messages` | JSON wire envelope and payload types |
//! | `transport` | UDP datagrams, rpc-id correlation, dispatch |
//! | `dht` | Routing table, storage, lookups, republication |
//! | `admission` | Join handshake state machines |
//! | `pos` | Plot generation, prefix search, verification |
//! | `protocols` | Capability trait definitions |

pub mod admission;
pub mod config;
pub mod dht;
pub mod identity;
pub mod messages;
pub mod node;
pub mod pos;
pub mod protocols;
pub mod transport;

pub use admission::{JoinError, JoinRejection};
pub use config::{NodeConfig, PosParams};
pub use dht::{DhtStatus, LookupError, StoreReport};
pub use identity::{Contact, Keypair, PeerId};
pub use node::{Node, NodeStatus};
pub use pos::{Challenge, Plot, PosError, Proof};
