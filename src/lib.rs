//! bmd-node - Bitmessage peer protocol engine
//!
//! This crate provides the component of a Bitmessage node that owns a single
//! peer connection: it performs the version handshake, serializes inbound
//! and outbound messages, maintains per-peer knowledge of inventory and
//! addresses, and mediates requests between the remote endpoint and the
//! node's object and address managers.
//!
//! ## Design Principles
//!
//! 1. **Three tasks per peer**: inbound dispatcher, outbound queue
//!    multiplexer, and a single writer; producers never block on a busy peer
//! 2. **Injected collaborators**: the address manager, object manager and
//!    object store are traits; the peer core has no process-global state
//! 3. **One-shot lifecycle**: start and disconnect are idempotent, and every
//!    queued completion signal fires exactly once, even across shutdown

pub mod config;
pub mod network;

pub use config::NetworkConfig;
pub use network::peer::{Peer, PeerStats, ServerContext};
pub use network::protocol::{InvHash, InvVect, Message, NetAddress};
pub use network::traits::{AddressManager, ObjectManager, ObjectStore};
pub use network::transport::{Connection, Dialer, TcpConnection, TcpDialer};
