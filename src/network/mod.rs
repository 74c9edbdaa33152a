//! Network layer for bmd-node
//!
//! This module provides the per-peer protocol engine: handshake
//! negotiation, inbound dispatch, outbound queueing with inventory
//! trickling, and the peer lifecycle. The transport carries frames, and the
//! address manager, object manager and object store are consumed through
//! the traits in [`traits`]; the server wires everything together through a
//! [`peer::ServerContext`].

pub mod inbound;
pub mod inventory;
pub mod outbound;
pub mod peer;
pub mod protocol;
pub mod traits;
pub mod transport;

pub use inventory::MruInventorySet;
pub use peer::{OutMessage, Peer, PeerStats, ServerContext};
pub use protocol::{
    InvHash, InvMessage, InvVect, Message, NetAddress, ObjectKind, ObjectMessage, WireError,
};
pub use traits::{AddressManager, ObjectManager, ObjectStore};
pub use transport::{Connection, Dialer, TcpConnection, TcpDialer};
