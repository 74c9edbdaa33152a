//! Interfaces consumed by the peer engine
//!
//! The address manager, object manager and object store live outside the
//! per-peer engine; peers only hold these handles. The server injects real
//! implementations, tests inject mocks.

use anyhow::Result;
use std::sync::Arc;

use crate::network::peer::Peer;
use crate::network::protocol::{InvHash, InvMessage, NetAddress, ObjectMessage};

/// The node's view of all known network addresses and their quality.
pub trait AddressManager: Send + Sync {
    /// The local address best suited for advertising to the given remote.
    fn best_local_address(&self, remote: &NetAddress) -> NetAddress;

    /// Whether the address is reachable from the public network.
    fn is_routable(&self, na: &NetAddress) -> bool;

    /// Mark the address as known good.
    fn good(&self, na: &NetAddress);

    /// Record a connection attempt to the address.
    fn attempt(&self, na: &NetAddress);

    /// Record that the address is currently connected and working.
    fn connected(&self, na: &NetAddress);

    /// Add a single address learned from `src`.
    fn add_address(&self, na: &NetAddress, src: &NetAddress);

    /// Add a batch of addresses learned from `src`. Deduplication, limits
    /// and last-seen updates are the manager's business.
    fn add_addresses(&self, addresses: &[NetAddress], src: &NetAddress);

    /// Resolve a host and port into a structured address.
    fn host_to_net_address(
        &self,
        host: &str,
        port: u16,
        stream: u32,
        services: u64,
    ) -> Result<NetAddress>;

    /// A snapshot of addresses worth advertising to peers.
    fn address_cache(&self) -> Vec<NetAddress>;
}

/// Plans inventory requests and validates and stores objects.
pub trait ObjectManager: Send + Sync {
    /// A peer finished its handshake and can serve requests.
    fn new_peer(&self, peer: &Arc<Peer>);

    /// A peer that previously completed its handshake is gone.
    fn done_peer(&self, peer: &Arc<Peer>);

    /// Inventory advertised by a peer, for request planning.
    fn queue_inv(&self, msg: InvMessage, peer: &Arc<Peer>);

    /// A solicited object arrived and is ready for validation.
    fn handle_object(&self, msg: ObjectMessage);
}

/// Read access to the node's object database.
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's encoded form by its inventory hash.
    fn fetch_object_by_hash(&self, hash: &InvHash) -> Result<Vec<u8>>;

    /// Sample up to `count` random inventory hashes matching `filter`.
    fn fetch_random_inv_hashes(&self, count: usize, filter: &dyn Fn(&InvHash) -> bool)
        -> Vec<InvHash>;
}
