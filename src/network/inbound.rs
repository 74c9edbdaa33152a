//! Inbound message dispatch
//!
//! Reads framed messages off the transport, enforces handshake gating,
//! dispatches by message kind and drives the inactivity watchdog. Peers must
//! complete the initial version negotiation within a shorter window than the
//! general idle timeout; after the handshake the watchdog relaxes.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::network::peer::Peer;
use crate::network::protocol::{
    unix_time, AddrMessage, GetDataMessage, InvMessage, InvVect, Message, NetAddress,
    ObjectMessage, VersionMessage, MAX_INV_PER_MSG,
};

impl Peer {
    /// Handle all incoming messages for the peer. Runs as its own task.
    pub(crate) async fn dispatch_loop(self: Arc<Self>) {
        let Some(conn) = self.connection().cloned() else {
            // Started without a transport; nothing to read.
            self.disconnect();
            let _ = self.ctx.done_peers.send(Arc::clone(&self));
            return;
        };

        let mut deadline = Instant::now() + self.ctx.config.negotiate_timeout();

        while !self.disconnected() {
            let msg = tokio::select! {
                _ = self.quit.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Peer {} idle, disconnecting", self);
                    self.disconnect();
                    break;
                }
                result = conn.read_message() => match result {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Read from {} failed: {}", self, e);
                        break;
                    }
                },
            };

            self.stats.lock().bytes_read = conn.bytes_read();

            let handled = if !self.handshake_complete() {
                // Only the handshake itself is legal before the handshake is
                // done.
                match msg {
                    Message::Version(version) => {
                        self.handle_version(&version).await;
                        true
                    }
                    Message::VerAck => {
                        self.handle_verack().await;
                        true
                    }
                    other => {
                        warn!(
                            "Received {} from {} before handshake",
                            other.command(),
                            self
                        );
                        self.disconnect();
                        false
                    }
                }
            } else {
                match msg {
                    Message::Version(version) => {
                        self.handle_version(&version).await;
                        true
                    }
                    Message::VerAck => true,
                    Message::Addr(addr) => {
                        self.handle_addr(&addr);
                        true
                    }
                    Message::Inv(inv) => {
                        self.handle_inv(inv);
                        true
                    }
                    Message::GetData(getdata) => {
                        self.handle_getdata(&getdata).await;
                        true
                    }
                    Message::Object(object) => {
                        self.handle_object(object);
                        true
                    }
                }
            };

            // Mark the address as currently connected and working as of now
            // if one of the messages that trigger it was processed.
            if handled && !self.disconnected() {
                if let Some(na) = self.net_address() {
                    self.ctx.addr_manager.connected(&na);
                }
                self.reset_retry_count();
            }

            deadline = Instant::now()
                + if self.handshake_complete() {
                    self.ctx.config.idle_timeout()
                } else {
                    self.ctx.config.negotiate_timeout()
                };
        }

        // Ensure the connection is closed and notify the server that this
        // peer is done.
        self.disconnect();

        // Only tell the object manager we are gone if it ever saw us.
        if self.handshake_complete() {
            self.ctx.object_manager.done_peer(&self);
        }

        let _ = self.ctx.done_peers.send(Arc::clone(&self));
    }

    /// Negotiate the protocol version and kick off the handshake effects.
    async fn handle_version(&self, msg: &VersionMessage) {
        // A nonce matching our own means we connected to ourselves.
        if msg.nonce == self.ctx.nonce {
            debug!("Disconnecting self connection {}", self);
            self.disconnect();
            return;
        }

        {
            let mut stats = self.stats.lock();

            // Limit to one version message per peer.
            if stats.version_known {
                drop(stats);
                warn!("Only one version message per peer is allowed {}", self);
                self.disconnect();
                return;
            }
            stats.version_known = true;

            // Take over what the remote end advertised about itself.
            stats.services = msg.services;
            stats.user_agent = msg.user_agent.clone();
        }

        // Inbound connections.
        if self.is_inbound() {
            // Set up a net address for the peer from the socket. Outbound
            // peers set this up at connection time, so there is no point
            // recomputing. Only the first stream number is used because
            // bitmessage has only one stream.
            let Some(stream) = msg.streams.first().copied() else {
                warn!("Version from {} advertises no streams", self);
                self.disconnect();
                return;
            };
            let Some(conn) = self.connection() else {
                self.disconnect();
                return;
            };
            let na = NetAddress::from_socket_addr(conn.remote_addr(), stream, msg.services);
            *self.net_address.lock() = Some(na);

            // Answer with our own version.
            if let Err(e) = self.push_version().await {
                warn!("Can't send version message to {}: {}", self, e);
                self.disconnect();
                return;
            }
        }

        self.queue_message(Message::VerAck, None).await;
        self.update_addresses(msg).await;
        self.handle_initial_connection().await;
    }

    /// Update the address manager with what the version exchange taught us.
    async fn update_addresses(&self, msg: &VersionMessage) {
        let Some(na) = self.net_address() else {
            return;
        };

        if !self.is_inbound() {
            // Advertise the local address that best matches this peer, if it
            // is reachable at all.
            let local = self.ctx.addr_manager.best_local_address(&na);
            if self.ctx.addr_manager.is_routable(&local) {
                self.push_addr(std::slice::from_ref(&local)).await;
            }

            // Mark the address as a known good address.
            self.ctx.addr_manager.good(&na);
        } else {
            // A peer might not be advertising the address it actually
            // connected from, NAT being one reason. Only feed the address
            // manager when the two agree.
            if msg.addr_from.key() == na.key() {
                self.ctx.addr_manager.add_address(&na, &na);
                self.ctx.addr_manager.good(&na);
            }
        }
    }

    /// Record the remote acknowledgement of our version.
    async fn handle_verack(&self) {
        // A verack before we sent a version is a protocol violation.
        if !self.version_sent() {
            self.disconnect();
            return;
        }

        self.stats.lock().verack_received = true;
        self.handle_initial_connection().await;
    }

    /// Runs once both sides of the handshake have been observed: marks the
    /// handshake complete, introduces the peer to the object manager, and
    /// sends the bootstrap addr and inv messages.
    async fn handle_initial_connection(&self) {
        {
            let mut stats = self.stats.lock();
            if !(stats.version_known && stats.verack_received) {
                return;
            }
            if stats.handshake_complete {
                return;
            }
            stats.handshake_complete = true;
        }
        debug!("Handshake complete with {}", self);

        // Signal the object manager that a new peer has been connected.
        self.ctx.object_manager.new_peer(&self.arc());

        // Send a big addr message.
        self.push_addr(&self.ctx.addr_manager.address_cache()).await;

        // Send a big inv message.
        let hashes = self
            .ctx
            .store
            .fetch_random_inv_hashes(MAX_INV_PER_MSG, &|_| true);
        let inventory: Vec<InvVect> = hashes.into_iter().map(|hash| InvVect { hash }).collect();
        self.push_inv(&inventory).await;
    }

    /// Record advertised inventory and pass it on for request planning.
    fn handle_inv(&self, msg: InvMessage) {
        // Disconnect if the message is too big.
        if msg.inventory.len() > MAX_INV_PER_MSG {
            warn!(
                "Peer {} sent inv with {} entries",
                self,
                msg.inventory.len()
            );
            self.disconnect();
            return;
        }

        for inv in &msg.inventory {
            self.add_known_inventory(*inv);
        }

        self.ctx.object_manager.queue_inv(msg, &self.arc());
    }

    /// Serve a getdata request from the object store.
    ///
    /// Fetches pipeline shallowly: every third send carries a signal that
    /// the next fetch waits on, so we never queue far more data than we can
    /// write in reasonable time. The final send carries an explicit signal
    /// that is awaited before returning, so the idle watchdog cannot fire
    /// while a large batch is still going out.
    async fn handle_getdata(&self, msg: &GetDataMessage) {
        if msg.inventory.is_empty() {
            return;
        }

        let (final_tx, final_rx) = oneshot::channel();
        let mut final_tx = Some(final_tx);
        let mut wait: Option<oneshot::Receiver<()>> = None;
        let count = msg.inventory.len();

        for (i, inv) in msg.inventory.iter().enumerate() {
            let (done, next_wait) = if i == count - 1 {
                (final_tx.take(), None)
            } else if (i + 1) % 3 == 0 {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            // A miss is recoverable: log it and keep serving the batch. The
            // final entry's signal fires inside push_object even on a miss,
            // so the wait below cannot hang.
            if let Err(e) = self.push_object(&inv.hash, done, wait.take()).await {
                debug!(
                    "Unable to fetch object {} for {}: {}",
                    hex::encode(inv.hash),
                    self,
                    e
                );
            }
            wait = next_wait;
        }

        // Sending this much data can keep the peer busy for a decent amount
        // of time and nothing else is processed for them meanwhile; block
        // until the last message is out so we know when to expect a reply.
        let _ = final_rx.await;
    }

    /// An object arrived; reject it unless it answers an outstanding
    /// getdata, then hand it to the object manager.
    fn handle_object(&self, msg: ObjectMessage) {
        let Ok(hash) = msg.inv_hash() else {
            return;
        };

        // Disconnect the peer if the object was not requested.
        if self.requested_objects.lock().remove(&hash).is_none() {
            warn!("Peer {} sent unrequested {} object", self, msg.kind());
            self.disconnect();
            return;
        }

        self.ctx.object_manager.handle_object(msg);
    }

    /// Record advertised addresses and pass them to the address manager.
    fn handle_addr(&self, msg: &AddrMessage) {
        // A message that has no addresses is invalid.
        if msg.addresses.is_empty() {
            warn!("Addr message from {} contains no addresses", self);
            self.disconnect();
            return;
        }

        let now = unix_time();
        let mut addresses = Vec::with_capacity(msg.addresses.len());
        {
            let mut known = self.known_addresses.lock();
            for na in &msg.addresses {
                // Don't add more addresses if we're disconnecting.
                if self.disconnected() {
                    return;
                }

                let mut na = na.clone();
                // Clamp timestamps from the future to 5 days in the past so
                // these entries are the first to go when the address manager
                // needs space.
                if na.timestamp > now + 10 * 60 {
                    na.timestamp = now - 5 * 24 * 60 * 60;
                }

                known.insert(na.key());
                addresses.push(na);
            }
        }

        // The address manager handles the details: duplicate suppression,
        // size limits and last-seen updates.
        let Some(src) = self.net_address() else {
            return;
        };
        self.ctx.addr_manager.add_addresses(&addresses, &src);
    }
}
