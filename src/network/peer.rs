//! Peer connection management
//!
//! One `Peer` per connection. The overall data flow is split across three
//! tasks: the inbound dispatcher reads and handles messages, the queue
//! multiplexer accepts outbound traffic from any producer without blocking
//! it, and the writer serializes one message at a time to the transport.
//! `queue_message` is the path for all outbound messages; `queue_inventory`
//! only relays inventory, which is trickled to the peer in batches. The
//! push helpers build protocol messages and enqueue them through
//! `queue_message`.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::NetworkConfig;
use crate::network::inventory::MruInventorySet;
use crate::network::protocol::{
    unix_time, user_agent, AddrMessage, GetDataMessage, InvHash, InvMessage, InvVect, Message,
    NetAddress, ObjectMessage, VersionMessage, DEFAULT_STREAM_LIST, MAX_ADDR_PER_MSG,
    MAX_INV_PER_MSG, MAX_PROTOCOL_VERSION, SERVICE_NODE_NETWORK,
};
use crate::network::traits::{AddressManager, ObjectManager, ObjectStore};
use crate::network::transport::{Connection, Dialer};

/// Process-wide collaborators and settings shared by every peer.
///
/// The server owns its peers; peers hold only this context, so no reference
/// cycle forms between the two.
pub struct ServerContext {
    /// Nonce advertised in our version messages; a peer echoing it back is
    /// ourselves.
    pub nonce: u64,
    pub addr_manager: Arc<dyn AddressManager>,
    pub object_manager: Arc<dyn ObjectManager>,
    pub store: Arc<dyn ObjectStore>,
    pub dialer: Arc<dyn Dialer>,
    /// Finished peers report here for the server to reap.
    pub done_peers: mpsc::UnboundedSender<Arc<Peer>>,
    /// Base interval for outbound retry backoff.
    pub retry_interval: Duration,
    pub config: NetworkConfig,
}

/// An outbound message paired with an optional completion signal.
///
/// The signal fires exactly once over the peer's lifetime: when the message
/// is written, when it is drained during shutdown, or when the send is
/// rejected because the peer is already disconnected.
pub struct OutMessage {
    pub msg: Message,
    pub done: Option<oneshot::Sender<()>>,
}

impl OutMessage {
    /// Deliver the completion signal, if any.
    pub fn complete(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

/// Peer statistics, including the handshake flags.
///
/// All four flags are monotonic; none is ever cleared.
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    pub version_sent: bool,
    pub version_known: bool,
    pub verack_received: bool,
    pub handshake_complete: bool,
    pub protocol_version: u32,
    pub services: u64,
    pub user_agent: String,
    pub time_connected: Option<SystemTime>,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// A single peer connection and its protocol state.
pub struct Peer {
    pub(crate) ctx: Arc<ServerContext>,
    me: Weak<Peer>,

    addr: String,
    inbound: bool,
    persistent: bool,

    conn: OnceLock<Arc<dyn Connection>>,
    pub(crate) net_address: Mutex<Option<NetAddress>>,

    started: AtomicU32,
    connected: AtomicU32,
    disconnect: AtomicU32,
    retry_count: AtomicU64,
    pub(crate) quit: CancellationToken,

    pub(crate) stats: Mutex<PeerStats>,
    known_inventory: Mutex<MruInventorySet>,
    pub(crate) known_addresses: Mutex<HashSet<String>>,
    pub(crate) requested_objects: Mutex<HashMap<InvHash, SystemTime>>,
    continue_hash: Mutex<Option<InvHash>>,

    output_tx: mpsc::Sender<OutMessage>,
    output_rx: Mutex<Option<mpsc::Receiver<OutMessage>>>,
    inv_tx: mpsc::Sender<InvVect>,
    inv_rx: Mutex<Option<mpsc::Receiver<InvVect>>>,
}

impl Peer {
    fn new_base(
        ctx: Arc<ServerContext>,
        me: Weak<Peer>,
        addr: String,
        inbound: bool,
        persistent: bool,
    ) -> Peer {
        let config = &ctx.config;
        let (output_tx, output_rx) = mpsc::channel(config.output_buffer_size);
        let (inv_tx, inv_rx) = mpsc::channel(config.output_buffer_size);
        let known_inventory = MruInventorySet::new(config.max_known_inventory);

        Peer {
            me,
            addr,
            inbound,
            persistent,
            conn: OnceLock::new(),
            net_address: Mutex::new(None),
            started: AtomicU32::new(0),
            connected: AtomicU32::new(0),
            disconnect: AtomicU32::new(0),
            retry_count: AtomicU64::new(0),
            quit: CancellationToken::new(),
            stats: Mutex::new(PeerStats {
                protocol_version: MAX_PROTOCOL_VERSION,
                services: SERVICE_NODE_NETWORK,
                ..PeerStats::default()
            }),
            known_inventory: Mutex::new(known_inventory),
            known_addresses: Mutex::new(HashSet::new()),
            requested_objects: Mutex::new(HashMap::new()),
            continue_hash: Mutex::new(None),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            inv_tx,
            inv_rx: Mutex::new(Some(inv_rx)),
            ctx,
        }
    }

    /// Create a peer for an accepted connection. Use `start` to begin
    /// processing incoming and outgoing messages.
    pub fn new_inbound(ctx: Arc<ServerContext>, conn: Arc<dyn Connection>) -> Arc<Peer> {
        let addr = conn.remote_addr().to_string();
        let peer = Arc::new_cyclic(|me| Self::new_base(ctx, me.clone(), addr, true, false));

        let _ = peer.conn.set(conn);
        peer.stats.lock().time_connected = Some(SystemTime::now());
        peer.connected.fetch_add(1, Ordering::SeqCst);
        peer
    }

    /// Create a peer for the given address and connect to it asynchronously.
    /// If the connection succeeds the peer is also started; if it fails the
    /// peer is reported done and the server decides whether to retry.
    pub fn new_outbound(
        ctx: Arc<ServerContext>,
        addr: &str,
        persistent: bool,
        retry_count: u64,
        stream: u32,
    ) -> Result<Arc<Peer>> {
        // Fill in a provisional address with faked-up service flags now; it
        // is replaced with the real one after version negotiation. The peer
        // must carry a valid net address before the dialer task forks off.
        let (host, port_str) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("invalid peer address {}", addr))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow!("invalid port in peer address {}", addr))?;
        let na = ctx.addr_manager.host_to_net_address(host, port, stream, 0)?;

        let peer = Arc::new_cyclic(|me| {
            Self::new_base(ctx.clone(), me.clone(), addr.to_string(), false, persistent)
        });
        *peer.net_address.lock() = Some(na);
        peer.retry_count.store(retry_count, Ordering::SeqCst);

        let dial_peer = Arc::clone(&peer);
        tokio::spawn(dial_peer.dial_and_start());

        Ok(peer)
    }

    /// Dial the remote end, respecting disconnect and retry backoff, then
    /// start the peer.
    async fn dial_and_start(self: Arc<Self>) {
        if self.disconnected() {
            return;
        }

        let retry_count = self.retry_count();
        if retry_count > 0 {
            let backoff = self.ctx.retry_interval * retry_count as u32 / 2;
            debug!("Retrying {} in {:?}", self.addr, backoff);
            tokio::time::sleep(backoff).await;
            if self.disconnected() {
                return;
            }
        }

        match self.ctx.dialer.dial(&self.addr).await {
            Err(e) => {
                debug!("Failed to connect to {}: {}", self.addr, e);
                let _ = self.ctx.done_peers.send(Arc::clone(&self));
            }
            Ok(conn) => {
                // The server may have scheduled a shutdown while we slept or
                // dialed; if so, ditch the connection immediately.
                if self.disconnected() {
                    return;
                }

                self.stats.lock().time_connected = Some(SystemTime::now());
                if let Some(na) = self.net_address() {
                    self.ctx.addr_manager.attempt(&na);
                }

                let _ = self.conn.set(conn);
                self.connected.fetch_add(1, Ordering::SeqCst);

                if let Err(e) = self.start().await {
                    debug!("Failed to start peer {}: {}", self, e);
                }
            }
        }
    }

    /// Begin processing input and output messages. Also sends the initial
    /// version message for outbound connections to start the negotiation.
    /// Idempotent; fails only if the initial version push fails.
    pub async fn start(&self) -> Result<()> {
        // Already started?
        if self.started.fetch_add(1, Ordering::SeqCst) != 0 {
            return Ok(());
        }

        // An outbound connection speaks first.
        if !self.inbound {
            if let Err(e) = self.push_version().await {
                error!("Can't send outbound version message to {}: {}", self, e);
                self.disconnect();
                return Err(e);
            }
        }

        let output_rx = self.output_rx.lock().take();
        let inv_rx = self.inv_rx.lock().take();
        let (Some(output_rx), Some(inv_rx)) = (output_rx, inv_rx) else {
            return Err(anyhow!("peer {} already started", self));
        };

        // The hand-off slot and its completion signal connect the
        // multiplexer to the writer; both are single-entry.
        let (send_tx, send_rx) = mpsc::channel(1);
        let (send_done_tx, send_done_rx) = mpsc::channel(1);

        let this = self.arc();
        tokio::spawn(Arc::clone(&this).dispatch_loop());
        tokio::spawn(Arc::clone(&this).queue_loop(output_rx, inv_rx, send_tx, send_done_rx));
        tokio::spawn(this.write_loop(send_rx, send_done_tx));

        Ok(())
    }

    /// Disconnect the peer by closing the connection and broadcasting the
    /// quit signal. Idempotent.
    pub fn disconnect(&self) {
        // Did we win the race?
        if self.disconnect.fetch_add(1, Ordering::SeqCst) != 0 {
            return;
        }

        debug!("Disconnecting peer {}", self);
        self.quit.cancel();
        if self.connected.load(Ordering::SeqCst) != 0 {
            if let Some(conn) = self.conn.get() {
                conn.close();
            }
        }
    }

    /// Gracefully shut down the peer.
    pub fn shutdown(&self) {
        self.disconnect();
    }

    /// Whether the peer is currently connected.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) != 0 && self.disconnect.load(Ordering::SeqCst) == 0
    }

    /// Whether disconnect has been requested.
    pub fn disconnected(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst) != 0
    }

    /// Add the message to the peer send queue. If the peer is already
    /// disconnected the message is dropped and its completion signal fires
    /// immediately, so no caller is left waiting.
    pub async fn queue_message(&self, msg: Message, done: Option<oneshot::Sender<()>>) {
        let out = OutMessage { msg, done };

        // The queue handler sticks around until it knows the peer is marked
        // disconnected and then drains its channels, so an enqueued message
        // always gets its signal. A message for a dead peer is rejected here
        // instead.
        if !self.connected() {
            out.complete();
            return;
        }

        if let Err(rejected) = self.output_tx.send(out).await {
            rejected.0.complete();
        }
    }

    /// Add the inventory to the trickle queue. Inventory the peer is already
    /// known to have is ignored; so is everything once the peer disconnects.
    pub async fn queue_inventory(&self, inv: InvVect) {
        if self.is_known_inventory(&inv) {
            return;
        }

        if !self.connected() {
            return;
        }

        let _ = self.inv_tx.send(inv).await;
    }

    /// Whether the peer is known to have the passed inventory.
    pub fn is_known_inventory(&self, inv: &InvVect) -> bool {
        self.known_inventory.lock().contains(inv)
    }

    /// Record that the peer has the passed inventory.
    pub fn add_known_inventory(&self, inv: InvVect) {
        self.known_inventory.lock().insert(inv);
    }

    /// Send a version message built from the current state.
    pub async fn push_version(&self) -> Result<()> {
        let Some(na) = self.net_address() else {
            return Err(anyhow!("no net address for peer {}", self));
        };

        let addr_from = self.ctx.addr_manager.best_local_address(&na);
        let mut addr_recv = na;
        addr_recv.services = SERVICE_NODE_NETWORK;

        let msg = VersionMessage {
            version: MAX_PROTOCOL_VERSION,
            services: SERVICE_NODE_NETWORK,
            timestamp: unix_time(),
            addr_recv,
            addr_from,
            nonce: self.ctx.nonce,
            user_agent: user_agent(),
            streams: DEFAULT_STREAM_LIST.to_vec(),
        };

        self.queue_message(Message::Version(msg), None).await;
        self.stats.lock().version_sent = true;
        Ok(())
    }

    /// Request the given inventory from the peer, in getdata messages of up
    /// to `MAX_INV_PER_MSG` entries. Objects already requested and
    /// announcements this peer never made are skipped.
    pub async fn push_getdata(&self, inventory: &[InvVect]) {
        let now = SystemTime::now();
        let mut batch: Vec<InvVect> = Vec::new();

        for inv in inventory {
            if self.requested_objects.lock().contains_key(&inv.hash) {
                continue;
            }
            if !self.is_known_inventory(inv) {
                continue;
            }
            self.requested_objects.lock().insert(inv.hash, now);

            batch.push(*inv);
            if batch.len() == MAX_INV_PER_MSG {
                let inventory = std::mem::take(&mut batch);
                self.queue_message(Message::GetData(GetDataMessage { inventory }), None)
                    .await;
            }
        }

        if !batch.is_empty() {
            self.queue_message(Message::GetData(GetDataMessage { inventory: batch }), None)
                .await;
        }
    }

    /// Send an inv message, truncated to `MAX_INV_PER_MSG` entries.
    pub async fn push_inv(&self, inventory: &[InvVect]) {
        let inventory = if inventory.len() > MAX_INV_PER_MSG {
            inventory[..MAX_INV_PER_MSG].to_vec()
        } else {
            inventory.to_vec()
        };

        self.queue_message(Message::Inv(InvMessage { inventory }), None)
            .await;
    }

    /// Send the object with the given hash. Returns an error if the store
    /// does not have it, signaling `done` immediately so no caller blocks.
    /// If `wait` is given, it is awaited after the store fetch and before
    /// the send, which lets a getdata batch pipeline its fetches.
    pub async fn push_object(
        &self,
        hash: &InvHash,
        done: Option<oneshot::Sender<()>>,
        wait: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        let obj = match self.ctx.store.fetch_object_by_hash(hash) {
            Ok(obj) => obj,
            Err(e) => {
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return Err(e);
            }
        };

        // With the data fetched, wait for any previous send to finish.
        if let Some(wait) = wait {
            let _ = wait.await;
        }

        // Hold the signal back when an inv follows this send immediately.
        let done = if self.continue_hash.lock().as_ref() == Some(hash) {
            None
        } else {
            done
        };

        let msg = ObjectMessage::decode(&obj)?;
        self.queue_message(Message::Object(msg), done).await;
        Ok(())
    }

    /// Send one addr message with the given candidates, skipping addresses
    /// the peer already knows. Past `MAX_ADDR_PER_MSG` entries, each further
    /// candidate replaces a uniformly random slot so the message is not
    /// biased toward the head of the input.
    pub async fn push_addr(&self, addresses: &[NetAddress]) {
        // Nothing to send.
        if addresses.is_empty() {
            return;
        }

        let mut list: Vec<NetAddress> = Vec::new();
        {
            let mut rng = rand::thread_rng();
            let known = self.known_addresses.lock();
            for na in addresses {
                // Filter addresses the peer already knows about.
                if known.contains(&na.key()) {
                    continue;
                }

                if list.len() == MAX_ADDR_PER_MSG {
                    list[rng.gen_range(0..MAX_ADDR_PER_MSG)] = na.clone();
                } else {
                    list.push(na.clone());
                }
            }
        }

        if list.is_empty() {
            return;
        }

        {
            let mut known = self.known_addresses.lock();
            for na in &list {
                known.insert(na.key());
            }
        }

        self.queue_message(Message::Addr(AddrMessage { addresses: list }), None)
            .await;
    }

    /// Set or clear the hash whose object send is immediately followed by an
    /// inv, suppressing that send's completion signal.
    pub fn set_continue_hash(&self, hash: Option<InvHash>) {
        *self.continue_hash.lock() = hash;
    }

    /// A copy of the peer statistics.
    pub fn stats(&self) -> PeerStats {
        self.stats.lock().clone()
    }

    /// Whether the remote end's version is known.
    pub fn version_known(&self) -> bool {
        self.stats.lock().version_known
    }

    pub(crate) fn version_sent(&self) -> bool {
        self.stats.lock().version_sent
    }

    /// Whether the remote end acknowledged our version.
    pub fn verack_received(&self) -> bool {
        self.stats.lock().verack_received
    }

    /// Whether the version handshake has completed in both directions.
    pub fn handshake_complete(&self) -> bool {
        self.stats.lock().handshake_complete
    }

    pub fn protocol_version(&self) -> u32 {
        self.stats.lock().protocol_version
    }

    pub fn services(&self) -> u64 {
        self.stats.lock().services
    }

    pub fn user_agent(&self) -> String {
        self.stats.lock().user_agent.clone()
    }

    /// The address the peer was dialed at or accepted from.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Failed connection attempts so far, used by the server to scale
    /// backoff.
    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_retry_count(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }

    /// The structured wire address of the remote end, once known.
    pub fn net_address(&self) -> Option<NetAddress> {
        self.net_address.lock().clone()
    }

    pub(crate) fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.conn.get()
    }

    pub(crate) fn arc(&self) -> Arc<Peer> {
        // A peer is only ever handed out inside an Arc, so the weak
        // back-reference always upgrades.
        self.me.upgrade().expect("peer not held in an Arc")
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (inbound: {})", self.addr, self.inbound)
    }
}
