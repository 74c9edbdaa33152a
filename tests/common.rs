//! Shared test harness: a scripted mock transport and mock collaborators
//! for driving a peer without touching the network.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use bmd_node::config::NetworkConfig;
use bmd_node::network::peer::{Peer, ServerContext};
use bmd_node::network::protocol::{
    unix_time, InvHash, InvMessage, InvVect, Message, NetAddress, ObjectMessage, VersionMessage,
    MAX_PROTOCOL_VERSION, OBJECT_BROADCAST, SERVICE_NODE_NETWORK,
};
use bmd_node::network::traits::{AddressManager, ObjectManager, ObjectStore};
use bmd_node::network::transport::{Connection, Dialer};

/// Nonce the test server advertises.
pub const SERVER_NONCE: u64 = 0x1bad_cafe;

/// Address mock connections claim their remote end lives at.
pub const REMOTE_ADDR: &str = "127.0.0.2:8444";

/// Scripted connection: tests feed inbound messages through a channel and
/// observe everything the peer writes through another.
pub struct MockConnection {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    written_tx: mpsc::UnboundedSender<Message>,
    closed: AtomicUsize,
    remote: SocketAddr,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl MockConnection {
    pub fn new(
        remote: SocketAddr,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            incoming: tokio::sync::Mutex::new(in_rx),
            written_tx: out_tx,
            closed: AtomicUsize::new(0),
            remote,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        });
        (conn, in_tx, out_rx)
    }

    /// How many times `close` has been invoked.
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    async fn read_message(&self) -> Result<Message> {
        if self.closed.load(Ordering::SeqCst) > 0 {
            return Err(anyhow!("connection closed"));
        }
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(msg) => {
                self.bytes_read.fetch_add(1, Ordering::Relaxed);
                Ok(msg)
            }
            None => Err(anyhow!("connection closed")),
        }
    }

    async fn write_message(&self, msg: &Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) > 0 {
            return Err(anyhow!("connection closed"));
        }
        self.bytes_written.fetch_add(1, Ordering::Relaxed);
        self.written_tx
            .send(msg.clone())
            .map_err(|_| anyhow!("written receiver dropped"))
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

/// Address manager that records every call made against it.
#[derive(Default)]
pub struct MockAddressManager {
    pub routable: AtomicBool,
    pub cache: Mutex<Vec<NetAddress>>,
    pub good_calls: AtomicUsize,
    pub attempt_calls: AtomicUsize,
    pub connected_calls: AtomicUsize,
    pub added: Mutex<Vec<NetAddress>>,
}

impl AddressManager for MockAddressManager {
    fn best_local_address(&self, _remote: &NetAddress) -> NetAddress {
        NetAddress::new(
            "127.0.0.1".parse().unwrap(),
            8444,
            1,
            SERVICE_NODE_NETWORK,
        )
    }

    fn is_routable(&self, _na: &NetAddress) -> bool {
        self.routable.load(Ordering::SeqCst)
    }

    fn good(&self, _na: &NetAddress) {
        self.good_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn attempt(&self, _na: &NetAddress) {
        self.attempt_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn connected(&self, _na: &NetAddress) {
        self.connected_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn add_address(&self, na: &NetAddress, _src: &NetAddress) {
        self.added.lock().push(na.clone());
    }

    fn add_addresses(&self, addresses: &[NetAddress], _src: &NetAddress) {
        self.added.lock().extend_from_slice(addresses);
    }

    fn host_to_net_address(
        &self,
        host: &str,
        port: u16,
        stream: u32,
        services: u64,
    ) -> Result<NetAddress> {
        let ip = host
            .parse()
            .map_err(|_| anyhow!("unresolvable host {}", host))?;
        Ok(NetAddress::new(ip, port, stream, services))
    }

    fn address_cache(&self) -> Vec<NetAddress> {
        self.cache.lock().clone()
    }
}

/// Object manager that records every call made against it.
#[derive(Default)]
pub struct MockObjectManager {
    pub new_peers: AtomicUsize,
    pub done_peers: AtomicUsize,
    pub invs: Mutex<Vec<InvMessage>>,
    pub objects: Mutex<Vec<ObjectMessage>>,
}

impl ObjectManager for MockObjectManager {
    fn new_peer(&self, _peer: &Arc<Peer>) {
        self.new_peers.fetch_add(1, Ordering::SeqCst);
    }

    fn done_peer(&self, _peer: &Arc<Peer>) {
        self.done_peers.fetch_add(1, Ordering::SeqCst);
    }

    fn queue_inv(&self, msg: InvMessage, _peer: &Arc<Peer>) {
        self.invs.lock().push(msg);
    }

    fn handle_object(&self, msg: ObjectMessage) {
        self.objects.lock().push(msg);
    }
}

/// In-memory object store.
#[derive(Default)]
pub struct MockStore {
    pub objects: Mutex<HashMap<InvHash, Vec<u8>>>,
}

impl MockStore {
    /// Store an object under its canonical hash and return the hash.
    pub fn insert_object(&self, obj: &ObjectMessage) -> InvHash {
        let hash = obj.inv_hash().unwrap();
        self.objects.lock().insert(hash, obj.encode().unwrap());
        hash
    }
}

impl ObjectStore for MockStore {
    fn fetch_object_by_hash(&self, hash: &InvHash) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| anyhow!("object not found"))
    }

    fn fetch_random_inv_hashes(
        &self,
        count: usize,
        filter: &dyn Fn(&InvHash) -> bool,
    ) -> Vec<InvHash> {
        self.objects
            .lock()
            .keys()
            .filter(|&hash| filter(hash))
            .take(count)
            .copied()
            .collect()
    }
}

/// Dialer that hands out a prepared connection once, then refuses.
#[derive(Default)]
pub struct MockDialer {
    pub conn: Mutex<Option<Arc<dyn Connection>>>,
}

#[async_trait::async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, _addr: &str) -> Result<Arc<dyn Connection>> {
        self.conn.lock().take().ok_or_else(|| anyhow!("dial refused"))
    }
}

/// Everything a peer needs, with mock collaborators the test can inspect.
pub struct TestNode {
    pub ctx: Arc<ServerContext>,
    pub addr_manager: Arc<MockAddressManager>,
    pub object_manager: Arc<MockObjectManager>,
    pub store: Arc<MockStore>,
    pub dialer: Arc<MockDialer>,
    pub done_rx: mpsc::UnboundedReceiver<Arc<Peer>>,
}

pub fn test_node() -> TestNode {
    test_node_with_config(NetworkConfig::default())
}

pub fn test_node_with_config(config: NetworkConfig) -> TestNode {
    let addr_manager = Arc::new(MockAddressManager::default());
    let object_manager = Arc::new(MockObjectManager::default());
    let store = Arc::new(MockStore::default());
    let dialer = Arc::new(MockDialer::default());
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let ctx = Arc::new(ServerContext {
        nonce: SERVER_NONCE,
        addr_manager: addr_manager.clone(),
        object_manager: object_manager.clone(),
        store: store.clone(),
        dialer: dialer.clone(),
        done_peers: done_tx,
        retry_interval: Duration::from_secs(5),
        config,
    });

    TestNode {
        ctx,
        addr_manager,
        object_manager,
        store,
        dialer,
        done_rx,
    }
}

/// An inbound peer backed by a scripted connection, not yet started.
pub fn inbound_peer(
    node: &TestNode,
) -> (
    Arc<Peer>,
    mpsc::UnboundedSender<Message>,
    mpsc::UnboundedReceiver<Message>,
    Arc<MockConnection>,
) {
    let (conn, in_tx, written_rx) = MockConnection::new(REMOTE_ADDR.parse().unwrap());
    let dyn_conn: Arc<dyn Connection> = conn.clone();
    let peer = Peer::new_inbound(node.ctx.clone(), dyn_conn);
    (peer, in_tx, written_rx, conn)
}

/// An outbound peer whose dial resolves to a scripted connection. The
/// dialer task starts the peer itself; the first written message will be
/// our version.
pub fn outbound_peer(
    node: &TestNode,
) -> (
    Arc<Peer>,
    mpsc::UnboundedSender<Message>,
    mpsc::UnboundedReceiver<Message>,
    Arc<MockConnection>,
) {
    let (conn, in_tx, written_rx) = MockConnection::new(REMOTE_ADDR.parse().unwrap());
    let dyn_conn: Arc<dyn Connection> = conn.clone();
    *node.dialer.conn.lock() = Some(dyn_conn);
    let peer = Peer::new_outbound(node.ctx.clone(), REMOTE_ADDR, false, 0, 1).unwrap();
    (peer, in_tx, written_rx, conn)
}

/// A version message as the remote end would send it.
pub fn remote_version(nonce: u64) -> Message {
    let remote: SocketAddr = REMOTE_ADDR.parse().unwrap();
    Message::Version(VersionMessage {
        version: MAX_PROTOCOL_VERSION,
        services: SERVICE_NODE_NETWORK,
        timestamp: unix_time(),
        addr_recv: NetAddress::new(
            "127.0.0.1".parse().unwrap(),
            8444,
            1,
            SERVICE_NODE_NETWORK,
        ),
        addr_from: NetAddress::from_socket_addr(remote, 1, SERVICE_NODE_NETWORK),
        nonce,
        user_agent: "/test:0.0.1/".to_string(),
        streams: vec![1],
    })
}

/// Distinct inventory vectors for tests.
pub fn inv(n: u16) -> InvVect {
    let mut hash = [0u8; 32];
    hash[0] = (n >> 8) as u8;
    hash[1] = n as u8;
    hash[2] = 0xab;
    InvVect { hash }
}

/// A small broadcast object with a distinguishing tag.
pub fn test_object(tag: u8) -> ObjectMessage {
    ObjectMessage {
        nonce: tag as u64,
        expires_at: unix_time() + 600,
        object_type: OBJECT_BROADCAST,
        version: 1,
        stream: 1,
        payload: vec![tag],
    }
}

/// Receive the next written message, failing the test on timeout.
pub async fn next_written(
    written_rx: &mut mpsc::UnboundedReceiver<Message>,
    timeout: Duration,
) -> Message {
    tokio::time::timeout(timeout, written_rx.recv())
        .await
        .expect("timed out waiting for a written message")
        .expect("written channel closed")
}

/// Drive an inbound peer through the full handshake, consuming the version,
/// verack, and any bootstrap messages it writes.
pub async fn complete_inbound_handshake(
    peer: &Arc<Peer>,
    in_tx: &mpsc::UnboundedSender<Message>,
    written_rx: &mut mpsc::UnboundedReceiver<Message>,
) {
    in_tx.send(remote_version(0x5eed)).unwrap();

    let version = next_written(written_rx, Duration::from_secs(5)).await;
    assert!(matches!(version, Message::Version(_)));
    let verack = next_written(written_rx, Duration::from_secs(5)).await;
    assert_eq!(verack, Message::VerAck);

    in_tx.send(Message::VerAck).unwrap();

    // The handshake ends with a bootstrap inv (the addr is skipped when the
    // address cache is empty).
    loop {
        let msg = next_written(written_rx, Duration::from_secs(5)).await;
        match msg {
            Message::Inv(_) => break,
            Message::Addr(_) => continue,
            other => panic!("unexpected bootstrap message: {:?}", other),
        }
    }

    assert!(peer.handshake_complete());
}
