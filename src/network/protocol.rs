//! Bitmessage protocol message handling
//!
//! Implements Bitmessage wire message serialization and deserialization.
//! Every frame carries a 24-byte header (magic, command, payload length,
//! checksum) followed by the payload body.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bitmessage network magic.
pub const MAGIC: [u8; 4] = [0xe9, 0xbe, 0xb4, 0xd9];

/// Size of the fixed frame header preceding every payload.
pub const HEADER_LEN: usize = 24;

/// Maximum payload size accepted for a single wire message.
pub const MAX_MESSAGE_PAYLOAD: usize = 1_600_100;

/// Maximum number of inventory vectors in a single inv or getdata message.
pub const MAX_INV_PER_MSG: usize = 50_000;

/// Maximum number of addresses in a single addr message.
pub const MAX_ADDR_PER_MSG: usize = 1_000;

/// Highest protocol version this node speaks.
pub const MAX_PROTOCOL_VERSION: u32 = 3;

/// Streams this node participates in. Bitmessage has only one active stream.
pub const DEFAULT_STREAM_LIST: &[u32] = &[1];

/// Service flags (bitfield in Version.services)
pub const SERVICE_NODE_NETWORK: u64 = 1;

/// User agent name advertised in version messages.
pub const USER_AGENT_NAME: &str = "bmd";

/// Full user agent string advertised in version messages.
pub fn user_agent() -> String {
    format!("/{}:{}/", USER_AGENT_NAME, env!("CARGO_PKG_VERSION"))
}

/// Commands understood by the frame codec.
pub const ALLOWED_COMMANDS: &[&str] = &["version", "verack", "addr", "inv", "getdata", "object"];

/// Wire-level failure while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("truncated message: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("payload encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

/// 32-byte inventory hash identifying an object on the network.
pub type InvHash = [u8; 32];

/// Inventory vector advertised in inv and getdata messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub hash: InvHash,
}

/// Network address as carried in addr and version messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddress {
    /// Last-seen time, unix seconds.
    pub timestamp: i64,
    /// Stream number the address belongs to.
    pub stream: u32,
    /// Services the node at this address advertises.
    pub services: u64,
    /// IP address, IPv4 stored as an IPv4-mapped IPv6 address.
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    /// Create an address stamped with the current time.
    pub fn new(ip: IpAddr, port: u16, stream: u32, services: u64) -> Self {
        Self {
            timestamp: unix_time(),
            stream,
            services,
            ip: ip_to_bytes(ip),
            port,
        }
    }

    /// Build a structured address from a transport socket address.
    pub fn from_socket_addr(addr: SocketAddr, stream: u32, services: u64) -> Self {
        Self::new(addr.ip(), addr.port(), stream, services)
    }

    /// The socket address this entry points at.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(bytes_to_ip(&self.ip), self.port)
    }

    /// Key uniquely identifying this address in per-peer known-address sets.
    pub fn key(&self) -> String {
        self.socket_addr().to_string()
    }
}

fn ip_to_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(ipv4) => {
            let mut bytes = [0u8; 16];
            bytes[10] = 0xff;
            bytes[11] = 0xff;
            bytes[12..16].copy_from_slice(&ipv4.octets());
            bytes
        }
        IpAddr::V6(ipv6) => ipv6.octets(),
    }
}

fn bytes_to_ip(bytes: &[u8; 16]) -> IpAddr {
    if bytes[0..12] == [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff] {
        IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]))
    } else {
        IpAddr::V6(Ipv6Addr::from(*bytes))
    }
}

/// Current unix time in seconds.
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Version message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    /// The address of the node the message is sent to, as the sender sees it.
    pub addr_recv: NetAddress,
    /// The address the sender claims for itself.
    pub addr_from: NetAddress,
    /// Random nonce used to detect connections to self.
    pub nonce: u64,
    pub user_agent: String,
    /// Streams the sender is interested in.
    pub streams: Vec<u32>,
}

/// Addr message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddrMessage {
    pub addresses: Vec<NetAddress>,
}

/// Inventory message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvMessage {
    pub inventory: Vec<InvVect>,
}

/// Get data message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDataMessage {
    pub inventory: Vec<InvVect>,
}

/// Object type discriminators carried in the object envelope.
pub const OBJECT_GET_PUBKEY: u32 = 0;
pub const OBJECT_PUBKEY: u32 = 1;
pub const OBJECT_MSG: u32 = 2;
pub const OBJECT_BROADCAST: u32 = 3;

/// Kind of an object message, derived from its type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    GetPubKey,
    PubKey,
    Msg,
    Broadcast,
    Unknown,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::GetPubKey => "getpubkey",
            ObjectKind::PubKey => "pubkey",
            ObjectKind::Msg => "msg",
            ObjectKind::Broadcast => "broadcast",
            ObjectKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Object message envelope shared by all object kinds.
///
/// The peer engine treats object payloads as opaque; validation and storage
/// belong to the object manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMessage {
    /// Proof-of-work nonce.
    pub nonce: u64,
    /// Expiration time, unix seconds.
    pub expires_at: i64,
    pub object_type: u32,
    pub version: u64,
    pub stream: u32,
    pub payload: Vec<u8>,
}

impl ObjectMessage {
    /// Kind of this object, from its type field.
    pub fn kind(&self) -> ObjectKind {
        match self.object_type {
            OBJECT_GET_PUBKEY => ObjectKind::GetPubKey,
            OBJECT_PUBKEY => ObjectKind::PubKey,
            OBJECT_MSG => ObjectKind::Msg,
            OBJECT_BROADCAST => ObjectKind::Broadcast,
            _ => ObjectKind::Unknown,
        }
    }

    /// Canonical inventory hash of this object: the first 32 bytes of the
    /// double SHA-512 of its encoded form.
    pub fn inv_hash(&self) -> Result<InvHash, WireError> {
        let encoded = self.encode()?;
        let first = Sha512::digest(&encoded);
        let second = Sha512::digest(first);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&second[..32]);
        Ok(hash)
    }

    /// Decode an object from the form the object store keeps it in.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Encode an object to the form the object store keeps it in.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::serialize(self)?)
    }
}

/// Bitmessage protocol message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Version(VersionMessage),
    VerAck,
    Addr(AddrMessage),
    Inv(InvMessage),
    GetData(GetDataMessage),
    Object(ObjectMessage),
}

impl Message {
    /// The wire command naming this message.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Addr(_) => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Object(_) => "object",
        }
    }

    /// Whether the remote end is expected to answer this message. Inv is
    /// deliberately excluded: an inv of no interest to the remote draws no
    /// response.
    pub fn expects_reply(&self) -> bool {
        match self {
            Message::Version(_) => true, // should get a verack
            Message::GetData(_) => true, // should get objects
            Message::Object(obj) => obj.kind() == ObjectKind::GetPubKey,
            _ => false,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

/// Bitmessage frame codec
pub struct MessageCodec;

impl MessageCodec {
    /// Serialize a protocol message to a complete frame.
    pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
        let payload = match message {
            Message::Version(msg) => bincode::serialize(msg)?,
            Message::VerAck => vec![],
            Message::Addr(msg) => bincode::serialize(msg)?,
            Message::Inv(msg) => bincode::serialize(msg)?,
            Message::GetData(msg) => bincode::serialize(msg)?,
            Message::Object(msg) => bincode::serialize(msg)?,
        };

        if payload.len() > MAX_MESSAGE_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_PAYLOAD,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());

        // Magic
        frame.extend_from_slice(&MAGIC);

        // Command (12 bytes, null-padded)
        let command = message.command();
        let mut command_bytes = [0u8; 12];
        command_bytes[..command.len()].copy_from_slice(command.as_bytes());
        frame.extend_from_slice(&command_bytes);

        // Payload length
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());

        // Checksum
        frame.extend_from_slice(&Self::checksum(&payload));

        // Payload
        frame.extend_from_slice(&payload);

        Ok(frame)
    }

    /// Parse and validate a frame header.
    pub fn decode_header(data: &[u8; HEADER_LEN]) -> Result<FrameHeader, WireError> {
        let magic = [data[0], data[1], data[2], data[3]];
        if magic != MAGIC {
            return Err(WireError::BadMagic(u32::from_be_bytes(magic)));
        }

        let command = String::from_utf8_lossy(&data[4..16])
            .trim_end_matches('\0')
            .to_string();
        if !ALLOWED_COMMANDS.contains(&command.as_str()) {
            return Err(WireError::UnknownCommand(command));
        }

        let length = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        if length as usize > MAX_MESSAGE_PAYLOAD {
            return Err(WireError::PayloadTooLarge {
                size: length as usize,
                max: MAX_MESSAGE_PAYLOAD,
            });
        }

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&data[20..24]);

        Ok(FrameHeader {
            command,
            length,
            checksum,
        })
    }

    /// Verify the payload against its header and decode the message body.
    pub fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Message, WireError> {
        if payload.len() != header.length as usize {
            return Err(WireError::Truncated {
                expected: header.length as usize,
                got: payload.len(),
            });
        }

        if Self::checksum(payload) != header.checksum {
            return Err(WireError::ChecksumMismatch);
        }

        match header.command.as_str() {
            "version" => Ok(Message::Version(bincode::deserialize(payload)?)),
            "verack" => Ok(Message::VerAck),
            "addr" => Ok(Message::Addr(bincode::deserialize(payload)?)),
            "inv" => Ok(Message::Inv(bincode::deserialize(payload)?)),
            "getdata" => Ok(Message::GetData(bincode::deserialize(payload)?)),
            "object" => Ok(Message::Object(bincode::deserialize(payload)?)),
            other => Err(WireError::UnknownCommand(other.to_string())),
        }
    }

    /// Parse a complete frame into a protocol message.
    pub fn decode(data: &[u8]) -> Result<Message, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                expected: HEADER_LEN,
                got: data.len(),
            });
        }
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&data[..HEADER_LEN]);
        let header = Self::decode_header(&header_bytes)?;
        Self::decode_payload(&header, &data[HEADER_LEN..])
    }

    /// Message checksum: the first four bytes of the payload's SHA-512.
    pub fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = Sha512::digest(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[..4]);
        checksum
    }
}
