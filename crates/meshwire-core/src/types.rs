//! Core data types for meshwire

use crate::{Error, Result};
use bytes::Bytes;
use multiaddr::{Multiaddr, Protocol};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Longest peer id accepted from the wire or from an address
pub const MAX_PEER_ID_LEN: usize = 128;

/// A versioned protocol tag that routes a stream to its handler
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(Cow<'static, str>);

impl ProtocolId {
    /// Create a protocol id from a static string
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    /// Create a protocol id from an owned string (e.g. read off the wire)
    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolId({})", self.0)
    }
}

/// Wire identifiers shared by every peer
pub mod protocols {
    use super::ProtocolId;

    /// Liveness check
    pub const HEARTBEAT: ProtocolId = ProtocolId::from_static("/heartbeat/1.0.0");
    /// One transaction record per stream
    pub const PAYMENT: ProtocolId = ProtocolId::from_static("/payment/1.0.0");
    /// Stateless payment acknowledgment
    pub const PING: ProtocolId = ProtocolId::from_static("/ping/1.0.0");
    /// Full directory snapshot transfer
    pub const SYNC: ProtocolId = ProtocolId::from_static("/sync/1.0.0");
}

/// Identifier of a peer on the network
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random peer id (16 random bytes, hex encoded)
    pub fn random() -> Result<Self> {
        random_hex(16).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidPeerId("empty peer id".to_string()));
        }
        if s.len() > MAX_PEER_ID_LEN {
            return Err(Error::InvalidPeerId(format!(
                "peer id is {} bytes, limit is {}",
                s.len(),
                MAX_PEER_ID_LEN
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::InvalidPeerId(format!("invalid characters in {:?}", s)));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PeerId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.0
    }
}

/// Hex string built from `bytes` random bytes
pub fn random_hex(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    getrandom::getrandom(&mut buf)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    Ok(hex::encode(buf))
}

/// A routable peer address such as `/ip4/127.0.0.1/tcp/4001/p2p/<peer id>`
///
/// Everything before the trailing `/p2p/<id>` (or `/ipfs/<id>`) is a
/// multiaddr limited to `ip4`, `ip6` and `tcp`. The parsed string is kept
/// as-is so it can be echoed back verbatim (it is embedded as `receiver` in
/// transaction records).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    raw: String,
    network: Multiaddr,
    peer: Option<PeerId>,
}

impl PeerAddress {
    /// Address of a peer reachable over TCP
    pub fn tcp(socket: SocketAddr, peer: &PeerId) -> Self {
        let ip = match socket.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        let network = Multiaddr::empty().with(ip).with(Protocol::Tcp(socket.port()));
        Self {
            raw: format!("{}/p2p/{}", network, peer),
            network,
            peer: Some(peer.clone()),
        }
    }

    /// Address carrying only a peer id, used by the in-memory transport
    pub fn peer_only(peer: &PeerId) -> Self {
        Self {
            raw: format!("/p2p/{}", peer),
            network: Multiaddr::empty(),
            peer: Some(peer.clone()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The network part, without the peer id
    pub fn network(&self) -> &Multiaddr {
        &self.network
    }

    /// The peer id encoded in the address, if any
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    /// The peer id, or a resolution error when the address carries none
    pub fn require_peer_id(&self) -> Result<PeerId> {
        self.peer
            .clone()
            .ok_or_else(|| Error::InvalidAddress(format!("{} has no /p2p/ component", self.raw)))
    }

    /// The TCP socket address, when the address has both an IP and a TCP port
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let mut ip = None;
        let mut port = None;
        for protocol in self.network.iter() {
            match protocol {
                Protocol::Ip4(v4) => ip = Some(IpAddr::V4(v4)),
                Protocol::Ip6(v6) => ip = Some(IpAddr::V6(v6)),
                Protocol::Tcp(p) => port = Some(p),
                _ => {}
            }
        }
        Some(SocketAddr::new(ip?, port?))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self.raw)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(Error::InvalidAddress("empty address".to_string()));
        }

        let (network, peer) = split_peer(raw);
        let peer = peer
            .map(|id| id.parse::<PeerId>())
            .transpose()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", raw, e)))?;
        let network = if network.is_empty() {
            Multiaddr::empty()
        } else {
            network
                .parse::<Multiaddr>()
                .map_err(|e| Error::InvalidAddress(format!("{}: {}", raw, e)))?
        };

        if let Some(other) = network
            .iter()
            .find(|p| !matches!(p, Protocol::Ip4(_) | Protocol::Ip6(_) | Protocol::Tcp(_)))
        {
            return Err(Error::InvalidAddress(format!(
                "unsupported component {} in {}",
                other, raw
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            network,
            peer,
        })
    }
}

/// Split a trailing `/p2p/<id>` or `/ipfs/<id>` off an address string
fn split_peer(raw: &str) -> (&str, Option<&str>) {
    let mut tail = raw.rsplitn(3, '/');
    match (tail.next(), tail.next(), tail.next()) {
        (Some(id), Some("p2p" | "ipfs"), Some(rest)) => (rest, Some(id)),
        _ => (raw, None),
    }
}

/// A one-shot notification of a value transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Address of the paying peer
    #[serde(alias = "Sender")]
    pub sender: String,
    /// Address the payment was sent to
    #[serde(alias = "Receiver")]
    pub receiver: String,
    #[serde(alias = "Amount")]
    pub amount: f64,
}

impl TransactionRecord {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, amount: f64) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
        }
    }
}

/// A packed snapshot of a shared directory
#[derive(Clone, PartialEq, Eq)]
pub struct SyncPayload(Bytes);

impl SyncPayload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for SyncPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncPayload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for SyncPayload {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_parse_tcp_address() {
        let addr: PeerAddress = "/ip4/127.0.0.1/tcp/4001/p2p/abc123".parse().unwrap();
        assert_eq!(addr.peer_id().unwrap().as_str(), "abc123");
        assert_eq!(addr.socket_addr(), Some("127.0.0.1:4001".parse().unwrap()));
        assert_eq!(addr.to_string(), "/ip4/127.0.0.1/tcp/4001/p2p/abc123");
    }

    #[test]
    fn test_ipfs_alias() {
        let addr: PeerAddress = "/ip4/10.0.0.2/tcp/99/ipfs/QmPeer".parse().unwrap();
        assert_eq!(addr.peer_id().unwrap().as_str(), "QmPeer");
    }

    #[test]
    fn test_invalid_addresses() {
        for bad in [
            "",
            "ip4/127.0.0.1",
            "/ip4/999.0.0.1/tcp/1/p2p/x",
            "/ip4/127.0.0.1/tcp",
            "/udp/53/p2p/x",
            "/p2p/a/p2p/b",
            "/p2p/not-alnum",
        ] {
            let err = bad.parse::<PeerAddress>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Resolution, "{:?}", bad);
        }
    }

    #[test]
    fn test_require_peer_id() {
        let addr: PeerAddress = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(addr.socket_addr().is_some());
        assert_eq!(addr.require_peer_id().unwrap_err().kind(), ErrorKind::Resolution);
    }

    #[test]
    fn test_tcp_constructor_roundtrip() {
        let peer = PeerId::random().unwrap();
        let socket: SocketAddr = "[::1]:7000".parse().unwrap();
        let addr = PeerAddress::tcp(socket, &peer);
        let parsed: PeerAddress = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.socket_addr(), Some(socket));
    }

    #[test]
    fn test_random_peer_id() {
        let a = PeerId::random().unwrap();
        let b = PeerId::random().unwrap();
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
        assert_eq!(a.as_str().parse::<PeerId>().unwrap(), a);
    }

    #[test]
    fn test_network_part() {
        let addr: PeerAddress = "/ip6/::1/tcp/9/p2p/abc".parse().unwrap();
        assert_eq!(addr.network().to_string(), "/ip6/::1/tcp/9");
        assert_eq!(addr.peer_id().unwrap().as_str(), "abc");

        let addr: PeerAddress = "/p2p/abc".parse().unwrap();
        assert_eq!(addr.network(), &Multiaddr::empty());
        assert_eq!(addr.socket_addr(), None);
    }

    #[test]
    fn test_peer_id_deserialize_validates() {
        let peer: PeerId = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(peer.as_str(), "abc123");
        assert_eq!(serde_json::to_string(&peer).unwrap(), "\"abc123\"");
        assert!(serde_json::from_str::<PeerId>("\"not-alnum\"").is_err());
        assert!(serde_json::from_str::<PeerId>("\"\"").is_err());
    }
}
