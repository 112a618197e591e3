use std::{
    fmt::{Debug, Display, Formatter},
    net::SocketAddr,
};

use crate::error::{HandshakeError, PeerWireError, Result};

/// 20-byte SHA-1 identifying a torrent. Fixed for the lifetime of a
/// connection; every inbound handshake must carry the same value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Build an info hash from a byte slice, enforcing the 20-byte length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 20] = bytes
            .try_into()
            .map_err(|_| PeerWireError::Handshake(HandshakeError::InfoHashLength(bytes.len())))?;
        Ok(InfoHash(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl Debug for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(raw: [u8; 20]) -> Self {
        InfoHash(raw)
    }
}

/// Read-only description of the torrent a connection serves.
#[derive(Clone, Copy, Debug)]
pub struct TorrentDescriptor {
    pub info_hash: InfoHash,
    pub num_pieces: u32,
    pub piece_length: u32,
}

impl TorrentDescriptor {
    /// Number of bytes in a msb-first packed bitfield covering all pieces.
    pub fn bitfield_len(&self) -> usize {
        (self.num_pieces as usize + 7) / 8
    }
}

/// Immutable identity of a remote peer. The socket address is the canonical
/// key in the connection table; the peer id is unknown until the BitTorrent
/// handshake completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
        }
    }
}

impl Display for PeerInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl From<SocketAddr> for PeerInfo {
    fn from(addr: SocketAddr) -> Self {
        PeerInfo::new(addr)
    }
}

/// Identity of one requested block, the key of the outstanding-request map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

impl Display for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.piece, self.begin, self.length)
    }
}
