use crate::{
    error::{HandshakeError, Result},
    types::InfoHash,
};

/// Protocol identifier carried in every plain handshake.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
/// Fixed size of the plain handshake on the wire.
pub const HANDSHAKE_LEN: usize = 68;

/// The 68-byte plain BitTorrent handshake:
/// `[19]["BitTorrent protocol"][8 reserved][info_hash][peer_id]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    /// Feature flags; we send all zeroes and accept anything.
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    /// Encode into the fixed 68-byte layout.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = PROTOCOL.len() as u8;
        out[1..20].copy_from_slice(PROTOCOL);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(self.info_hash.as_bytes());
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    /// Decode exactly 68 bytes, enforcing the protocol length byte and
    /// identifier string. Reserved bytes are accepted as-is.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(HandshakeError::Truncated.into());
        }
        if bytes[0] != PROTOCOL.len() as u8 || &bytes[1..20] != PROTOCOL {
            return Err(HandshakeError::BadProtocol.into());
        }
        Ok(Self {
            reserved: bytes[20..28].try_into().expect("8-byte slice"),
            info_hash: InfoHash(bytes[28..48].try_into().expect("20-byte slice")),
            peer_id: bytes[48..68].try_into().expect("20-byte slice"),
        })
    }
}
