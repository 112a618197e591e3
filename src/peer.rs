use std::collections::HashSet;

pub mod connection;
pub mod manager;
mod stream;

pub use connection::PeerConnection;
pub use manager::ConnectionManager;

/// Connection lifecycle. Transitions run monotonically through the
/// handshake prefix, then Active and Choked alternate freely on peer
/// choke traffic. Error is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    HandshakeSent,
    HandshakeReceived,
    Connected,
    BitfieldSent,
    BitfieldReceived,
    Active,
    Choked,
    Error,
}

impl ConnectionState {
    /// Handshake has completed; the wire accepts regular messages.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::BitfieldSent
                | ConnectionState::BitfieldReceived
                | ConnectionState::Active
                | ConnectionState::Choked
        )
    }

    /// Handshake and bitfield exchange have both completed.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Active | ConnectionState::Choked)
    }
}

/// Per-direction choke/interest state plus what we know the peer has.
/// Both sides start choked and uninterested per the BitTorrent spec.
#[derive(Clone, Debug)]
pub struct PeerState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// The peer's bitfield, stored on first receipt only.
    pub bitfield: Option<Vec<u8>>,
    /// Piece indices the peer is known to have, from Bitfield and Have.
    pub peer_has: HashSet<u32>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
            peer_has: HashSet::new(),
        }
    }
}

impl PeerState {
    pub fn has_piece(&self, index: u32) -> bool {
        self.peer_has.contains(&index)
    }
}

/// Unpack an msb-first packed bitfield into the piece indices it sets,
/// bounded by the torrent's piece count.
pub(crate) fn bitfield_indices(bitfield: &[u8], num_pieces: u32) -> Vec<u32> {
    let mut indices = Vec::new();
    for index in 0..num_pieces {
        let byte = bitfield[(index / 8) as usize];
        if byte & (0x80 >> (index % 8)) != 0 {
            indices.push(index);
        }
    }
    indices
}
