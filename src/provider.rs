use std::fmt::Display;

use crate::{
    error::PeerWireError,
    peer::PeerConnection,
    types::{BlockInfo, PeerInfo},
};

/// Why a connection went away, delivered with `on_peer_disconnected`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A local caller asked for the disconnect.
    Requested,
    /// The manager is shutting down.
    Shutdown,
    /// The connection failed.
    Error(PeerWireError),
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "requested"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
            DisconnectReason::Error(err) => write!(f, "{err}"),
        }
    }
}

/// Source and sink of block data, supplied by the download engine driving
/// this transport. Implementations are called from connection tasks and
/// must not block on long I/O; hand heavy work to your own executor.
pub trait PieceProvider: Send + Sync {
    /// Packed msb-first bitfield of the pieces available locally.
    fn bitfield(&self) -> Vec<u8>;

    /// Read a block to serve to a peer, or None if it is not available.
    fn read_block(&self, block: BlockInfo) -> Option<Vec<u8>>;

    /// A previously issued request will not complete on this connection
    /// (choke, timeout, or teardown); the scheduler may re-queue it.
    fn request_failed(&self, peer: &PeerInfo, block: BlockInfo);
}

/// Connection lifecycle events. Every method has a no-op default, so
/// implementors override only what they consume. Invocations happen on
/// connection tasks; treat them as best-effort and non-blocking.
pub trait Sink: Send + Sync {
    fn on_peer_connected(&self, _conn: &PeerConnection) {}

    fn on_peer_disconnected(&self, _conn: &PeerConnection, _reason: &DisconnectReason) {}

    fn on_bitfield_received(&self, _conn: &PeerConnection, _bitfield: &[u8]) {}

    /// The peer announced one more piece via Have.
    fn on_piece_available(&self, _conn: &PeerConnection, _piece: u32) {}

    /// A requested block arrived.
    fn on_block_received(&self, _conn: &PeerConnection, _piece: u32, _begin: u32, _block: &[u8]) {}
}
