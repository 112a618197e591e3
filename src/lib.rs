//! BitTorrent peer-wire transport.
//!
//! This crate is the wire-protocol engine of a BitTorrent client: it
//! negotiates connections with remote peers, optionally encrypts them via
//! Message Stream Encryption (MSE/PE), and multiplexes peer-wire messages
//! over those connections. It is not a client by itself: piece selection,
//! hashing, storage, and peer discovery belong to the caller, which plugs
//! in through the [`PieceProvider`] and [`Sink`] traits and feeds peers to
//! a [`ConnectionManager`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::{Config, ConnectionManager, InfoHash, PeerInfo, TorrentDescriptor};
//! # use peerwire::{BlockInfo, PieceProvider};
//! # struct Storage;
//! # impl PieceProvider for Storage {
//! #     fn bitfield(&self) -> Vec<u8> { vec![0] }
//! #     fn read_block(&self, _: BlockInfo) -> Option<Vec<u8>> { None }
//! #     fn request_failed(&self, _: &PeerInfo, _: BlockInfo) {}
//! # }
//!
//! # #[tokio::main] async fn main() -> peerwire::Result<()> {
//! let torrent = TorrentDescriptor {
//!     info_hash: InfoHash([0; 20]),
//!     num_pieces: 2,
//!     piece_length: 65536,
//! };
//! let manager = ConnectionManager::new(Config::default(), torrent, Arc::new(Storage))?;
//! manager.connect_to_peers(vec![PeerInfo::new("127.0.0.1:6881".parse().unwrap())])?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod provider;
pub mod types;

pub use config::{Config, EncryptionMode};
pub use crypto::{Cipher, CipherKind};
pub use error::{
    CipherError, HandshakeError, MessageError, PeerWireError, RefuseReason, Result,
    TransportError,
};
pub use peer::{ConnectionManager, ConnectionState, PeerConnection, PeerState};
pub use protocol::{Handshake, Message, MessageDecoder};
pub use provider::{DisconnectReason, PieceProvider, Sink};
pub use types::{BlockInfo, InfoHash, PeerInfo, TorrentDescriptor};
