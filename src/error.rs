use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PeerWireError>;

/// Top-level error taxonomy. Every failure the crate can surface is one of
/// these variants; per-connection failures never escape the connection that
/// produced them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerWireError {
    /// Out-of-range or self-inconsistent configuration, raised at
    /// construction time only.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// A block request was refused locally before any wire bytes were
    /// produced.
    #[error("request refused: {0}")]
    RequestRefused(RefuseReason),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

/// Dial/read/write failures on the underlying byte stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("dns resolution failed")]
    DnsFailure,
    #[error("connection refused")]
    ConnectRefused,
    #[error("timed out")]
    Timeout,
    #[error("unexpected eof")]
    UnexpectedEof,
    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => TransportError::ConnectRefused,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::UnexpectedEof => TransportError::UnexpectedEof,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Failures during the MSE or plain BitTorrent handshake.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("info hash mismatch")]
    InfoHashMismatch,
    #[error("info hash must be 20 bytes, got {0}")]
    InfoHashLength(usize),
    #[error("bad protocol identifier")]
    BadProtocol,
    #[error("truncated handshake")]
    Truncated,
    #[error("expected message type {expected:#04x}, got {got:#04x}")]
    WrongMessageType { expected: u8, got: u8 },
    #[error("peer selected disallowed cipher {0:#04x}")]
    DisallowedCipher(u8),
    #[error("handshake timed out")]
    Timeout,
}

/// Malformed or oversized peer-wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("length {got} does not match message type {message_type}")]
    MalformedLength { message_type: u8, got: u32 },
    #[error("decoder buffer overflow ({0} bytes)")]
    BufferOverflow(usize),
    #[error("message of {0} bytes exceeds the frame limit")]
    MessageTooLarge(u32),
    #[error("invalid piece payload")]
    InvalidPiece,
    #[error("bitfield after the first message")]
    UnexpectedBitfield,
}

/// Cipher construction failures. Encryption and decryption themselves never
/// fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("invalid key length {0}")]
    InvalidKey(usize),
    #[error("invalid nonce length {0}")]
    InvalidNonce(usize),
    #[error("invalid iv length {0}")]
    InvalidIv(usize),
}

/// Why a local `request_block` call produced no wire bytes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RefuseReason {
    #[error("peer is choking us")]
    Choked,
    #[error("request pipeline is full")]
    PipelineFull,
    #[error("connection is not active")]
    NotActive,
}

impl PeerWireError {
    /// Whether the error should tear down the connection it occurred on.
    /// Local refusals and shutdown races leave the connection intact.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PeerWireError::RequestRefused(_) | PeerWireError::ShutdownInProgress
        )
    }
}
