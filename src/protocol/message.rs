use crate::{
    error::{MessageError, Result},
    types::BlockInfo,
};

/// Largest block a Request may ask for or a Piece may carry.
pub const MAX_BLOCK_LEN: u32 = 1 << 17;
/// Typical block size requested by mainstream clients.
pub const DEFAULT_BLOCK_LEN: u32 = 1 << 14;

const TYPE_CHOKE: u8 = 0;
const TYPE_UNCHOKE: u8 = 1;
const TYPE_INTERESTED: u8 = 2;
const TYPE_NOT_INTERESTED: u8 = 3;
const TYPE_HAVE: u8 = 4;
const TYPE_BITFIELD: u8 = 5;
const TYPE_REQUEST: u8 = 6;
const TYPE_PIECE: u8 = 7;
const TYPE_CANCEL: u8 = 8;

/// A peer-wire message. The wire shape is a 4-byte big-endian length prefix
/// followed by a 1-byte type and the typed payload; a zero length is a
/// KeepAlive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Encode into wire bytes, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let payload: Vec<u8> = match self {
            Message::KeepAlive => vec![],
            Message::Choke => vec![TYPE_CHOKE],
            Message::Unchoke => vec![TYPE_UNCHOKE],
            Message::Interested => vec![TYPE_INTERESTED],
            Message::NotInterested => vec![TYPE_NOT_INTERESTED],
            Message::Have(index) => {
                let mut out = vec![TYPE_HAVE];
                out.extend_from_slice(&index.to_be_bytes());
                out
            }
            Message::Bitfield(bits) => {
                let mut out = Vec::with_capacity(bits.len() + 1);
                out.push(TYPE_BITFIELD);
                out.extend_from_slice(bits);
                out
            }
            Message::Request(block) => encode_block_triple(TYPE_REQUEST, block),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut out = Vec::with_capacity(block.len() + 9);
                out.push(TYPE_PIECE);
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&begin.to_be_bytes());
                out.extend_from_slice(block);
                out
            }
            Message::Cancel(block) => encode_block_triple(TYPE_CANCEL, block),
        };

        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend(payload);
        out
    }

    /// Decode one frame (the bytes after the length prefix). An empty frame
    /// is a KeepAlive. Length fields that disagree with the fixed payload
    /// sizes are rejected, as are unknown types and oversized blocks.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let Some(&message_type) = frame.first() else {
            return Ok(Message::KeepAlive);
        };
        let payload = &frame[1..];

        let expect_len = |expected: usize| -> Result<()> {
            if payload.len() != expected {
                return Err(MessageError::MalformedLength {
                    message_type,
                    got: frame.len() as u32,
                }
                .into());
            }
            Ok(())
        };

        match message_type {
            TYPE_CHOKE => expect_len(0).map(|_| Message::Choke),
            TYPE_UNCHOKE => expect_len(0).map(|_| Message::Unchoke),
            TYPE_INTERESTED => expect_len(0).map(|_| Message::Interested),
            TYPE_NOT_INTERESTED => expect_len(0).map(|_| Message::NotInterested),
            TYPE_HAVE => {
                expect_len(4)?;
                Ok(Message::Have(read_u32(payload, 0)))
            }
            TYPE_BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
            TYPE_REQUEST => {
                expect_len(12)?;
                let block = decode_block_triple(payload)?;
                Ok(Message::Request(block))
            }
            TYPE_PIECE => {
                if payload.len() < 8 {
                    return Err(MessageError::InvalidPiece.into());
                }
                let block = &payload[8..];
                if block.len() as u32 > MAX_BLOCK_LEN {
                    return Err(MessageError::MessageTooLarge(frame.len() as u32).into());
                }
                Ok(Message::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    block: block.to_vec(),
                })
            }
            TYPE_CANCEL => {
                expect_len(12)?;
                let block = decode_block_triple(payload)?;
                Ok(Message::Cancel(block))
            }
            other => Err(MessageError::UnknownType(other).into()),
        }
    }

    /// Short tag for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request(_) => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel(_) => "cancel",
        }
    }
}

fn encode_block_triple(message_type: u8, block: &BlockInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(message_type);
    out.extend_from_slice(&block.piece.to_be_bytes());
    out.extend_from_slice(&block.begin.to_be_bytes());
    out.extend_from_slice(&block.length.to_be_bytes());
    out
}

fn decode_block_triple(payload: &[u8]) -> Result<BlockInfo> {
    let block = BlockInfo {
        piece: read_u32(payload, 0),
        begin: read_u32(payload, 4),
        length: read_u32(payload, 8),
    };
    if block.length > MAX_BLOCK_LEN {
        return Err(MessageError::MessageTooLarge(block.length).into());
    }
    Ok(block)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().expect("4-byte slice"))
}
