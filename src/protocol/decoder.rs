use bytes::{Buf, BytesMut};

use crate::{
    error::{MessageError, Result},
    protocol::message::{Message, MAX_BLOCK_LEN},
};

/// Largest frame the decoder will accept: a maximum-size Piece plus header
/// slack. Anything longer is a protocol violation.
pub const MAX_FRAME_LEN: u32 = MAX_BLOCK_LEN + 16;

/// Default cap on buffered-but-undecoded bytes: 1 MiB above the largest
/// in-flight frame.
pub const DEFAULT_MAX_BUFFER_LEN: usize = (1 << 20) + MAX_BLOCK_LEN as usize;

/// Pull-style streaming decoder. Bytes go in through [`feed`] in whatever
/// chunks the transport produces; complete messages come out of
/// [`next_message`] in wire order.
///
/// The backing `BytesMut` is recycled across frames: consumed prefixes are
/// reclaimed when the buffer grows, so steady-state decoding of the
/// fixed-size message types performs no allocation at all. Only Piece and
/// Bitfield payloads are copied out.
///
/// [`feed`]: MessageDecoder::feed
/// [`next_message`]: MessageDecoder::next_message
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: BytesMut,
    max_buffer_len: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::with_buffer_limit(DEFAULT_MAX_BUFFER_LEN)
    }

    /// Decoder with a custom cap on buffered bytes.
    pub fn with_buffer_limit(max_buffer_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_buffer_len,
        }
    }

    /// Append raw transport bytes. Amortized O(n); fails only when the
    /// buffer would exceed its cap, which indicates a peer that is sending
    /// faster than it frames.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        if self.buffer.len() + data.len() > self.max_buffer_len {
            return Err(MessageError::BufferOverflow(self.buffer.len() + data.len()).into());
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Decode and consume the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes(self.buffer[..4].try_into().expect("4-byte slice"));
        if length > MAX_FRAME_LEN {
            return Err(MessageError::MessageTooLarge(length).into());
        }
        if self.buffer.len() < 4 + length as usize {
            return Ok(None);
        }

        self.buffer.advance(4);
        let frame = self.buffer.split_to(length as usize);
        Message::decode(&frame).map(Some)
    }

    /// Bytes fed but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
