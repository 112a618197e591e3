pub mod decoder;
pub mod handshake;
pub mod message;

pub use decoder::MessageDecoder;
pub use handshake::Handshake;
pub use message::Message;
