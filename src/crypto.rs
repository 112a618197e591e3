pub mod cipher;
pub mod dh;
pub mod mse;

pub use cipher::{Cipher, CipherKind};
pub use dh::DhExchange;
pub use mse::{detect_inbound, CipherSession, Detection, MseHandshake};
