use std::time::Duration;

use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::{
    crypto::{
        cipher::{Cipher, CipherKind},
        dh::{self, DhExchange},
    },
    error::{HandshakeError, Result, TransportError},
    types::InfoHash,
};

/// MSE handshake frame types.
const MSE_SKEYE: u8 = 0x02;
const MSE_RKEYE: u8 = 0x03;
const MSE_CRYPTO: u8 = 0x04;

/// Upper bound on a framed MSE message; public keys top out at 128 bytes.
const MAX_MSE_FRAME: u32 = 2000;

/// The cipher pair produced by a completed MSE negotiation. Both instances
/// derive from the same key material at keystream position zero; divergence
/// comes from the data each direction subsequently carries.
pub struct CipherSession {
    /// Decrypts bytes arriving from the peer.
    pub incoming: Cipher,
    /// Encrypts bytes we send to the peer.
    pub outgoing: Cipher,
    pub kind: CipherKind,
}

impl CipherSession {
    fn from_secret(kind: CipherKind, secret: &[u8], info_hash: &InfoHash) -> Result<Self> {
        let key = dh::derive_key(secret, info_hash, None);
        let iv = dh::derive_key(secret, info_hash, Some(&dh::IV_PAD));
        let build = || -> Result<Cipher> {
            match kind {
                CipherKind::Rc4 => Cipher::rc4(&key[..16]),
                CipherKind::Aes => Cipher::aes(&key[..16], &iv[..16]),
                CipherKind::ChaCha20 => {
                    // SHA-1 yields 20 bytes; ChaCha20 needs 32, so its key
                    // schedule switches to SHA-256 over the same input.
                    let key32 = dh::derive_key_sha256(secret, info_hash, None);
                    Cipher::chacha20(&key32, &iv[..16])
                }
            }
        };
        Ok(Self {
            incoming: build()?,
            outgoing: build()?,
            kind,
        })
    }
}

/// Outcome of peeking at the first bytes of an inbound connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detection {
    /// Plain BitTorrent; the consumed bytes open the 68-byte handshake.
    Plain,
    /// MSE framing; the consumed bytes open the SKEYE message.
    Encrypted,
}

/// Decide whether an inbound connection speaks MSE or plain BitTorrent.
/// Returns the detection result together with every byte consumed, which
/// the caller must replay into whichever path runs next. Timeouts and EOF
/// default to plain; that path fails fast if the guess was wrong.
pub async fn detect_inbound<S>(stream: &mut S, deadline: Duration) -> (Detection, Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match timeout(deadline, stream.read_exact(&mut prefix)).await {
        Ok(Ok(_)) => {}
        _ => return (Detection::Plain, Vec::new()),
    }

    // A plain handshake opens with 19, "BitTorrent protocol"
    if prefix[0] == 19 && &prefix[1..4] == b"Bit" {
        return (Detection::Plain, prefix.to_vec());
    }

    let length = u32::from_be_bytes(prefix);
    if length > 4 && length < MAX_MSE_FRAME {
        let mut type_byte = [0u8; 1];
        match timeout(deadline, stream.read_exact(&mut type_byte)).await {
            Ok(Ok(_)) => {
                let mut consumed = prefix.to_vec();
                consumed.push(type_byte[0]);
                if matches!(type_byte[0], MSE_SKEYE | MSE_RKEYE | MSE_CRYPTO) {
                    (Detection::Encrypted, consumed)
                } else {
                    (Detection::Plain, consumed)
                }
            }
            _ => (Detection::Encrypted, prefix.to_vec()),
        }
    } else {
        (Detection::Plain, prefix.to_vec())
    }
}

/// Drives the symmetric SKEYE/RKEYE/CRYPTO negotiation over a byte stream,
/// producing a [`CipherSession`] ready to wrap further I/O.
pub struct MseHandshake {
    exchange: DhExchange,
    prefer_rc4: bool,
    allowed_ciphers: Vec<CipherKind>,
    read_timeout: Duration,
}

impl MseHandshake {
    pub fn new(
        dh_key_size: usize,
        prefer_rc4: bool,
        allowed_ciphers: Vec<CipherKind>,
        read_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            exchange: DhExchange::new(dh_key_size)?,
            prefer_rc4,
            allowed_ciphers,
            read_timeout,
        })
    }

    /// Run the initiator role: send SKEYE, read RKEYE, exchange CRYPTO.
    /// The receiver's CRYPTO reply carries the final cipher decision.
    pub async fn initiate<S>(&self, stream: &mut S, info_hash: &InfoHash) -> Result<CipherSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let keypair = self.exchange.generate_keypair();
        let public = self.exchange.public_key_bytes(&keypair);

        stream
            .write_all(&encode_frame(MSE_SKEYE, &public))
            .await
            .map_err(TransportError::from)?;

        let peer_public = self.read_expected(stream, MSE_RKEYE).await?;
        let peer_public = self.exchange.public_key_from_bytes(&peer_public);
        let secret = self
            .exchange
            .compute_shared_secret(&keypair.private, &peer_public);

        let our_choice = self.select_cipher()?;
        stream
            .write_all(&encode_frame(MSE_CRYPTO, &[our_choice.wire_id()]))
            .await
            .map_err(TransportError::from)?;

        let crypto = self.read_expected(stream, MSE_CRYPTO).await?;
        let peer_choice = decode_crypto(&crypto)?;
        if !self.allowed_ciphers.contains(&peer_choice) {
            return Err(HandshakeError::DisallowedCipher(peer_choice.wire_id()).into());
        }

        debug!("mse negotiated {peer_choice:?} as initiator");
        CipherSession::from_secret(peer_choice, &secret, info_hash)
    }

    /// Run the receiver role: read SKEYE, send RKEYE, read the peer's
    /// CRYPTO preference, answer with our decision.
    pub async fn respond<S>(&self, stream: &mut S, info_hash: &InfoHash) -> Result<CipherSession>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let peer_public = self.read_expected(stream, MSE_SKEYE).await?;
        let peer_public = self.exchange.public_key_from_bytes(&peer_public);

        let keypair = self.exchange.generate_keypair();
        let public = self.exchange.public_key_bytes(&keypair);
        stream
            .write_all(&encode_frame(MSE_RKEYE, &public))
            .await
            .map_err(TransportError::from)?;

        let secret = self
            .exchange
            .compute_shared_secret(&keypair.private, &peer_public);

        let crypto = self.read_expected(stream, MSE_CRYPTO).await?;
        let peer_choice = decode_crypto(&crypto)?;

        // Prefer the peer's cipher when our policy allows it
        let selected = if self.allowed_ciphers.contains(&peer_choice) {
            peer_choice
        } else {
            self.select_cipher()?
        };
        stream
            .write_all(&encode_frame(MSE_CRYPTO, &[selected.wire_id()]))
            .await
            .map_err(TransportError::from)?;

        debug!("mse negotiated {selected:?} as receiver");
        CipherSession::from_secret(selected, &secret, info_hash)
    }

    /// Local preference: RC4 when biased for compatibility, else AES, else
    /// ChaCha20, restricted to the allowed set.
    fn select_cipher(&self) -> Result<CipherKind> {
        if self.prefer_rc4 && self.allowed_ciphers.contains(&CipherKind::Rc4) {
            return Ok(CipherKind::Rc4);
        }
        for kind in [CipherKind::Aes, CipherKind::ChaCha20, CipherKind::Rc4] {
            if self.allowed_ciphers.contains(&kind) {
                return Ok(kind);
            }
        }
        Err(HandshakeError::DisallowedCipher(0).into())
    }

    async fn read_expected<S>(&self, stream: &mut S, expected: u8) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        let (message_type, payload) = self.read_frame(stream).await?;
        if message_type != expected {
            return Err(HandshakeError::WrongMessageType {
                expected,
                got: message_type,
            }
            .into());
        }
        Ok(payload)
    }

    async fn read_frame<S>(&self, stream: &mut S) -> Result<(u8, Vec<u8>)>
    where
        S: AsyncRead + Unpin,
    {
        timeout(self.read_timeout, read_frame(stream))
            .await
            .map_err(|_| HandshakeError::Timeout)?
    }
}

/// `[4-byte length][1-byte type][payload]`, length covering type + payload.
fn encode_frame(message_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u32 + 1;
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(message_type);
    frame.extend_from_slice(payload);
    frame
}

/// Read one framed MSE message.
async fn read_frame<S>(stream: &mut S) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(TransportError::from)?;
    let length = u32::from_be_bytes(header);
    if length == 0 || length > MAX_MSE_FRAME {
        return Err(HandshakeError::Truncated.into());
    }

    let mut body = vec![0u8; length as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(TransportError::from)?;
    let message_type = body[0];
    let payload = body.split_off(1);
    trace!("mse frame type {message_type:#04x}, {} bytes", payload.len());
    Ok((message_type, payload))
}

fn decode_crypto(payload: &[u8]) -> Result<CipherKind> {
    let id = *payload.first().ok_or(HandshakeError::Truncated)?;
    CipherKind::from_wire_id(id).ok_or_else(|| HandshakeError::DisallowedCipher(id).into())
}
