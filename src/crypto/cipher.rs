use std::fmt::{Debug, Formatter};

use aes::{Aes128, Aes256};
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use crate::error::{CipherError, Result};

/// Keystream bytes discarded after RC4 key scheduling. Required for
/// interoperability with other MSE implementations ("MSE-RC4").
const RC4_DISCARD: usize = 1024;

type Aes128CfbEnc = cfb_mode::BufEncryptor<Aes128>;
type Aes128CfbDec = cfb_mode::BufDecryptor<Aes128>;
type Aes256CfbEnc = cfb_mode::BufEncryptor<Aes256>;
type Aes256CfbDec = cfb_mode::BufDecryptor<Aes256>;

/// Cipher identifier as negotiated in the MSE CRYPTO message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Rc4,
    Aes,
    ChaCha20,
}

impl CipherKind {
    /// Single-byte identifier carried in the CRYPTO payload.
    pub fn wire_id(self) -> u8 {
        match self {
            CipherKind::Rc4 => 0x01,
            CipherKind::Aes => 0x02,
            CipherKind::ChaCha20 => 0x03,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(CipherKind::Rc4),
            0x02 => Some(CipherKind::Aes),
            0x03 => Some(CipherKind::ChaCha20),
            _ => None,
        }
    }
}

/// A negotiated stream cipher. Each instance carries two independent
/// keystream positions, one advanced by `encrypt` and one by `decrypt`,
/// both starting from the same (key, iv) material. Decrypting bytes that a
/// different instance produced mid-stream yields garbage; wrap each
/// connection direction with its own instance.
pub enum Cipher {
    Rc4 {
        encrypt: Rc4State,
        decrypt: Rc4State,
    },
    Aes128 {
        encrypt: Aes128CfbEnc,
        decrypt: Aes128CfbDec,
    },
    Aes256 {
        encrypt: Aes256CfbEnc,
        decrypt: Aes256CfbDec,
    },
    ChaCha20 {
        encrypt: chacha20::ChaCha20,
        decrypt: chacha20::ChaCha20,
    },
}

impl Cipher {
    /// RC4 with the MSE 1024-byte keystream discard. Any non-empty key is
    /// accepted; MSE uses 16 bytes.
    pub fn rc4(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(CipherError::InvalidKey(0).into());
        }
        Ok(Cipher::Rc4 {
            encrypt: Rc4State::new(key),
            decrypt: Rc4State::new(key),
        })
    }

    /// AES-CFB with a 16-byte (AES-128) or 32-byte (AES-256) key and a
    /// 16-byte IV.
    pub fn aes(key: &[u8], iv: &[u8]) -> Result<Self> {
        if iv.len() != 16 {
            return Err(CipherError::InvalidIv(iv.len()).into());
        }
        match key.len() {
            16 => Ok(Cipher::Aes128 {
                encrypt: Aes128CfbEnc::new_from_slices(key, iv)
                    .map_err(|_| CipherError::InvalidKey(key.len()))?,
                decrypt: Aes128CfbDec::new_from_slices(key, iv)
                    .map_err(|_| CipherError::InvalidKey(key.len()))?,
            }),
            32 => Ok(Cipher::Aes256 {
                encrypt: Aes256CfbEnc::new_from_slices(key, iv)
                    .map_err(|_| CipherError::InvalidKey(key.len()))?,
                decrypt: Aes256CfbDec::new_from_slices(key, iv)
                    .map_err(|_| CipherError::InvalidKey(key.len()))?,
            }),
            other => Err(CipherError::InvalidKey(other).into()),
        }
    }

    /// ChaCha20 with a 32-byte key and a 16-byte nonce. The nonce follows
    /// the OpenSSL layout: the first 4 bytes are the initial block counter
    /// (little-endian), the remaining 12 bytes the IETF nonce.
    pub fn chacha20(key: &[u8], nonce: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(CipherError::InvalidKey(key.len()).into());
        }
        if nonce.len() != 16 {
            return Err(CipherError::InvalidNonce(nonce.len()).into());
        }
        let counter = u32::from_le_bytes(nonce[..4].try_into().expect("4-byte slice"));
        let make = || {
            let mut cipher = chacha20::ChaCha20::new_from_slices(key, &nonce[4..])
                .expect("lengths checked above");
            cipher.seek(counter as u64 * 64);
            cipher
        };
        Ok(Cipher::ChaCha20 {
            encrypt: make(),
            decrypt: make(),
        })
    }

    pub fn kind(&self) -> CipherKind {
        match self {
            Cipher::Rc4 { .. } => CipherKind::Rc4,
            Cipher::Aes128 { .. } | Cipher::Aes256 { .. } => CipherKind::Aes,
            Cipher::ChaCha20 { .. } => CipherKind::ChaCha20,
        }
    }

    /// Key size in bytes this variant was constructed with.
    pub fn key_size(&self) -> usize {
        match self {
            Cipher::Rc4 { .. } => 16,
            Cipher::Aes128 { .. } => 16,
            Cipher::Aes256 { .. } => 32,
            Cipher::ChaCha20 { .. } => 32,
        }
    }

    /// Encrypt in place, advancing the outgoing keystream.
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) {
        match self {
            Cipher::Rc4 { encrypt, .. } => encrypt.apply(data),
            Cipher::Aes128 { encrypt, .. } => encrypt.encrypt(data),
            Cipher::Aes256 { encrypt, .. } => encrypt.encrypt(data),
            Cipher::ChaCha20 { encrypt, .. } => encrypt.apply_keystream(data),
        }
    }

    /// Decrypt in place, advancing the incoming keystream.
    pub fn decrypt_in_place(&mut self, data: &mut [u8]) {
        match self {
            Cipher::Rc4 { decrypt, .. } => decrypt.apply(data),
            Cipher::Aes128 { decrypt, .. } => decrypt.decrypt(data),
            Cipher::Aes256 { decrypt, .. } => decrypt.decrypt(data),
            Cipher::ChaCha20 { decrypt, .. } => decrypt.apply_keystream(data),
        }
    }

    /// Encrypt, returning a fresh buffer of the same length.
    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.encrypt_in_place(&mut out);
        out
    }

    /// Decrypt, returning a fresh buffer of the same length.
    pub fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.decrypt_in_place(&mut out);
        out
    }
}

impl Debug for Cipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cipher({:?})", self.kind())
    }
}

/// One direction of RC4 keystream state.
pub struct Rc4State {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4State {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (index, slot) in s.iter_mut().enumerate() {
            *slot = index as u8;
        }
        // KSA
        let mut j = 0u8;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        let mut state = Self { s, i: 0, j: 0 };
        // MSE discards the first 1024 keystream bytes
        let mut discard = [0u8; RC4_DISCARD];
        state.apply(&mut discard);
        state
    }

    /// PRGA: XOR the buffer with the next keystream bytes.
    fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let index = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[index as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_ciphers() -> Vec<(Cipher, Cipher)> {
        let key16 = [0x42u8; 16];
        let key32 = [0x42u8; 32];
        let iv = [0x07u8; 16];
        vec![
            (Cipher::rc4(&key16).unwrap(), Cipher::rc4(&key16).unwrap()),
            (
                Cipher::aes(&key16, &iv).unwrap(),
                Cipher::aes(&key16, &iv).unwrap(),
            ),
            (
                Cipher::aes(&key32, &iv).unwrap(),
                Cipher::aes(&key32, &iv).unwrap(),
            ),
            (
                Cipher::chacha20(&key32, &iv).unwrap(),
                Cipher::chacha20(&key32, &iv).unwrap(),
            ),
        ]
    }

    #[test]
    fn symmetry_across_instances() {
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        for (mut sender, mut receiver) in all_ciphers() {
            let ciphertext = sender.encrypt(plaintext);
            assert_ne!(&ciphertext[..], &plaintext[..]);
            assert_eq!(receiver.decrypt(&ciphertext), plaintext);
        }
    }

    #[test]
    fn length_preservation() {
        for length in [0usize, 1, 15, 16, 17, 1000] {
            let data = vec![0xABu8; length];
            for (mut sender, _) in all_ciphers() {
                assert_eq!(sender.encrypt(&data).len(), length);
            }
        }
    }

    #[test]
    fn concatenation_commutes() {
        let a = b"first half ";
        let b = b"second half";
        for ((mut chunked, mut whole), (mut receiver, _)) in
            all_ciphers().into_iter().zip(all_ciphers())
        {
            let mut split = chunked.encrypt(a);
            split.extend(chunked.encrypt(b));
            let joined = whole.encrypt(&[&a[..], &b[..]].concat());
            assert_eq!(split, joined);
            assert_eq!(receiver.decrypt(&split), [&a[..], &b[..]].concat());
        }
    }

    #[test]
    fn mid_stream_decrypt_is_garbage() {
        let key = [9u8; 16];
        let mut sender = Cipher::rc4(&key).unwrap();
        let mut receiver = Cipher::rc4(&key).unwrap();
        let first = sender.encrypt(b"abcdefgh");
        let second = sender.encrypt(b"ijklmnop");
        // receiver never saw `first`, so `second` cannot decrypt
        assert_ne!(receiver.decrypt(&second), b"ijklmnop");
        let _ = first;
    }

    #[test]
    fn encrypt_and_decrypt_positions_are_independent() {
        let key = [3u8; 16];
        let iv = [5u8; 16];
        let mut local = Cipher::aes(&key, &iv).unwrap();
        let mut remote = Cipher::aes(&key, &iv).unwrap();
        // full-duplex exchange over one instance per endpoint
        let to_remote = local.encrypt(b"ping");
        let to_local = remote.encrypt(b"pong");
        assert_eq!(remote.decrypt(&to_remote), b"ping");
        assert_eq!(local.decrypt(&to_local), b"pong");
    }

    #[test]
    fn construction_validates_material() {
        assert!(Cipher::rc4(&[]).is_err());
        assert!(Cipher::aes(&[0u8; 15], &[0u8; 16]).is_err());
        assert!(Cipher::aes(&[0u8; 16], &[0u8; 12]).is_err());
        assert!(Cipher::chacha20(&[0u8; 16], &[0u8; 16]).is_err());
        assert!(Cipher::chacha20(&[0u8; 32], &[0u8; 12]).is_err());
    }

    #[test]
    fn empty_input_yields_empty_output() {
        for (mut sender, mut receiver) in all_ciphers() {
            assert!(sender.encrypt(&[]).is_empty());
            assert!(receiver.decrypt(&[]).is_empty());
        }
    }

    #[test]
    fn kind_and_key_size() {
        let (rc4, _) = all_ciphers().remove(0);
        assert_eq!(rc4.kind(), CipherKind::Rc4);
        assert_eq!(rc4.key_size(), 16);
        assert_eq!(
            Cipher::chacha20(&[0u8; 32], &[0u8; 16]).unwrap().key_size(),
            32
        );
    }

    #[test]
    fn wire_ids_round_trip() {
        for kind in [CipherKind::Rc4, CipherKind::Aes, CipherKind::ChaCha20] {
            assert_eq!(CipherKind::from_wire_id(kind.wire_id()), Some(kind));
        }
        assert_eq!(CipherKind::from_wire_id(0x00), None);
        assert_eq!(CipherKind::from_wire_id(0x04), None);
    }
}
