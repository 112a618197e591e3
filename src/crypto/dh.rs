use lazy_static::lazy_static;
use num_bigint::{BigUint, RandBigInt};
use num_traits::Zero;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    error::{PeerWireError, Result},
    types::InfoHash,
};

/// Bit length of DH private exponents. MSE peers use short exponents; 160
/// bits matches the strength of the SHA-1 derivation downstream.
const PRIVATE_KEY_BITS: u64 = 160;

/// Default key-derivation pad: 20 zero bytes.
pub const ZERO_PAD: [u8; 20] = [0x00; 20];
/// Domain-separation pad used to derive IVs and nonces from the same secret.
pub const IV_PAD: [u8; 20] = [0xFF; 20];

lazy_static! {
    /// The well-known 768-bit MSE prime. Using any other group breaks
    /// interoperability with existing BitTorrent clients.
    static ref MSE_PRIME_768: BigUint = BigUint::parse_bytes(
        b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
          020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
          4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A36210000000000090563",
        16,
    )
    .expect("valid hex constant");

    /// RFC 2409 Oakley group 2, the standard 1024-bit MODP group.
    static ref OAKLEY_PRIME_1024: BigUint = BigUint::parse_bytes(
        b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
          020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
          4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
          EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF",
        16,
    )
    .expect("valid hex constant");
}

/// A generated DH keypair within one of the fixed groups.
#[derive(Clone, Debug)]
pub struct DhKeyPair {
    pub private: BigUint,
    pub public: BigUint,
}

/// Finite-field Diffie-Hellman over the fixed MSE groups, generator 2.
#[derive(Clone, Debug)]
pub struct DhExchange {
    key_size: usize,
    prime: &'static BigUint,
}

impl DhExchange {
    /// Create an exchange for a 768-bit or 1024-bit group.
    pub fn new(key_size: usize) -> Result<Self> {
        let prime: &'static BigUint = match key_size {
            768 => &MSE_PRIME_768,
            1024 => &OAKLEY_PRIME_1024,
            other => {
                return Err(PeerWireError::InvalidConfig(format!(
                    "dh key size must be 768 or 1024 bits, got {other}"
                )))
            }
        };
        Ok(Self { key_size, prime })
    }

    /// Group size in bytes; public keys and shared secrets serialize to
    /// exactly this many big-endian bytes.
    pub fn public_key_len(&self) -> usize {
        (self.key_size + 7) / 8
    }

    /// Generate a fresh keypair: `public = 2^private mod p`.
    pub fn generate_keypair(&self) -> DhKeyPair {
        let mut rng = rand::thread_rng();
        let mut private = rng.gen_biguint(PRIVATE_KEY_BITS);
        while private.is_zero() {
            private = rng.gen_biguint(PRIVATE_KEY_BITS);
        }
        let public = BigUint::from(2u8).modpow(&private, self.prime);
        DhKeyPair { private, public }
    }

    /// Serialize a public key as a fixed-width big-endian integer.
    pub fn public_key_bytes(&self, keypair: &DhKeyPair) -> Vec<u8> {
        to_padded_be(&keypair.public, self.public_key_len())
    }

    /// Reconstruct a peer public key from its big-endian wire bytes.
    pub fn public_key_from_bytes(&self, bytes: &[u8]) -> BigUint {
        BigUint::from_bytes_be(bytes)
    }

    /// Compute the shared secret `peer_public^private mod p`, serialized
    /// big-endian and padded to the group size.
    pub fn compute_shared_secret(&self, private: &BigUint, peer_public: &BigUint) -> Vec<u8> {
        let secret = peer_public.modpow(private, self.prime);
        to_padded_be(&secret, self.public_key_len())
    }
}

/// MSE key derivation: `SHA1(secret ∥ pad ∥ info_hash)`. The pad defaults
/// to 20 zero bytes; overriding it provides domain separation (IVs, nonces).
pub fn derive_key(secret: &[u8], info_hash: &InfoHash, pad: Option<&[u8]>) -> [u8; 20] {
    let mut digest = Sha1::new();
    digest.update(secret);
    digest.update(pad.unwrap_or(&ZERO_PAD));
    digest.update(info_hash.as_bytes());
    digest.finalize().into()
}

/// SHA-256 variant of the derivation, used where 32 bytes of key material
/// are needed (ChaCha20).
pub fn derive_key_sha256(secret: &[u8], info_hash: &InfoHash, pad: Option<&[u8]>) -> [u8; 32] {
    let mut digest = Sha256::new();
    digest.update(secret);
    digest.update(pad.unwrap_or(&ZERO_PAD));
    digest.update(info_hash.as_bytes());
    digest.finalize().into()
}

fn to_padded_be(value: &BigUint, width: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    let mut out = vec![0u8; width.saturating_sub(raw.len())];
    out.extend_from_slice(&raw);
    out
}
