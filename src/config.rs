use std::time::Duration;

use rand::Rng;

use crate::{
    crypto::CipherKind,
    error::{PeerWireError, Result},
    protocol::decoder::DEFAULT_MAX_BUFFER_LEN,
};

/// Default outstanding requests per peer.
const DEFAULT_PIPELINE_DEPTH: usize = 8;

/// Whether and how hard to attempt MSE encryption on new connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Never attempt MSE.
    Disabled,
    /// Attempt MSE, fall back to a plain connection on failure.
    Preferred,
    /// MSE or nothing; the connection fails if the handshake does.
    Required,
}

/// Policy knobs for the connection manager and everything beneath it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on simultaneously held connections.
    pub max_connections: usize,
    /// Transport connect deadline.
    pub connect_timeout: Duration,
    /// Per-read deadline during MSE and BitTorrent handshakes.
    pub handshake_timeout: Duration,
    /// Inactivity window after which a connection is pruned.
    pub idle_timeout: Duration,
    /// Cadence of the keep-alive tick.
    pub keep_alive_interval: Duration,
    /// Cadence of the timeout sweep.
    pub sweep_interval: Duration,
    /// Outstanding requests allowed per peer.
    pub pipeline_depth: usize,
    /// How long a single outstanding request may stay unanswered before it
    /// is failed locally.
    pub request_timeout: Duration,
    /// Peers unchoked per choke-rotation round, excluding the optimistic one.
    pub upload_slots: usize,
    pub choke_rotation_interval: Duration,
    pub optimistic_unchoke_interval: Duration,
    /// Bound on one connection's graceful teardown.
    pub disconnect_timeout: Duration,
    /// Bound on the graceful drain of `shutdown`.
    pub shutdown_timeout: Duration,
    pub encryption_mode: EncryptionMode,
    /// Permitted MSE ciphers in preference order.
    pub allowed_ciphers: Vec<CipherKind>,
    /// Bias cipher selection toward RC4 for legacy-client compatibility.
    pub prefer_rc4: bool,
    /// DH group size in bits, 768 or 1024.
    pub dh_key_size: usize,
    /// Our 20-byte peer id.
    pub peer_id: [u8; 20],
    /// Decoder buffer cap; exceeding it is a `BufferOverflow`.
    pub max_buffer_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 50,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(10),
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            request_timeout: Duration::from_secs(60),
            upload_slots: 4,
            choke_rotation_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            encryption_mode: EncryptionMode::Preferred,
            allowed_ciphers: vec![CipherKind::Rc4, CipherKind::Aes],
            prefer_rc4: true,
            dh_key_size: 768,
            peer_id: generate_peer_id(),
            max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
        }
    }
}

impl Config {
    /// Reject out-of-range or self-inconsistent values. Run once at manager
    /// construction; nothing else in the crate re-validates.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(invalid("max_connections must be at least 1"));
        }
        if self.pipeline_depth == 0 {
            return Err(invalid("pipeline_depth must be at least 1"));
        }
        if self.upload_slots == 0 {
            return Err(invalid("upload_slots must be at least 1"));
        }
        if !matches!(self.dh_key_size, 768 | 1024) {
            return Err(invalid("dh_key_size must be 768 or 1024"));
        }
        if self.encryption_mode != EncryptionMode::Disabled && self.allowed_ciphers.is_empty() {
            return Err(invalid(
                "allowed_ciphers must not be empty while encryption is enabled",
            ));
        }
        for duration in [
            self.connect_timeout,
            self.handshake_timeout,
            self.idle_timeout,
            self.keep_alive_interval,
            self.sweep_interval,
            self.request_timeout,
            self.choke_rotation_interval,
            self.optimistic_unchoke_interval,
            self.disconnect_timeout,
            self.shutdown_timeout,
        ] {
            if duration.is_zero() {
                return Err(invalid("timeouts and intervals must be non-zero"));
            }
        }
        if self.max_buffer_len < (1 << 17) + 13 {
            return Err(invalid("max_buffer_len cannot hold a maximum-size piece"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> PeerWireError {
    PeerWireError::InvalidConfig(message.to_string())
}

/// Generate a peer id in the canonical Azureus shape:
/// `-PW0100-` followed by 12 random alphanumeric bytes.
pub fn generate_peer_id() -> [u8; 20] {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-PW0100-");
    for byte in peer_id[8..].iter_mut() {
        *byte = CHARSET[rng.gen_range(0..CHARSET.len())];
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_connections() {
        let config = Config {
            max_connections: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PeerWireError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_unsupported_dh_size() {
        let config = Config {
            dh_key_size: 512,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_cipher_list_when_encrypting() {
        let config = Config {
            allowed_ciphers: vec![],
            encryption_mode: EncryptionMode::Required,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            allowed_ciphers: vec![],
            encryption_mode: EncryptionMode::Disabled,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn generated_peer_id_has_client_prefix() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-PW0100-");
        assert!(peer_id[8..].iter().all(|byte| byte.is_ascii_alphanumeric()));
    }
}
