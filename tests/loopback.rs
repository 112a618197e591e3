//! End-to-end scenarios over real loopback TCP sockets: two connection
//! managers, one seeding a small torrent, one leeching.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::net::TcpListener;

use peerwire::{
    BlockInfo, CipherKind, Config, ConnectionManager, DisconnectReason, EncryptionMode,
    HandshakeError, InfoHash, Message, PeerInfo, PeerWireError, PieceProvider, RefuseReason,
    Sink, TorrentDescriptor, TransportError,
};

const PIECE_LENGTH: u32 = 65536;
const BLOCK: u32 = 16384;

fn torrent() -> TorrentDescriptor {
    TorrentDescriptor {
        info_hash: InfoHash([0u8; 20]),
        num_pieces: 2,
        piece_length: PIECE_LENGTH,
    }
}

/// Config with intervals long enough to stay out of short tests' way.
fn quiet_config() -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config {
        connect_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        keep_alive_interval: Duration::from_secs(120),
        choke_rotation_interval: Duration::from_secs(120),
        optimistic_unchoke_interval: Duration::from_secs(120),
        sweep_interval: Duration::from_secs(120),
        encryption_mode: EncryptionMode::Disabled,
        ..Config::default()
    }
}

/// Serves every block of a torrent whose content is all 0xAA, unless
/// serving is switched off.
struct Seeder {
    descriptor: TorrentDescriptor,
    serving: AtomicBool,
    failed: Mutex<Vec<BlockInfo>>,
}

impl Seeder {
    fn new(descriptor: TorrentDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            serving: AtomicBool::new(true),
            failed: Mutex::new(Vec::new()),
        })
    }
}

impl PieceProvider for Seeder {
    fn bitfield(&self) -> Vec<u8> {
        let mut bits = vec![0u8; self.descriptor.bitfield_len()];
        for piece in 0..self.descriptor.num_pieces {
            bits[(piece / 8) as usize] |= 0x80 >> (piece % 8);
        }
        bits
    }

    fn read_block(&self, block: BlockInfo) -> Option<Vec<u8>> {
        if !self.serving.load(Ordering::SeqCst) {
            return None;
        }
        (block.piece < self.descriptor.num_pieces
            && block.begin + block.length <= self.descriptor.piece_length)
            .then(|| vec![0xAA; block.length as usize])
    }

    fn request_failed(&self, _peer: &PeerInfo, block: BlockInfo) {
        self.failed.lock().unwrap().push(block);
    }
}

/// Has nothing, records failed requests.
struct Leecher {
    descriptor: TorrentDescriptor,
    failed: Mutex<Vec<BlockInfo>>,
}

impl Leecher {
    fn new(descriptor: TorrentDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            failed: Mutex::new(Vec::new()),
        })
    }
}

impl PieceProvider for Leecher {
    fn bitfield(&self) -> Vec<u8> {
        vec![0u8; self.descriptor.bitfield_len()]
    }

    fn read_block(&self, _block: BlockInfo) -> Option<Vec<u8>> {
        None
    }

    fn request_failed(&self, _peer: &PeerInfo, block: BlockInfo) {
        self.failed.lock().unwrap().push(block);
    }
}

/// Event sink that records everything it sees.
#[derive(Default)]
struct Events {
    connected: Mutex<Vec<SocketAddr>>,
    disconnected: Mutex<Vec<(SocketAddr, DisconnectReason)>>,
    bitfields: Mutex<HashMap<SocketAddr, Vec<u8>>>,
    available: Mutex<Vec<(SocketAddr, u32)>>,
    blocks: Mutex<Vec<(u32, u32, Vec<u8>)>>,
}

impl Sink for Events {
    fn on_peer_connected(&self, conn: &peerwire::PeerConnection) {
        self.connected.lock().unwrap().push(conn.addr());
    }

    fn on_peer_disconnected(&self, conn: &peerwire::PeerConnection, reason: &DisconnectReason) {
        self.disconnected
            .lock()
            .unwrap()
            .push((conn.addr(), reason.clone()));
    }

    fn on_bitfield_received(&self, conn: &peerwire::PeerConnection, bitfield: &[u8]) {
        self.bitfields
            .lock()
            .unwrap()
            .insert(conn.addr(), bitfield.to_vec());
    }

    fn on_piece_available(&self, conn: &peerwire::PeerConnection, piece: u32) {
        self.available.lock().unwrap().push((conn.addr(), piece));
    }

    fn on_block_received(
        &self,
        _conn: &peerwire::PeerConnection,
        piece: u32,
        begin: u32,
        block: &[u8],
    ) {
        self.blocks
            .lock()
            .unwrap()
            .push((piece, begin, block.to_vec()));
    }
}

/// Poll until `predicate` holds, failing after a deadline.
async fn wait_for(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A manager listening on loopback, adopting every accepted socket.
async fn listen(manager: Arc<ConnectionManager>) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((stream, peer_addr)) = listener.accept().await {
            if manager.handle_incoming(stream, peer_addr).is_err() {
                break;
            }
        }
    });
    Ok(addr)
}

struct Endpoint {
    manager: Arc<ConnectionManager>,
    events: Arc<Events>,
    addr: SocketAddr,
}

/// Stand up a seeder endpoint with a listener and a leecher manager that
/// has not dialed yet.
async fn seeder_endpoint(config: Config) -> Result<(Endpoint, Arc<Seeder>)> {
    let provider = Seeder::new(torrent());
    let manager = Arc::new(ConnectionManager::new(config, torrent(), provider.clone())?);
    let events = Arc::new(Events::default());
    manager.register_sink(events.clone());
    let addr = listen(manager.clone()).await?;
    Ok((
        Endpoint {
            manager,
            events,
            addr,
        },
        provider,
    ))
}

fn leecher_endpoint(config: Config) -> Result<(Endpoint, Arc<Leecher>)> {
    let provider = Leecher::new(torrent());
    let manager = Arc::new(ConnectionManager::new(config, torrent(), provider.clone())?);
    let events = Arc::new(Events::default());
    manager.register_sink(events.clone());
    Ok((
        Endpoint {
            manager,
            events,
            addr: "0.0.0.0:0".parse().unwrap(),
        },
        provider,
    ))
}

async fn connect_and_activate(leecher: &Endpoint, seeder_addr: SocketAddr) {
    leecher
        .manager
        .connect_to_peers(vec![PeerInfo::new(seeder_addr)])
        .unwrap();
    let manager = leecher.manager.clone();
    wait_for("leecher connection to become active", move || {
        manager
            .connection(seeder_addr)
            .map_or(false, |conn| conn.is_active())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_handshake_and_block_transfer() -> Result<()> {
    let (seeder, _) = seeder_endpoint(quiet_config()).await?;
    let (leecher, _) = leecher_endpoint(quiet_config())?;

    connect_and_activate(&leecher, seeder.addr).await;
    let conn = leecher.manager.connection(seeder.addr).unwrap();

    // both sides report the connection
    assert_eq!(leecher.events.connected.lock().unwrap().len(), 1);
    let seeder_events = seeder.events.clone();
    wait_for("seeder to become active", move || {
        !seeder_events.connected.lock().unwrap().is_empty()
    })
    .await;

    // the seeder's bitfield has both pieces set
    let bitfields = leecher.events.bitfields.lock().unwrap().clone();
    assert_eq!(bitfields.get(&seeder.addr).unwrap(), &vec![0xC0]);
    assert!(conn.peer_state().has_piece(0));
    assert!(conn.peer_state().has_piece(1));

    // interested → (already unchoked on connect) → request → piece
    conn.set_interested(true).await?;
    let events = leecher.events.clone();
    wait_for("initial unchoke", {
        let conn = conn.clone();
        move || !conn.peer_state().peer_choking
    })
    .await;

    conn.request_block(BlockInfo {
        piece: 0,
        begin: 0,
        length: BLOCK,
    })
    .await?;
    wait_for("block arrival", move || {
        !events.blocks.lock().unwrap().is_empty()
    })
    .await;

    let blocks = leecher.events.blocks.lock().unwrap();
    let (piece, begin, block) = &blocks[0];
    assert_eq!((*piece, *begin), (0, 0));
    assert_eq!(block.len(), BLOCK as usize);
    assert!(block.iter().all(|&byte| byte == 0xAA));
    assert_eq!(conn.outstanding_requests(), 0);

    drop(blocks);
    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_handshake_with_required_rc4() -> Result<()> {
    let encrypted = |mut config: Config| {
        config.encryption_mode = EncryptionMode::Required;
        config.allowed_ciphers = vec![CipherKind::Rc4];
        config.dh_key_size = 768;
        config
    };
    let (seeder, _) = seeder_endpoint(encrypted(quiet_config())).await?;
    let (leecher, _) = leecher_endpoint(encrypted(quiet_config()))?;

    connect_and_activate(&leecher, seeder.addr).await;
    let conn = leecher.manager.connection(seeder.addr).unwrap();
    assert_eq!(conn.cipher_kind(), Some(CipherKind::Rc4));

    // the encrypted channel carries a working handshake and payload both
    // ways: the peer id decrypted correctly and blocks flow
    assert!(conn.peer_info().peer_id.is_some());
    conn.set_interested(true).await?;
    conn.request_block(BlockInfo {
        piece: 1,
        begin: BLOCK,
        length: BLOCK,
    })
    .await?;
    let events = leecher.events.clone();
    wait_for("encrypted block arrival", move || {
        !events.blocks.lock().unwrap().is_empty()
    })
    .await;

    let blocks = leecher.events.blocks.lock().unwrap();
    assert_eq!((blocks[0].0, blocks[0].1), (1, BLOCK));
    assert!(blocks[0].2.iter().all(|&byte| byte == 0xAA));

    drop(blocks);
    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cipher_negotiation_mismatch_fails_both_sides() -> Result<()> {
    let with = |ciphers: Vec<CipherKind>, mut config: Config| {
        config.encryption_mode = EncryptionMode::Required;
        config.allowed_ciphers = ciphers;
        config
    };
    let (seeder, _) = seeder_endpoint(with(vec![CipherKind::Rc4], quiet_config())).await?;
    let (leecher, _) = leecher_endpoint(with(vec![CipherKind::Aes], quiet_config()))?;

    leecher
        .manager
        .connect_to_peers(vec![PeerInfo::new(seeder.addr)])
        .unwrap();

    let events = leecher.events.clone();
    wait_for("initiator-side disallowed-cipher failure", move || {
        events.disconnected.lock().unwrap().iter().any(|(_, reason)| {
            matches!(
                reason,
                DisconnectReason::Error(PeerWireError::Handshake(
                    HandshakeError::DisallowedCipher(_)
                ))
            )
        })
    })
    .await;

    // no connection reached an active state anywhere
    assert!(leecher.events.connected.lock().unwrap().is_empty());
    assert!(seeder.events.connected.lock().unwrap().is_empty());
    let leecher_manager = leecher.manager.clone();
    wait_for("tables to drain", move || {
        leecher_manager.connection_count() == 0
    })
    .await;
    assert!(leecher.events.blocks.lock().unwrap().is_empty());

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn choke_unchoke_cycle() -> Result<()> {
    let (seeder, seeder_provider) = seeder_endpoint(quiet_config()).await?;
    let (leecher, leecher_provider) = leecher_endpoint(quiet_config())?;

    connect_and_activate(&leecher, seeder.addr).await;
    let conn = leecher.manager.connection(seeder.addr).unwrap();
    conn.set_interested(true).await?;

    // find the seeder's handle for the leecher
    let seeder_manager = seeder.manager.clone();
    wait_for("seeder active", move || {
        !seeder_manager.active_peers().is_empty()
    })
    .await;
    let leecher_addr = seeder.manager.active_peers()[0].addr;
    let seeder_conn = seeder.manager.connection(leecher_addr).unwrap();

    // choke the leecher: its local requests are refused with no wire bytes
    seeder_conn.set_choking(true).await?;
    wait_for("choke to propagate", {
        let conn = conn.clone();
        move || conn.peer_state().peer_choking
    })
    .await;
    assert_eq!(conn.state(), peerwire::ConnectionState::Choked);
    let refused = conn
        .request_block(BlockInfo {
            piece: 0,
            begin: 0,
            length: BLOCK,
        })
        .await;
    assert!(matches!(
        refused,
        Err(PeerWireError::RequestRefused(RefuseReason::Choked))
    ));
    assert_eq!(conn.outstanding_requests(), 0);

    // unchoke: the request goes through and data arrives
    seeder_conn.set_choking(false).await?;
    wait_for("unchoke to propagate", {
        let conn = conn.clone();
        move || !conn.peer_state().peer_choking
    })
    .await;
    assert_eq!(conn.state(), peerwire::ConnectionState::Active);
    conn.request_block(BlockInfo {
        piece: 0,
        begin: 0,
        length: BLOCK,
    })
    .await?;
    let events = leecher.events.clone();
    wait_for("block after unchoke", move || {
        !events.blocks.lock().unwrap().is_empty()
    })
    .await;

    // park a request the seeder will not serve, then choke: the pending
    // request is failed back to the piece provider
    seeder_provider.serving.store(false, Ordering::SeqCst);
    let parked = BlockInfo {
        piece: 1,
        begin: 0,
        length: BLOCK,
    };
    conn.request_block(parked).await?;
    assert_eq!(conn.outstanding_requests(), 1);
    seeder_conn.set_choking(true).await?;
    wait_for("pending request failed on choke", {
        let leecher_provider = leecher_provider.clone();
        move || leecher_provider.failed.lock().unwrap().contains(&parked)
    })
    .await;
    assert_eq!(conn.outstanding_requests(), 0);

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_message_disconnects_only_that_peer() -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // a hostile peer that handshakes correctly, then sends a frame with an
    // absurd length prefix
    let hostile = TcpListener::bind("127.0.0.1:0").await?;
    let hostile_addr = hostile.local_addr()?;
    tokio::spawn(async move {
        let (mut stream, _) = hostile.accept().await.unwrap();
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await.unwrap();
        stream.write_all(&handshake).await.unwrap();
        // a legal empty-ish bitfield, then garbage
        stream
            .write_all(&Message::Bitfield(vec![0x00]).encode())
            .await
            .unwrap();
        stream
            .write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00])
            .await
            .unwrap();
        // hold the socket open so the close comes from the victim
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (seeder, _) = seeder_endpoint(quiet_config()).await?;
    let (leecher, _) = leecher_endpoint(quiet_config())?;

    connect_and_activate(&leecher, seeder.addr).await;
    leecher
        .manager
        .connect_to_peers(vec![PeerInfo::new(hostile_addr)])
        .unwrap();

    let events = leecher.events.clone();
    wait_for("oversize frame to disconnect the hostile peer", move || {
        events.disconnected.lock().unwrap().iter().any(|(addr, reason)| {
            *addr == hostile_addr
                && matches!(
                    reason,
                    DisconnectReason::Error(PeerWireError::Message(
                        peerwire::MessageError::MessageTooLarge(_)
                    ))
                )
        })
    })
    .await;

    // exactly one disconnect for the hostile peer, and the healthy
    // connection is untouched
    let count = leecher
        .events
        .disconnected
        .lock()
        .unwrap()
        .iter()
        .filter(|(addr, _)| *addr == hostile_addr)
        .count();
    assert_eq!(count, 1);
    let conn = leecher.manager.connection(seeder.addr).unwrap();
    assert!(conn.is_active());
    assert!(leecher.manager.connection(hostile_addr).is_none());

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_alives_hold_the_connection_open() -> Result<()> {
    let lively = |mut config: Config| {
        config.keep_alive_interval = Duration::from_millis(150);
        config.idle_timeout = Duration::from_millis(900);
        config.sweep_interval = Duration::from_millis(100);
        config
    };
    let (seeder, _) = seeder_endpoint(lively(quiet_config())).await?;
    let (leecher, _) = leecher_endpoint(lively(quiet_config()))?;

    connect_and_activate(&leecher, seeder.addr).await;

    // several idle windows pass with nothing but keep-alives
    tokio::time::sleep(Duration::from_millis(2000)).await;
    let conn = leecher.manager.connection(seeder.addr).unwrap();
    assert!(conn.is_active());
    assert!(leecher.events.disconnected.lock().unwrap().is_empty());

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_timeout_disconnects_without_keep_alives() -> Result<()> {
    // the leecher never sends keep-alives and prunes aggressively; the
    // seeder would keep the connection alive for much longer
    let leecher_config = {
        let mut config = quiet_config();
        config.idle_timeout = Duration::from_millis(700);
        config.sweep_interval = Duration::from_millis(100);
        config
    };
    let (seeder, _) = seeder_endpoint(quiet_config()).await?;
    let (leecher, _) = leecher_endpoint(leecher_config)?;

    connect_and_activate(&leecher, seeder.addr).await;

    let events = leecher.events.clone();
    wait_for("idle timeout disconnect", move || {
        events.disconnected.lock().unwrap().iter().any(|(addr, reason)| {
            *addr == seeder.addr
                && matches!(
                    reason,
                    DisconnectReason::Error(PeerWireError::Transport(TransportError::Timeout))
                )
        })
    })
    .await;
    assert!(leecher.manager.connection(seeder.addr).is_none());

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn preferred_encryption_falls_back_to_plain() -> Result<()> {
    // seeder refuses MSE outright; a Preferred leecher retries plain
    let (seeder, _) = seeder_endpoint(quiet_config()).await?;
    let leecher_config = {
        let mut config = quiet_config();
        config.encryption_mode = EncryptionMode::Preferred;
        config.allowed_ciphers = vec![CipherKind::Rc4];
        config.handshake_timeout = Duration::from_millis(500);
        config
    };
    let (leecher, _) = leecher_endpoint(leecher_config)?;

    connect_and_activate(&leecher, seeder.addr).await;
    let conn = leecher.manager.connection(seeder.addr).unwrap();
    assert_eq!(conn.cipher_kind(), None);

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_depth_is_enforced() -> Result<()> {
    let leecher_config = {
        let mut config = quiet_config();
        config.pipeline_depth = 2;
        config
    };
    let (seeder, seeder_provider) = seeder_endpoint(quiet_config()).await?;
    let (leecher, _) = leecher_endpoint(leecher_config)?;

    // park requests by disabling serving
    seeder_provider.serving.store(false, Ordering::SeqCst);

    connect_and_activate(&leecher, seeder.addr).await;
    let conn = leecher.manager.connection(seeder.addr).unwrap();
    conn.set_interested(true).await?;

    for begin in [0, BLOCK] {
        conn.request_block(BlockInfo {
            piece: 0,
            begin,
            length: BLOCK,
        })
        .await?;
    }
    assert_eq!(conn.outstanding_requests(), 2);

    let overflow = conn
        .request_block(BlockInfo {
            piece: 0,
            begin: 2 * BLOCK,
            length: BLOCK,
        })
        .await;
    assert!(matches!(
        overflow,
        Err(PeerWireError::RequestRefused(RefuseReason::PipelineFull))
    ));
    assert_eq!(conn.outstanding_requests(), 2);

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_have_reaches_connected_peers() -> Result<()> {
    let (seeder, _) = seeder_endpoint(quiet_config()).await?;
    let (leecher, _) = leecher_endpoint(quiet_config())?;

    connect_and_activate(&leecher, seeder.addr).await;

    leecher.manager.broadcast_have(1).await;
    let events = seeder.events.clone();
    wait_for("have to arrive at the seeder", move || {
        events
            .available
            .lock()
            .unwrap()
            .iter()
            .any(|(_, piece)| *piece == 1)
    })
    .await;

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn choke_rotation_unchokes_interested_peers() -> Result<()> {
    let seeder_config = {
        let mut config = quiet_config();
        config.choke_rotation_interval = Duration::from_millis(200);
        config.optimistic_unchoke_interval = Duration::from_millis(400);
        config
    };
    let (seeder, _) = seeder_endpoint(seeder_config).await?;
    let (leecher, _) = leecher_endpoint(quiet_config())?;

    connect_and_activate(&leecher, seeder.addr).await;
    let conn = leecher.manager.connection(seeder.addr).unwrap();

    // not interested: the rotation takes back the initial unchoke
    wait_for("rotation to choke an uninterested peer", {
        let conn = conn.clone();
        move || conn.peer_state().peer_choking
    })
    .await;

    // interested: the next rotation grants a slot (optimistic or regular)
    conn.set_interested(true).await?;
    wait_for("rotation to unchoke an interested peer", {
        let conn = conn.clone();
        move || !conn.peer_state().peer_choking
    })
    .await;

    leecher.manager.shutdown().await;
    seeder.manager.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_terminal_and_idempotent() -> Result<()> {
    let (seeder, _) = seeder_endpoint(quiet_config()).await?;
    let (leecher, _) = leecher_endpoint(quiet_config())?;

    connect_and_activate(&leecher, seeder.addr).await;

    leecher.manager.shutdown().await;
    leecher.manager.shutdown().await;
    assert_eq!(leecher.manager.connection_count(), 0);
    assert!(matches!(
        leecher.manager.connect_to_peers(vec![PeerInfo::new(seeder.addr)]),
        Err(PeerWireError::ShutdownInProgress)
    ));

    // the leecher's departure is observed as a shutdown reason locally
    assert!(leecher
        .events
        .disconnected
        .lock()
        .unwrap()
        .iter()
        .any(|(_, reason)| *reason == DisconnectReason::Shutdown));

    seeder.manager.shutdown().await;
    Ok(())
}
