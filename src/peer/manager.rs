use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{PeerWireError, Result},
    peer::{connection::PeerConnection, ConnectionState},
    protocol::Message,
    provider::{DisconnectReason, PieceProvider, Sink},
    types::{PeerInfo, TorrentDescriptor},
};

/// State shared between the manager handle, its connections, and its
/// background tasks. Connections hold a `Weak` reference, which breaks the
/// manager ↔ connection cycle.
pub(crate) struct Shared {
    pub config: Arc<Config>,
    pub torrent: TorrentDescriptor,
    pub provider: Arc<dyn PieceProvider>,
    sink: RwLock<Option<Arc<dyn Sink>>>,
    /// Guards table membership only; never held across I/O.
    connections: Mutex<HashMap<SocketAddr, Arc<PeerConnection>>>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    /// Address of the current optimistic unchoke, if any.
    optimistic: Mutex<Option<SocketAddr>>,
    last_optimistic: Mutex<Instant>,
}

impl Shared {
    pub fn sink(&self) -> Option<Arc<dyn Sink>> {
        self.sink.read().unwrap().clone()
    }

    pub fn remove(&self, addr: SocketAddr) {
        self.connections.lock().unwrap().remove(&addr);
    }

    /// Clone out the connection handles so callers can iterate without
    /// holding the table lock.
    fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.lock().unwrap().values().cloned().collect()
    }
}

/// Owns every peer connection for one torrent: dials outbound peers,
/// adopts inbound sockets, dispatches events to the registered [`Sink`],
/// and drives keep-alives, idle pruning, and choke rotation.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Validate the configuration and start the background tasks. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: Config,
        torrent: TorrentDescriptor,
        provider: Arc<dyn PieceProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config: Arc::new(config),
            torrent,
            provider,
            sink: RwLock::new(None),
            connections: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            optimistic: Mutex::new(None),
            last_optimistic: Mutex::new(Instant::now()),
        });

        let background = vec![
            tokio::spawn(keep_alive_tick(shared.clone())),
            tokio::spawn(timeout_sweep(shared.clone())),
            tokio::spawn(choke_rotation(shared.clone())),
        ];

        Ok(Self {
            shared,
            background: Mutex::new(background),
        })
    }

    /// Register the event sink. Events fired before registration are
    /// dropped.
    pub fn register_sink(&self, sink: Arc<dyn Sink>) {
        *self.shared.sink.write().unwrap() = Some(sink);
    }

    /// Dial every listed peer that is not already in the table, up to the
    /// connection cap. Returns promptly; each connection proceeds on its
    /// own task. Duplicates are silently skipped.
    pub fn connect_to_peers(&self, peers: impl IntoIterator<Item = PeerInfo>) -> Result<()> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PeerWireError::ShutdownInProgress);
        }

        for peer in peers {
            let conn = {
                let mut table = self.shared.connections.lock().unwrap();
                if table.contains_key(&peer.addr) {
                    continue;
                }
                if table.len() >= self.shared.config.max_connections {
                    debug!("connection cap reached, skipping remaining peers");
                    break;
                }
                let conn = PeerConnection::new(
                    peer.addr,
                    self.shared.torrent,
                    self.shared.config.clone(),
                    Arc::downgrade(&self.shared),
                );
                table.insert(peer.addr, conn.clone());
                conn
            };

            info!("dialing peer {}", peer.addr);
            let task_conn = conn.clone();
            let handle = tokio::spawn(async move {
                let established = task_conn.establish_outbound().await;
                run_connection(task_conn, established).await;
            });
            conn.set_task(handle);
        }
        Ok(())
    }

    /// Adopt a socket accepted by the caller's listener: detect PE vs
    /// plain, respond to the handshake, and run the connection.
    pub fn handle_incoming(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PeerWireError::ShutdownInProgress);
        }

        let conn = {
            let mut table = self.shared.connections.lock().unwrap();
            if table.contains_key(&addr) || table.len() >= self.shared.config.max_connections {
                return Ok(());
            }
            let conn = PeerConnection::new(
                addr,
                self.shared.torrent,
                self.shared.config.clone(),
                Arc::downgrade(&self.shared),
            );
            table.insert(addr, conn.clone());
            conn
        };

        info!("accepted peer {addr}");
        let task_conn = conn.clone();
        let handle = tokio::spawn(async move {
            let established = task_conn.establish_inbound(stream).await;
            run_connection(task_conn, established).await;
        });
        conn.set_task(handle);
        Ok(())
    }

    /// Announce a freshly verified piece to every connected peer.
    /// Best-effort: a failing connection disconnects itself without
    /// aborting the broadcast.
    pub async fn broadcast_have(&self, piece_index: u32) {
        for conn in self.shared.snapshot() {
            if conn.is_connected() {
                let _ = conn.send(Message::Have(piece_index)).await;
            }
        }
    }

    /// Look up the live connection for an address, e.g. to request blocks.
    pub fn connection(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>> {
        self.shared.connections.lock().unwrap().get(&addr).cloned()
    }

    pub async fn disconnect_peer(&self, peer: &PeerInfo) {
        if let Some(conn) = self.connection(peer.addr) {
            conn.disconnect(DisconnectReason::Requested).await;
        }
    }

    /// Disconnect every connection without tearing down the manager.
    pub async fn disconnect_all(&self) {
        drain_connections(self.shared.snapshot(), DisconnectReason::Requested).await;
    }

    /// Stop the background tasks and disconnect everything, waiting up to
    /// the configured drain deadline. Idempotent; operations issued after
    /// this return `ShutdownInProgress`.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down connection manager");
        self.shared.shutdown.cancel();

        let drain = drain_connections(self.shared.snapshot(), DisconnectReason::Shutdown);
        if timeout(self.shared.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("shutdown drain exceeded its deadline");
        }

        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    // ---- snapshot accessors -------------------------------------------

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.shared
            .snapshot()
            .into_iter()
            .filter(|conn| conn.is_connected())
            .map(|conn| conn.peer_info())
            .collect()
    }

    pub fn active_peers(&self) -> Vec<PeerInfo> {
        self.shared
            .snapshot()
            .into_iter()
            .filter(|conn| conn.is_active())
            .map(|conn| conn.peer_info())
            .collect()
    }

    pub fn peer_bitfields(&self) -> HashMap<SocketAddr, Vec<u8>> {
        self.shared
            .snapshot()
            .into_iter()
            .filter_map(|conn| conn.peer_bitfield().map(|bits| (conn.addr(), bits)))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }
}

/// Tear down a set of connections concurrently and wait for all of them.
async fn drain_connections(conns: Vec<Arc<PeerConnection>>, reason: DisconnectReason) {
    let tasks: Vec<JoinHandle<()>> = conns
        .into_iter()
        .map(|conn| {
            let reason = reason.clone();
            tokio::spawn(async move {
                conn.disconnect(reason).await;
            })
        })
        .collect();
    for task in tasks {
        let _ = task.await;
    }
}

/// Drive one connection to completion: run the receive loop after a
/// successful establishment, and translate every exit into exactly one
/// disconnect.
async fn run_connection(
    conn: Arc<PeerConnection>,
    established: Result<crate::peer::stream::SecureReader>,
) {
    match established {
        Ok(reader) => match conn.receive_loop(reader).await {
            // a cancelled loop exits cleanly; a failed send may have
            // parked the real reason beforehand
            Ok(()) => {
                let reason = conn.take_exit_reason();
                conn.disconnect(reason).await;
            }
            Err(err) => {
                warn!("{}: connection failed: {err}", conn.addr());
                conn.disconnect(DisconnectReason::Error(err)).await;
            }
        },
        Err(err) => {
            warn!("{}: could not establish: {err}", conn.addr());
            conn.disconnect(DisconnectReason::Error(err)).await;
        }
    }
}

/// Send a KeepAlive on every active connection that has been quiet for
/// half the idle threshold.
async fn keep_alive_tick(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.keep_alive_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        for conn in shared.snapshot() {
            if conn.is_active() && conn.idle_for() > shared.config.idle_timeout / 2 {
                let _ = conn.send(Message::KeepAlive).await;
            }
        }
    }
}

/// Prune idle connections and expire stale block requests.
async fn timeout_sweep(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        for conn in shared.snapshot() {
            if conn.is_connected() && conn.has_timed_out(shared.config.idle_timeout) {
                debug!("{}: idle timeout", conn.addr());
                conn.disconnect(DisconnectReason::Error(
                    crate::error::TransportError::Timeout.into(),
                ))
                .await;
            } else {
                conn.fail_stale_requests(shared.config.request_timeout);
            }
        }
    }
}

/// Standard tit-for-tat: every rotation, unchoke the best-rate interested
/// peers up to the upload slot count plus one optimistic pick, choke the
/// rest.
async fn choke_rotation(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.choke_rotation_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        rotate_chokes(&shared).await;
    }
}

async fn rotate_chokes(shared: &Shared) {
    let conns: Vec<Arc<PeerConnection>> = shared
        .snapshot()
        .into_iter()
        .filter(|conn| conn.is_active())
        .collect();
    if conns.is_empty() {
        return;
    }

    // rank interested peers by bytes delivered since the previous round
    let mut ranked: Vec<(u64, Arc<PeerConnection>)> = conns
        .iter()
        .map(|conn| (conn.take_rate_sample(), conn.clone()))
        .filter(|(_, conn)| conn.peer_state().peer_interested)
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    let mut unchoked: Vec<SocketAddr> = ranked
        .iter()
        .take(shared.config.upload_slots)
        .map(|(_, conn)| conn.addr())
        .collect();

    // refresh the optimistic pick on its own, slower cadence
    {
        let mut last = shared.last_optimistic.lock().unwrap();
        let mut optimistic = shared.optimistic.lock().unwrap();
        let expired = last.elapsed() >= shared.config.optimistic_unchoke_interval;
        let gone = optimistic.map_or(true, |addr| !conns.iter().any(|c| c.addr() == addr));
        if expired || gone {
            let candidates: Vec<SocketAddr> = ranked
                .iter()
                .map(|(_, conn)| conn.addr())
                .filter(|addr| !unchoked.contains(addr))
                .collect();
            *optimistic = candidates.choose(&mut rand::thread_rng()).copied();
            *last = Instant::now();
        }
        if let Some(addr) = *optimistic {
            unchoked.push(addr);
        }
    }

    for conn in conns {
        if conn.state() == ConnectionState::Error {
            continue;
        }
        let should_unchoke = unchoked.contains(&conn.addr());
        let _ = conn.set_choking(!should_unchoke).await;
    }
}
