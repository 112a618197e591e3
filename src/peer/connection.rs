use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, EncryptionMode},
    crypto::{detect_inbound, CipherKind, CipherSession, Detection, MseHandshake},
    error::{
        HandshakeError, MessageError, PeerWireError, RefuseReason, Result, TransportError,
    },
    peer::{
        bitfield_indices,
        manager::Shared,
        stream::{PrefixedStream, SecureReader, SecureWriter, Transport},
        ConnectionState, PeerState,
    },
    protocol::{handshake::HANDSHAKE_LEN, Handshake, Message, MessageDecoder},
    provider::DisconnectReason,
    types::{BlockInfo, PeerInfo, TorrentDescriptor},
};

/// Read scratch size for the receive loop.
const READ_CHUNK: usize = 16 * 1024;

/// One connection to a remote peer. Created and exclusively owned by the
/// [`ConnectionManager`]; external callers interact through `Arc` handles.
///
/// The receive task owns the read half and the decoder. Everything mutable
/// from outside sits behind short-lived locks: the plain mutexes are never
/// held across await points, and the write half has its own async mutex so
/// outbound messages from one caller arrive in call order.
///
/// [`ConnectionManager`]: crate::peer::ConnectionManager
pub struct PeerConnection {
    addr: SocketAddr,
    peer_id: Mutex<Option<[u8; 20]>>,
    torrent: TorrentDescriptor,
    config: Arc<Config>,
    shared: Weak<Shared>,
    state: Mutex<ConnectionState>,
    peer_state: Mutex<PeerState>,
    outstanding: Mutex<HashMap<BlockInfo, Instant>>,
    last_activity: Mutex<Instant>,
    writer: tokio::sync::Mutex<Option<SecureWriter>>,
    /// Negotiated MSE cipher, if any.
    cipher_kind: Mutex<Option<CipherKind>>,
    /// Total payload bytes received, feeding the choke rotation's rates.
    bytes_received: AtomicU64,
    /// `bytes_received` as of the previous rotation tick.
    rate_mark: AtomicU64,
    /// Reason a failing send recorded for the receive task to report.
    exit_reason: Mutex<Option<DisconnectReason>>,
    /// Handle of the task driving this connection, for forced release.
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    torn_down: AtomicBool,
}

impl PeerConnection {
    pub(crate) fn new(
        addr: SocketAddr,
        torrent: TorrentDescriptor,
        config: Arc<Config>,
        shared: Weak<Shared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            peer_id: Mutex::new(None),
            torrent,
            config,
            shared,
            state: Mutex::new(ConnectionState::Disconnected),
            peer_state: Mutex::new(PeerState::default()),
            outstanding: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            writer: tokio::sync::Mutex::new(None),
            cipher_kind: Mutex::new(None),
            bytes_received: AtomicU64::new(0),
            rate_mark: AtomicU64::new(0),
            exit_reason: Mutex::new(None),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock().unwrap() = Some(handle);
    }

    // ---- accessors ----------------------------------------------------

    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            addr: self.addr,
            peer_id: *self.peer_id.lock().unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Whether the connection has seen no traffic for `window`.
    pub fn has_timed_out(&self, window: Duration) -> bool {
        self.last_activity.lock().unwrap().elapsed() > window
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Snapshot of the per-direction choke/interest state.
    pub fn peer_state(&self) -> PeerState {
        self.peer_state.lock().unwrap().clone()
    }

    /// The peer's bitfield, if one has arrived.
    pub fn peer_bitfield(&self) -> Option<Vec<u8>> {
        self.peer_state.lock().unwrap().bitfield.clone()
    }

    /// Negotiated MSE cipher, or None on a plain connection.
    pub fn cipher_kind(&self) -> Option<CipherKind> {
        *self.cipher_kind.lock().unwrap()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }

    pub(crate) fn take_rate_sample(&self) -> u64 {
        let total = self.bytes_received.load(Ordering::Relaxed);
        let previous = self.rate_mark.swap(total, Ordering::Relaxed);
        total - previous
    }

    /// The reason a failing send parked for the receive task, consumed
    /// when the task winds down.
    pub(crate) fn take_exit_reason(&self) -> DisconnectReason {
        self.exit_reason
            .lock()
            .unwrap()
            .take()
            .unwrap_or(DisconnectReason::Requested)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn provider(&self) -> Option<Arc<dyn crate::provider::PieceProvider>> {
        self.shared.upgrade().map(|shared| shared.provider.clone())
    }

    // ---- connection establishment -------------------------------------

    /// Dial the peer and run the full outbound establishment sequence:
    /// optional MSE, plain handshake, bitfield, initial unchoke. Returns
    /// the reader the receive loop takes over.
    pub(crate) async fn establish_outbound(&self) -> Result<SecureReader> {
        self.set_state(ConnectionState::Connecting);
        let mut stream = self.dial().await?;

        let session = match self.config.encryption_mode {
            EncryptionMode::Disabled => None,
            EncryptionMode::Required => Some(
                self.mse()?
                    .initiate(&mut stream, &self.torrent.info_hash)
                    .await?,
            ),
            EncryptionMode::Preferred => {
                match self
                    .mse()?
                    .initiate(&mut stream, &self.torrent.info_hash)
                    .await
                {
                    Ok(session) => Some(session),
                    Err(err) => {
                        // the MSE attempt consumed stream bytes; fall back
                        // on a fresh dial
                        debug!("{}: mse failed ({err}), retrying plain", self.addr);
                        stream = self.dial().await?;
                        None
                    }
                }
            }
        };

        let (mut reader, mut writer) = self.split(stream, session);

        // outbound sends its handshake first, then reads the peer's
        let ours = Handshake::new(self.torrent.info_hash, self.config.peer_id);
        writer
            .write_all(&ours.encode())
            .await
            .map_err(TransportError::from)?;
        self.set_state(ConnectionState::HandshakeSent);

        let theirs = self.read_handshake(&mut reader).await?;
        self.set_state(ConnectionState::HandshakeReceived);
        self.accept_handshake(theirs)?;
        self.set_state(ConnectionState::Connected);

        self.finish_establish(&mut writer).await?;
        *self.writer.lock().await = Some(writer);
        self.touch();
        self.notify_connected();
        Ok(reader)
    }

    /// Establishment for an accepted socket: PE detection, optional MSE
    /// response, then the mirror-image plain handshake exchange.
    pub(crate) async fn establish_inbound(&self, stream: TcpStream) -> Result<SecureReader> {
        self.set_state(ConnectionState::Connecting);

        let mut raw = stream;
        let (detection, consumed) = detect_inbound(&mut raw, self.config.handshake_timeout).await;
        let mut stream = PrefixedStream::new(raw, consumed);

        let session = match (detection, self.config.encryption_mode) {
            (Detection::Encrypted, EncryptionMode::Disabled) => {
                return Err(HandshakeError::BadProtocol.into());
            }
            (Detection::Encrypted, _) => Some(
                self.mse()?
                    .respond(&mut stream, &self.torrent.info_hash)
                    .await?,
            ),
            (Detection::Plain, EncryptionMode::Required) => {
                // plain fallback is disallowed
                return Err(HandshakeError::BadProtocol.into());
            }
            (Detection::Plain, _) => None,
        };

        let (mut reader, mut writer) = self.split(stream, session);

        // inbound reads the initiator's handshake before answering
        let theirs = self.read_handshake(&mut reader).await?;
        self.set_state(ConnectionState::HandshakeReceived);
        self.accept_handshake(theirs)?;

        let ours = Handshake::new(self.torrent.info_hash, self.config.peer_id);
        writer
            .write_all(&ours.encode())
            .await
            .map_err(TransportError::from)?;
        self.set_state(ConnectionState::Connected);

        self.finish_establish(&mut writer).await?;
        *self.writer.lock().await = Some(writer);
        self.touch();
        self.notify_connected();
        Ok(reader)
    }

    async fn dial(&self) -> Result<Transport> {
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)?;
        Ok(PrefixedStream::new(stream, Vec::new()))
    }

    fn mse(&self) -> Result<MseHandshake> {
        MseHandshake::new(
            self.config.dh_key_size,
            self.config.prefer_rc4,
            self.config.allowed_ciphers.clone(),
            self.config.handshake_timeout,
        )
    }

    fn split(
        &self,
        stream: Transport,
        session: Option<CipherSession>,
    ) -> (SecureReader, SecureWriter) {
        let (read_half, write_half) = tokio::io::split(stream);
        match session {
            Some(session) => {
                *self.cipher_kind.lock().unwrap() = Some(session.kind);
                (
                    SecureReader::new(read_half, Some(session.incoming)),
                    SecureWriter::new(write_half, Some(session.outgoing)),
                )
            }
            None => (
                SecureReader::new(read_half, None),
                SecureWriter::new(write_half, None),
            ),
        }
    }

    async fn read_handshake(&self, reader: &mut SecureReader) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        timeout(self.config.handshake_timeout, reader.read_exact(&mut buf))
            .await
            .map_err(|_| HandshakeError::Timeout)?
            .map_err(TransportError::from)?;
        Handshake::decode(&buf)
    }

    fn accept_handshake(&self, theirs: Handshake) -> Result<()> {
        if theirs.info_hash != self.torrent.info_hash {
            return Err(HandshakeError::InfoHashMismatch.into());
        }
        *self.peer_id.lock().unwrap() = Some(theirs.peer_id);
        Ok(())
    }

    /// Send our bitfield and the initial unchoke that lets the peer start
    /// requesting.
    async fn finish_establish(&self, writer: &mut SecureWriter) -> Result<()> {
        if self.torrent.num_pieces > 0 {
            let bitfield = self
                .provider()
                .map(|provider| provider.bitfield())
                .unwrap_or_else(|| vec![0u8; self.torrent.bitfield_len()]);
            writer
                .write_all(&Message::Bitfield(bitfield).encode())
                .await
                .map_err(TransportError::from)?;
            self.note_bitfield_sent();
        }

        writer
            .write_all(&Message::Unchoke.encode())
            .await
            .map_err(TransportError::from)?;
        self.peer_state.lock().unwrap().am_choking = false;
        Ok(())
    }

    fn notify_connected(&self) {
        // a disconnect can win the race against a slow establishment
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        debug!("{}: connected ({:?})", self.addr, self.cipher_kind());
        if let Some(shared) = self.shared.upgrade() {
            if let Some(sink) = shared.sink() {
                sink.on_peer_connected(self);
            }
        }
    }

    // ---- state transitions --------------------------------------------

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Both directions complete → Active; otherwise remember ours went out.
    /// The check runs before the mutation so the complement is observable.
    fn note_bitfield_sent(&self) {
        let mut state = self.state.lock().unwrap();
        *state = if *state == ConnectionState::BitfieldReceived {
            ConnectionState::Active
        } else {
            ConnectionState::BitfieldSent
        };
    }

    fn note_bitfield_received(&self) {
        let mut state = self.state.lock().unwrap();
        *state = if *state == ConnectionState::BitfieldSent {
            ConnectionState::Active
        } else {
            ConnectionState::BitfieldReceived
        };
    }

    // ---- outbound operations ------------------------------------------

    /// Encode and write one message. A failing write marks the connection
    /// Error and schedules its teardown.
    pub async fn send(&self, message: Message) -> Result<()> {
        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer
                    .write_all(&message.encode())
                    .await
                    .map_err(|err| PeerWireError::from(TransportError::from(err))),
                None => Err(TransportError::Io("connection closed".to_string()).into()),
            }
        };

        match result {
            Ok(()) => {
                trace!("{}: sent {}", self.addr, message.name());
                self.touch();
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Error);
                // park the reason and wake the receive task to tear down
                let mut exit_reason = self.exit_reason.lock().unwrap();
                if exit_reason.is_none() {
                    *exit_reason = Some(DisconnectReason::Error(err.clone()));
                }
                drop(exit_reason);
                self.cancel.cancel();
                Err(err)
            }
        }
    }

    /// Request one block, enforcing the choke state and the pipeline
    /// depth. Refusals are local and leave no trace on the wire.
    pub async fn request_block(&self, block: BlockInfo) -> Result<()> {
        {
            if !self.is_active() {
                return Err(PeerWireError::RequestRefused(RefuseReason::NotActive));
            }
            if self.peer_state.lock().unwrap().peer_choking {
                return Err(PeerWireError::RequestRefused(RefuseReason::Choked));
            }
            let mut outstanding = self.outstanding.lock().unwrap();
            if outstanding.len() >= self.config.pipeline_depth {
                return Err(PeerWireError::RequestRefused(RefuseReason::PipelineFull));
            }
            outstanding.insert(block, Instant::now());
        }

        if let Err(err) = self.send(Message::Request(block)).await {
            self.outstanding.lock().unwrap().remove(&block);
            return Err(err);
        }
        Ok(())
    }

    /// Cancel a pending block request, if it is still pending. Best-effort:
    /// the peer may have the data in flight already.
    pub async fn cancel_block(&self, block: BlockInfo) -> Result<()> {
        if self.outstanding.lock().unwrap().remove(&block).is_some() {
            self.send(Message::Cancel(block)).await?;
        }
        Ok(())
    }

    /// Tell the peer whether we want blocks from it.
    pub async fn set_interested(&self, interested: bool) -> Result<()> {
        let message = {
            let mut peer_state = self.peer_state.lock().unwrap();
            if peer_state.am_interested == interested {
                return Ok(());
            }
            peer_state.am_interested = interested;
            if interested {
                Message::Interested
            } else {
                Message::NotInterested
            }
        };
        self.send(message).await
    }

    /// Choke or unchoke the peer. The manager's rotation drives this on a
    /// schedule; callers replacing that policy may drive it directly.
    pub async fn set_choking(&self, choking: bool) -> Result<()> {
        let message = {
            let mut peer_state = self.peer_state.lock().unwrap();
            if peer_state.am_choking == choking {
                return Ok(());
            }
            peer_state.am_choking = choking;
            if choking {
                Message::Choke
            } else {
                Message::Unchoke
            }
        };
        self.send(message).await
    }

    // ---- teardown ------------------------------------------------------

    /// Idempotent teardown: cancel the receive task, close the transport,
    /// fail outstanding requests, notify the sink once, and drop out of
    /// the manager's table.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("{}: disconnecting ({reason})", self.addr);

        self.cancel.cancel();
        if matches!(reason, DisconnectReason::Error(_)) {
            self.set_state(ConnectionState::Error);
        } else {
            self.set_state(ConnectionState::Disconnected);
        }

        let close = async {
            if let Some(mut writer) = self.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        };
        let close_timed_out = timeout(self.config.disconnect_timeout, close).await.is_err();
        if close_timed_out {
            warn!("{}: teardown exceeded its deadline", self.addr);
        }

        self.fail_outstanding();

        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.addr);
            if let Some(sink) = shared.sink() {
                sink.on_peer_disconnected(self, &reason);
            }
        }

        // a task wedged in a blocked write survives cooperative
        // cancellation; force-release it last
        if close_timed_out {
            if let Some(task) = self.task.lock().unwrap().take() {
                task.abort();
            }
        }
    }

    /// Report every pending request as failed so the scheduler can requeue.
    fn fail_outstanding(&self) {
        let pending: Vec<BlockInfo> = {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.drain().map(|(block, _)| block).collect()
        };
        if pending.is_empty() {
            return;
        }
        let peer = self.peer_info();
        if let Some(provider) = self.provider() {
            for block in pending {
                provider.request_failed(&peer, block);
            }
        }
    }

    /// Fail requests older than the per-request deadline without touching
    /// the connection itself.
    pub(crate) fn fail_stale_requests(&self, deadline: Duration) {
        let stale: Vec<BlockInfo> = {
            let mut outstanding = self.outstanding.lock().unwrap();
            let stale: Vec<BlockInfo> = outstanding
                .iter()
                .filter(|(_, issued_at)| issued_at.elapsed() > deadline)
                .map(|(block, _)| *block)
                .collect();
            for block in &stale {
                outstanding.remove(block);
            }
            stale
        };
        if stale.is_empty() {
            return;
        }
        debug!("{}: {} requests timed out", self.addr, stale.len());
        let peer = self.peer_info();
        if let Some(provider) = self.provider() {
            for block in stale {
                provider.request_failed(&peer, block);
            }
        }
    }

    // ---- receive loop --------------------------------------------------

    /// Read transport bytes, decode frames, dispatch messages, until the
    /// connection errors, hits EOF, or is cancelled.
    pub(crate) async fn receive_loop(&self, mut reader: SecureReader) -> Result<()> {
        let mut decoder = MessageDecoder::with_buffer_limit(self.config.max_buffer_len);
        let mut scratch = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = reader.read(&mut scratch) => {
                    let n = read.map_err(TransportError::from)?;
                    if n == 0 {
                        return Err(TransportError::UnexpectedEof.into());
                    }
                    self.touch();
                    decoder.feed(&scratch[..n])?;
                    while let Some(message) = decoder.next_message()? {
                        self.dispatch(message).await?;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: Message) -> Result<()> {
        trace!("{}: received {}", self.addr, message.name());
        match message {
            Message::KeepAlive => {}
            Message::Choke => self.handle_choke(),
            Message::Unchoke => {
                self.peer_state.lock().unwrap().peer_choking = false;
                if self.state() == ConnectionState::Choked {
                    self.set_state(ConnectionState::Active);
                }
            }
            Message::Interested => {
                self.peer_state.lock().unwrap().peer_interested = true;
            }
            Message::NotInterested => {
                self.peer_state.lock().unwrap().peer_interested = false;
            }
            Message::Have(index) => self.handle_have(index)?,
            Message::Bitfield(bitfield) => self.handle_bitfield(bitfield)?,
            Message::Request(block) => self.handle_request(block).await?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.handle_piece(index, begin, block),
            Message::Cancel(block) => {
                // requests are served synchronously on receipt, so there is
                // no outbound queue to purge
                trace!("{}: peer cancelled {block}", self.addr);
            }
        }
        Ok(())
    }

    fn handle_choke(&self) {
        self.peer_state.lock().unwrap().peer_choking = true;
        if self.state() == ConnectionState::Active {
            self.set_state(ConnectionState::Choked);
        }
        // outstanding requests will not be served while choked
        self.fail_outstanding();
    }

    fn handle_have(&self, index: u32) -> Result<()> {
        if index >= self.torrent.num_pieces {
            return Err(MessageError::InvalidPiece.into());
        }
        self.peer_state.lock().unwrap().peer_has.insert(index);
        if let Some(shared) = self.shared.upgrade() {
            if let Some(sink) = shared.sink() {
                sink.on_piece_available(self, index);
            }
        }
        Ok(())
    }

    fn handle_bitfield(&self, bitfield: Vec<u8>) -> Result<()> {
        if bitfield.len() != self.torrent.bitfield_len() {
            return Err(MessageError::MalformedLength {
                message_type: 5,
                got: bitfield.len() as u32,
            }
            .into());
        }
        {
            let mut peer_state = self.peer_state.lock().unwrap();
            // a bitfield may only appear once, as the first message
            if peer_state.bitfield.is_some() {
                return Err(MessageError::UnexpectedBitfield.into());
            }
            peer_state
                .peer_has
                .extend(bitfield_indices(&bitfield, self.torrent.num_pieces));
            peer_state.bitfield = Some(bitfield.clone());
        }
        self.note_bitfield_received();

        if let Some(shared) = self.shared.upgrade() {
            if let Some(sink) = shared.sink() {
                sink.on_bitfield_received(self, &bitfield);
            }
        }
        Ok(())
    }

    /// Serve a peer's block request from the provider, if we have the data
    /// and are not choking them.
    async fn handle_request(&self, block: BlockInfo) -> Result<()> {
        if self.peer_state.lock().unwrap().am_choking {
            trace!("{}: ignoring request {block} while choking", self.addr);
            return Ok(());
        }
        let Some(provider) = self.provider() else {
            return Ok(());
        };
        let Some(data) = provider.read_block(block) else {
            debug!("{}: cannot serve {block}", self.addr);
            return Ok(());
        };
        self.send(Message::Piece {
            index: block.piece,
            begin: block.begin,
            block: data,
        })
        .await
    }

    fn handle_piece(&self, index: u32, begin: u32, block: Vec<u8>) {
        let key = BlockInfo {
            piece: index,
            begin,
            length: block.len() as u32,
        };
        let known = self.outstanding.lock().unwrap().remove(&key).is_some();
        if !known {
            // likely the answer to a request our CANCEL crossed in flight
            trace!("{}: discarding unsolicited block {key}", self.addr);
            return;
        }
        self.bytes_received
            .fetch_add(block.len() as u64, Ordering::Relaxed);
        if let Some(shared) = self.shared.upgrade() {
            if let Some(sink) = shared.sink() {
                sink.on_block_received(self, index, begin, &block);
            }
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}
