use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::peer::PeerConnection;
use crate::session::{DeferredTask, Session};
use crate::storage::PieceStorage;
use crate::{ErrorKind, Result};

#[derive(Debug)]
pub enum ReadEventKind {
    Data(Bytes),
    /// The peer closed its side of the connection
    Closed,
    Failed(io::Error),
}

/// Readiness report from a connection's reader task
#[derive(Debug)]
pub struct ReadEvent {
    pub peer_addr: SocketAddrV4,
    pub kind: ReadEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Complete,
    Incomplete { missing: Vec<u32> },
}

struct Registered<W> {
    connection: PeerConnection<W>,
    reader: JoinHandle<()>,
}

/// Drives every peer connection of a torrent from a single task.
///
/// Sockets are read by small per-connection tasks that only forward bytes; everything else
/// (parsing, scheduling, hashing, writing) happens here, one event at a time, so the shared
/// request queue and the have-bitfield never need a lock.
pub struct Reactor<W, S> {
    session: Session<S>,
    connections: HashMap<SocketAddrV4, Registered<W>>,
    events_tx: mpsc::UnboundedSender<ReadEvent>,
    events_rx: mpsc::UnboundedReceiver<ReadEvent>,
    rng: StdRng,
    poll_interval: Duration,
    read_buffer_size: usize,
}

impl<W, S> Reactor<W, S>
where
    W: AsyncWrite + Unpin,
    S: PieceStorage,
{
    pub fn new(session: Session<S>, config: &ClientConfig) -> Self {
        Self::with_rng(session, config, StdRng::from_entropy())
    }

    pub fn with_rng(session: Session<S>, config: &ClientConfig, rng: StdRng) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Reactor {
            session,
            connections: HashMap::new(),
            events_tx,
            events_rx,
            rng,
            poll_interval: config.poll_interval,
            read_buffer_size: config.read_buffer_size,
        }
    }

    pub fn session(&self) -> &Session<S> {
        &self.session
    }

    pub fn into_session(self) -> Session<S> {
        self.session
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// Starts tracking a connection that already went through the handshake.
    /// Returns `false` if this peer is connected already.
    pub fn register<R>(&mut self, peer_addr: SocketAddrV4, reader: R, writer: W, remote_peer_id: [u8; 20]) -> bool
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.connections.contains_key(&peer_addr) {
            tracing::debug!(%peer_addr, "the peer is already connected, dropping the new connection");
            return false;
        }

        let connection = PeerConnection::new(
            peer_addr,
            remote_peer_id,
            writer,
            self.session.meta.max_message_length(),
        );
        let reader = tokio::spawn(read_pump(
            peer_addr,
            reader,
            self.read_buffer_size,
            self.events_tx.clone(),
        ));
        self.connections.insert(peer_addr, Registered { connection, reader });
        tracing::debug!(%peer_addr, connections = self.connections.len(), "registered a peer");

        true
    }

    /// Runs until every piece is downloaded, every connection is gone or `stop_rx` fires.
    /// Only a fatal error stops it early; problems with single peers just drop those peers.
    #[tracing::instrument(err, skip_all)]
    pub async fn run(&mut self, mut stop_rx: oneshot::Receiver<()>) -> Result<DownloadOutcome> {
        // A dropped sender means nobody will ever ask us to stop
        let mut stop_armed = true;
        let mut batch = Vec::new();

        loop {
            if self.session.storage.is_complete() {
                tracing::info!("download complete");
                break;
            }
            if self.connections.is_empty() {
                tracing::info!("no connected peers left");
                break;
            }

            tokio::select! {
                event = tokio::time::timeout(self.poll_interval, self.events_rx.recv()) => {
                    if let Ok(Some(event)) = event {
                        batch.push(event);
                    }
                }
                result = &mut stop_rx, if stop_armed => {
                    if result.is_ok() {
                        tracing::info!("stop requested");
                        break;
                    }
                    stop_armed = false;
                    continue;
                }
            }

            while let Ok(event) = self.events_rx.try_recv() {
                batch.push(event);
            }

            for event in batch.drain(..) {
                self.handle_read_event(event).await?;
            }

            self.drain_deferred_tasks().await?;
        }

        self.close_all();

        let missing = self.session.missing_pieces();
        if missing.is_empty() {
            Ok(DownloadOutcome::Complete)
        } else {
            Ok(DownloadOutcome::Incomplete { missing })
        }
    }

    async fn handle_read_event(&mut self, event: ReadEvent) -> Result<()> {
        let ReadEvent { peer_addr, kind } = event;
        // Killed earlier during this pass
        let Some(registered) = self.connections.get_mut(&peer_addr) else {
            return Ok(());
        };

        match kind {
            ReadEventKind::Data(data) => {
                let result = registered.connection.process_input(&data, &mut self.session).await;
                match result {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::Fatal => return Err(e),
                    Err(e) => {
                        tracing::warn!(%peer_addr, "dropping the peer: {}", e);
                        self.kill(peer_addr);
                    }
                }
            }
            ReadEventKind::Closed => {
                tracing::debug!(%peer_addr, "the peer closed the connection");
                self.kill(peer_addr);
            }
            ReadEventKind::Failed(e) => {
                tracing::warn!(%peer_addr, "error while reading from the peer: {}", e);
                self.kill(peer_addr);
            }
        }

        Ok(())
    }

    /// Drops the connection and gives its claimed pieces back to everyone else
    fn kill(&mut self, peer_addr: SocketAddrV4) {
        let Some(registered) = self.connections.remove(&peer_addr) else {
            return;
        };
        registered.reader.abort();

        let released = self.session.requests.release_owned_by(peer_addr);
        if !released.is_empty() {
            tracing::debug!(%peer_addr, ?released, "released pieces of a dropped peer");
            self.session.tasks.push(DeferredTask::WakeIdlePeers);
        }

        let peer_id = String::from_utf8_lossy(registered.connection.remote_peer_id());
        tracing::info!(%peer_addr, %peer_id, connections = self.connections.len(), "peer disconnected");
    }

    async fn drain_deferred_tasks(&mut self) -> Result<()> {
        while let Some(task) = self.session.tasks.pop() {
            tracing::trace!(?task, "running a deferred task");
            match task {
                DeferredTask::DetermineNextRequest(peer_addr) => {
                    if let Some(registered) = self.connections.get_mut(&peer_addr) {
                        registered
                            .connection
                            .determine_next_request(&mut self.session, &mut self.rng);
                    }
                }
                DeferredTask::WakeIdlePeers => {
                    for registered in self.connections.values_mut() {
                        if registered.connection.is_idle() {
                            registered
                                .connection
                                .determine_next_request(&mut self.session, &mut self.rng);
                        }
                    }
                }
                DeferredTask::SendRequest(peer_addr) => {
                    let result = match self.connections.get_mut(&peer_addr) {
                        Some(registered) => registered.connection.send_request(&self.session).await,
                        None => continue,
                    };
                    match result {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::Fatal => return Err(e),
                        Err(e) => {
                            tracing::warn!(%peer_addr, "failed to send a request: {}", e);
                            self.kill(peer_addr);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn close_all(&mut self) {
        for (_, registered) in self.connections.drain() {
            registered.reader.abort();
        }
        self.session.requests = Default::default();
    }
}

/// Forwards everything read from the socket to the reactor until the socket closes
async fn read_pump<R>(peer_addr: SocketAddrV4, mut reader: R, buffer_size: usize, tx: mpsc::UnboundedSender<ReadEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        buf.reserve(buffer_size);
        let kind = match reader.read_buf(&mut buf).await {
            Ok(0) => ReadEventKind::Closed,
            Ok(_) => ReadEventKind::Data(buf.split().freeze()),
            Err(e) => ReadEventKind::Failed(e),
        };

        let finished = !matches!(kind, ReadEventKind::Data(_));
        if tx.send(ReadEvent { peer_addr, kind }).is_err() || finished {
            break;
        }
    }
}
