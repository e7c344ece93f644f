use std::collections::VecDeque;
use std::net::SocketAddrV4;

use anyhow::Context;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::config::ClientConfig;
use crate::peer::connect_peer;
use crate::reactor::{DownloadOutcome, Reactor};
use crate::scheduler::RequestQueue;
use crate::storage::PieceStorage;
use crate::torrent_meta::TorrentMeta;

/// Work that message handlers schedule instead of doing it right away, so that the set of
/// connections is never mutated while the reactor is still dispatching reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredTask {
    /// Pick the next piece to request from this connection
    DetermineNextRequest(SocketAddrV4),
    /// Send the request that was picked for this connection
    SendRequest(SocketAddrV4),
    /// Some requests were released: give every idle connection a chance to take them
    WakeIdlePeers,
}

impl DeferredTask {
    pub fn category(&self) -> TaskCategory {
        match self {
            DeferredTask::DetermineNextRequest(_) | DeferredTask::WakeIdlePeers => TaskCategory::Logic,
            DeferredTask::SendRequest(_) => TaskCategory::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    Logic,
    Write,
}

/// FIFO queues of deferred tasks, one per category.
///
/// Logic tasks are always handed out before write tasks, and tasks of one category come out in
/// the order they were pushed.
#[derive(Debug, Default)]
pub struct TaskQueue {
    logic: VecDeque<DeferredTask>,
    write: VecDeque<DeferredTask>,
}

impl TaskQueue {
    pub fn push(&mut self, task: DeferredTask) {
        match task.category() {
            TaskCategory::Logic => self.logic.push_back(task),
            TaskCategory::Write => self.write.push_back(task),
        }
    }

    pub fn pop(&mut self) -> Option<DeferredTask> {
        self.logic.pop_front().or_else(|| self.write.pop_front())
    }

    pub fn len(&self) -> usize {
        self.logic.len() + self.write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logic.is_empty() && self.write.is_empty()
    }
}

/// State shared by every peer connection of one torrent
pub struct Session<S> {
    pub meta: TorrentMeta,
    pub storage: S,
    pub requests: RequestQueue,
    pub tasks: TaskQueue,
    pub max_hash_failures: usize,
}

impl<S: PieceStorage> Session<S> {
    pub fn new(meta: TorrentMeta, storage: S, max_hash_failures: usize) -> Self {
        Session {
            meta,
            storage,
            requests: RequestQueue::new(),
            tasks: TaskQueue::default(),
            max_hash_failures,
        }
    }

    /// Piece indices that still have to be downloaded
    pub fn missing_pieces(&self) -> Vec<u32> {
        self.storage
            .have_bitfield()
            .iter_zeros()
            .map(|idx| idx as u32)
            .collect()
    }
}

/// Connects to the given peers and downloads as much of the torrent as they can give us
#[tracing::instrument(err, skip_all, fields(peers = peers.len()))]
pub async fn download<S: PieceStorage>(
    meta: TorrentMeta,
    storage: S,
    peers: Vec<SocketAddrV4>,
    peer_id: [u8; 20],
    config: &ClientConfig,
    stop_rx: oneshot::Receiver<()>,
) -> anyhow::Result<DownloadOutcome> {
    let info_hash = meta.info_hash;
    let session = Session::new(meta, storage, config.max_hash_failures);
    let mut reactor: Reactor<OwnedWriteHalf, S> = Reactor::new(session, config);

    let mut handshakes = JoinSet::new();
    for peer_addr in peers.into_iter().take(config.max_peers) {
        let timeout = config.connect_timeout;
        handshakes.spawn(async move { (peer_addr, connect_peer(peer_addr, info_hash, peer_id, timeout).await) });
    }

    while let Some(joined) = handshakes.join_next().await {
        let (peer_addr, result) = joined.context("handshake task")?;
        match result {
            Ok((stream, handshake)) => {
                let (reader, writer) = stream.into_split();
                reactor.register(peer_addr, reader, writer, handshake.peer_id);
            }
            Err(e) => tracing::debug!(%peer_addr, "failed to connect to a peer: {:#}", e),
        }
    }

    tracing::info!(connected = reactor.connections(), "finished connecting to peers");

    Ok(reactor.run(stop_rx).await?)
}
