//! Fixtures shared by the connection and reactor tests: a three-piece torrent kept in memory

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use leechbit_wire::{BittorrentP2pMessage, Block, Encode, FrameDecoder};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::session::Session;
use crate::storage::{FileInfo, MemoryStorage, StorageManager, TorrentFileMetadata};
use crate::torrent_meta::TorrentMeta;

pub const PIECE_LENGTH: usize = 16;
pub const TOTAL_LENGTH: usize = 40;
pub const INFO_HASH: [u8; 20] = [0x11; 20];

pub type TestSession = Session<StorageManager<MemoryStorage>>;

pub fn piece(index: u32) -> Vec<u8> {
    let meta = meta();
    let size = meta.piece_size(index).expect("valid index");
    vec![index as u8 + 1; size]
}

pub fn contents() -> Vec<u8> {
    (0..3).flat_map(piece).collect()
}

pub fn meta() -> TorrentMeta {
    let hashes = (0..3u8)
        .flat_map(|idx| {
            let size = if idx == 2 { TOTAL_LENGTH - 2 * PIECE_LENGTH } else { PIECE_LENGTH };
            let digest: [u8; 20] = Sha1::new_with_prefix(vec![idx + 1; size]).finalize().into();
            digest
        })
        .collect::<Vec<u8>>();
    TorrentMeta::new(INFO_HASH, PIECE_LENGTH, TOTAL_LENGTH, &hashes).expect("valid metadata")
}

/// Two files, so that the middle piece crosses a file boundary
pub fn session(max_hash_failures: usize) -> TestSession {
    let file_metadata = TorrentFileMetadata {
        file_infos: vec![
            FileInfo::new(PathBuf::from("first"), 24),
            FileInfo::new(PathBuf::from("second"), 16),
        ],
    };
    let backend = MemoryStorage::new(&file_metadata.file_infos);
    let meta = meta();
    let storage = StorageManager::new(backend, file_metadata, meta.number_of_pieces);
    Session::new(meta, storage, max_hash_failures)
}

pub fn stored_contents(session: &TestSession) -> Vec<u8> {
    let backend = session.storage.backend();
    [backend.file(0), backend.file(1)].concat()
}

pub fn addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

pub async fn encode_all(messages: &[BittorrentP2pMessage]) -> Vec<u8> {
    let mut out = Vec::new();
    for message in messages {
        message.encode(&mut out).await.expect("encoding into a vec can't fail");
    }
    out
}

/// A bitfield message padded to whole bytes, as it travels on the wire
pub fn bitfield(bits: &[bool]) -> BittorrentP2pMessage {
    let mut bitvec = bits.iter().copied().collect::<BitVec<u8, Msb0>>();
    bitvec.resize(bits.len().div_ceil(8) * 8, false);
    BittorrentP2pMessage::Bitfield(bitvec)
}

#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    Honest,
    /// Answers every request with garbage
    Corrupt,
    /// Hangs up instead of answering the first request
    HangUp,
    /// Serves this many pieces, then hangs up
    CloseAfter(usize),
    /// Never says anything
    Silent,
    /// Announces its pieces but never unchokes
    Stingy,
    /// Announces its pieces with `have` only and unchokes once the client is interested
    HaveOnly,
}

/// A remote peer that has some pieces. Returns every requested piece index once the
/// connection is gone.
pub async fn seeder<T>(mut stream: T, have: [bool; 3], behaviour: Behaviour) -> Vec<u32>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut requested = Vec::new();
    let hello = match behaviour {
        Behaviour::Silent => Vec::new(),
        Behaviour::Stingy => encode_all(&[bitfield(&have)]).await,
        Behaviour::HaveOnly => {
            let haves = (0..3u32)
                .filter(|idx| have[*idx as usize])
                .map(BittorrentP2pMessage::Have)
                .collect::<Vec<_>>();
            encode_all(&haves).await
        }
        _ => encode_all(&[bitfield(&have), BittorrentP2pMessage::Unchoke]).await,
    };
    if stream.write_all(&hello).await.is_err() {
        return requested;
    }

    let mut decoder = FrameDecoder::new(1 << 16);
    let mut buf = vec![0; 1024];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return requested,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);

        while let Some(message) = decoder.decode_next().expect("the client sends valid messages") {
            let request = match message {
                BittorrentP2pMessage::Interested if matches!(behaviour, Behaviour::HaveOnly) => {
                    let unchoke = encode_all(&[BittorrentP2pMessage::Unchoke]).await;
                    if stream.write_all(&unchoke).await.is_err() {
                        return requested;
                    }
                    continue;
                }
                BittorrentP2pMessage::Request(request) => request,
                _ => continue,
            };
            requested.push(request.index);
            assert!(have[request.index as usize], "asked for a piece the peer doesn't have");
            if matches!(behaviour, Behaviour::Stingy) {
                continue;
            }

            let block = match behaviour {
                Behaviour::HangUp => return requested,
                Behaviour::Corrupt => vec![0xEE; request.length as usize],
                _ => piece(request.index),
            };
            assert_eq!(block.len(), request.length as usize);

            let answer = encode_all(&[BittorrentP2pMessage::Piece(Block {
                index: request.index,
                begin: 0,
                block: block.into(),
            })])
            .await;
            if stream.write_all(&answer).await.is_err() {
                return requested;
            }

            if matches!(behaviour, Behaviour::CloseAfter(limit) if requested.len() >= limit) {
                return requested;
            }
        }
    }
}

/// A writer that accepts everything for the first `full_writes` writes and only half of the
/// buffer afterwards. Counts every write attempt.
pub struct ShortWriter {
    full_writes: usize,
    attempts: Arc<AtomicUsize>,
}

impl ShortWriter {
    pub fn new(full_writes: usize) -> (Self, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            ShortWriter {
                full_writes,
                attempts: attempts.clone(),
            },
            attempts,
        )
    }
}

impl AsyncWrite for ShortWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let accepted = if attempt < self.full_writes { buf.len() } else { buf.len() / 2 };
        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
