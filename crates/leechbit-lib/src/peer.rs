use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::Context;
use bitvec::bitvec;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use leechbit_wire::{BittorrentP2pMessage, Block, BlockRequest, Decode, Encode, FrameDecoder, Handshake};
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::scheduler::pick_next_piece;
use crate::session::{DeferredTask, Session};
use crate::storage::PieceStorage;
use crate::{Error, ErrorKind, Result, WithTimeout};

/// Opens a TCP connection to the peer and exchanges handshakes with it
#[tracing::instrument(err(level = "debug"), skip(info_hash, peer_id))]
pub async fn connect_peer(
    peer_addr: SocketAddrV4,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    timeout: Duration,
) -> anyhow::Result<(TcpStream, Handshake)> {
    let mut stream = TcpStream::connect(peer_addr)
        .with_timeout("peer connect", timeout)
        .await
        .context("establishing connection with a peer")?;

    tracing::trace!("connected to a peer");

    let handshake = exchange_handshakes(&mut stream, info_hash, peer_id)
        .with_timeout("handshake", timeout)
        .await
        .context("exchanging handshakes")?;

    Ok((stream, handshake))
}

/// Sends our handshake and reads the peer's one, which must be for the same torrent
pub async fn exchange_handshakes<S>(stream: &mut S, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Handshake::new(info_hash, peer_id).encode(stream).await?;

    let mut buf = [0; Handshake::LENGTH];
    stream.read_exact(&mut buf).await?;

    let handshake = Handshake::decode(&buf)?;
    handshake
        .validate(&info_hash)
        .map_err(|_| Error::BadInfoHash(handshake.info_hash))?;

    Ok(handshake)
}

/// State of a single link to a remote peer after a successful handshake.
///
/// The reading half of the socket lives elsewhere; raw bytes are handed in through
/// [`PeerConnection::process_input`] in the order they arrived.
pub struct PeerConnection<W> {
    peer_addr: SocketAddrV4,
    remote_peer_id: [u8; 20],
    writer: W,
    decoder: FrameDecoder,
    /// Pieces that the remote peer has. `None` until a `bitfield` or `have` arrives
    remote_bitfield: Option<BitVec<u8, Msb0>>,
    /// Whether the remote peer choked the client
    is_choking_us: bool,
    /// Whether the client is interested in the remote peer
    are_we_interested: bool,
    /// Whether the client chokes the remote peer
    are_we_choking: bool,
    /// Whether the remote peer is interested in the client
    is_interested_in_us: bool,
    /// The piece claimed in the shared request queue for this connection
    next_requested_index: Option<u32>,
    /// Whether the `request` for `next_requested_index` went out
    request_in_flight: bool,
    hash_failures: usize,
}

impl<W: AsyncWrite + Unpin> PeerConnection<W> {
    pub fn new(peer_addr: SocketAddrV4, remote_peer_id: [u8; 20], writer: W, max_message_length: usize) -> Self {
        PeerConnection {
            peer_addr,
            remote_peer_id,
            writer,
            decoder: FrameDecoder::new(max_message_length),
            remote_bitfield: None,
            is_choking_us: true,
            are_we_interested: false,
            are_we_choking: true,
            is_interested_in_us: false,
            next_requested_index: None,
            request_in_flight: false,
            hash_failures: 0,
        }
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer_addr
    }

    pub fn remote_peer_id(&self) -> &[u8; 20] {
        &self.remote_peer_id
    }

    pub fn next_requested_index(&self) -> Option<u32> {
        self.next_requested_index
    }

    /// Nothing is claimed for this connection right now
    pub fn is_idle(&self) -> bool {
        self.next_requested_index.is_none()
    }

    /// Runs the framing state machine over one socket read and dispatches every message that
    /// became complete. An error means that the connection has to be dropped.
    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all, fields(peer_addr = %self.peer_addr, len = data.len()))]
    pub async fn process_input<S: PieceStorage>(&mut self, data: &[u8], session: &mut Session<S>) -> Result<()> {
        self.decoder.extend(data);

        while let Some(message) = self.decoder.decode_next()? {
            match self.handle_message(message, session).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Integrity && self.hash_failures < session.max_hash_failures => {
                    tracing::warn!(peer_addr = %self.peer_addr, hash_failures = self.hash_failures, "{}", e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all)]
    async fn handle_message<S: PieceStorage>(
        &mut self,
        message: BittorrentP2pMessage,
        session: &mut Session<S>,
    ) -> Result<()> {
        use BittorrentP2pMessage::*;
        tracing::trace!(message_id = ?message.message_id(), "handling a message");

        match message {
            Choke => {
                // A choking peer drops pending requests and may never unchoke, so the claim goes
                // back to the other peers
                self.is_choking_us = true;
                self.request_in_flight = false;
                if let Some(index) = self.next_requested_index.take() {
                    session.requests.remove(index);
                    tracing::debug!(peer_addr = %self.peer_addr, piece_idx = index, "choked, released the piece");
                    session.tasks.push(DeferredTask::WakeIdlePeers);
                }
            }
            Unchoke => {
                self.is_choking_us = false;
                if self.is_idle() {
                    session.tasks.push(DeferredTask::DetermineNextRequest(self.peer_addr));
                }
            }
            Interested | NotInterested => {
                self.is_interested_in_us = matches!(message, Interested);
                tracing::trace!(interested = self.is_interested_in_us, "peer changed its interest");
            }
            Have(piece_idx) => {
                let number_of_pieces = session.meta.number_of_pieces;
                let idx = try_into!(piece_idx, usize)?;
                if idx >= number_of_pieces {
                    return Err(Error::WrongPieceIndex(piece_idx, try_into!(number_of_pieces, u32)?));
                }

                self.remote_bitfield
                    .get_or_insert_with(|| bitvec![u8, Msb0; 0; number_of_pieces])
                    .set(idx, true);

                // Peers that never send a bitfield only unchoke us once we're interested
                self.send_interested().await?;
                if self.is_idle() {
                    session.tasks.push(DeferredTask::DetermineNextRequest(self.peer_addr));
                }
            }
            Bitfield(mut bitvec) => {
                // Remove spare bits, a short bitfield means that the rest is missing
                bitvec.resize(session.meta.number_of_pieces, false);
                tracing::debug!(pieces = bitvec.count_ones(), "received a bitfield");
                self.remote_bitfield = Some(bitvec);

                // We can start asking for pieces now
                self.send_interested().await?;
                self.send_unchoke().await?;
                session.tasks.push(DeferredTask::DetermineNextRequest(self.peer_addr));
            }
            Request(BlockRequest { index, begin, length }) => {
                tracing::trace!(index, begin, length, "received a Request message from peer");
            }
            Piece(block) => self.handle_piece(block, session)?,
            Cancel(BlockRequest { index, begin, length }) => {
                tracing::trace!(index, begin, length, "received a Cancel message from peer");
            }
            Port(port) => {
                tracing::trace!(?port, "received a Port message");
            }
            KeepAlive => {
                tracing::trace!("KeepAlive");
            }
        };

        Ok(())
    }

    fn handle_piece<S: PieceStorage>(&mut self, block: Block, session: &mut Session<S>) -> Result<()> {
        let Block { index, begin, block } = block;

        if self.next_requested_index != Some(index) || begin != 0 {
            tracing::debug!(index, begin, "ignoring a block that wasn't requested");
            return Ok(());
        }

        // Whatever the outcome, this claim is over and the peer can be asked for more work
        self.next_requested_index = None;
        self.request_in_flight = false;
        session.requests.remove(index);
        session.tasks.push(DeferredTask::DetermineNextRequest(self.peer_addr));

        let expected = *session.meta.piece_hash(index)?;
        let actual: [u8; 20] = Sha1::new_with_prefix(&block).finalize().into();
        if actual != expected {
            self.hash_failures += 1;
            // The piece is up for grabs again
            session.tasks.push(DeferredTask::WakeIdlePeers);
            return Err(Error::PieceHashMismatch { index, expected, actual });
        }

        let offset = session.meta.piece_offset(index)?;
        session.storage.seek(offset);
        session.storage.write_block(&block).map_err(Error::StorageError)?;
        session.storage.mark_complete(index).map_err(Error::StorageError)?;
        tracing::info!(piece_idx = index, peer_addr = %self.peer_addr, "piece verified");

        if session.storage.is_complete() {
            session.storage.close().map_err(Error::StorageError)?;
            tracing::info!("all pieces are downloaded");
        }

        Ok(())
    }

    /// Claims a piece that this peer can give us and nobody else is downloading
    pub fn determine_next_request<S, R>(&mut self, session: &mut Session<S>, rng: &mut R)
    where
        S: PieceStorage,
        R: Rng + ?Sized,
    {
        // Claims are only made while unchoked, the unchoke queues another attempt
        if !self.is_idle() || self.is_choking_us {
            return;
        }
        let Some(remote_bitfield) = self.remote_bitfield.as_ref() else {
            return;
        };

        let Some(index) = pick_next_piece(session.storage.have_bitfield(), remote_bitfield, &session.requests, rng)
        else {
            tracing::trace!(peer_addr = %self.peer_addr, "the peer has nothing we need right now");
            return;
        };

        if session.requests.add(index, self.peer_addr) {
            tracing::debug!(peer_addr = %self.peer_addr, piece_idx = index, "claimed a piece");
            self.next_requested_index = Some(index);
            session.tasks.push(DeferredTask::SendRequest(self.peer_addr));
        }
    }

    /// Asks the peer for the whole claimed piece
    #[tracing::instrument(level = "trace", err(level = "debug"), skip_all, fields(peer_addr = %self.peer_addr))]
    pub async fn send_request<S: PieceStorage>(&mut self, session: &Session<S>) -> Result<()> {
        let Some(index) = self.next_requested_index else {
            return Ok(());
        };
        if self.request_in_flight || self.is_choking_us {
            return Ok(());
        }

        let length = try_into!(session.meta.piece_size(index)?, u32)?;
        self.write_packet(BittorrentP2pMessage::Request(BlockRequest { index, begin: 0, length }))
            .await?;
        self.request_in_flight = true;
        tracing::trace!(index, length, "sent a request");

        Ok(())
    }

    async fn send_interested(&mut self) -> Result<()> {
        if !self.are_we_interested {
            self.write_packet(BittorrentP2pMessage::Interested).await?;
            self.are_we_interested = true;
        }
        Ok(())
    }

    async fn send_unchoke(&mut self) -> Result<()> {
        if self.are_we_choking {
            self.write_packet(BittorrentP2pMessage::Unchoke).await?;
            self.are_we_choking = false;
        }
        Ok(())
    }

    /// Sends one message with a single write; a partial write leaves the stream in an unknown
    /// state, so it's reported as an error
    async fn write_packet(&mut self, message: BittorrentP2pMessage) -> Result<()> {
        let mut packet = Vec::with_capacity(message.encoded_len());
        message.encode(&mut packet).await?;

        let written = self.writer.write(&packet).await?;
        if written != packet.len() {
            return Err(Error::ShortWrite {
                expected: packet.len(),
                written,
            });
        }
        self.writer.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::testing::{self, addr, bitfield, encode_all, piece, ShortWriter, TestSession, INFO_HASH};

    const PEER: u16 = 7000;

    fn connection(session: &TestSession) -> PeerConnection<Vec<u8>> {
        PeerConnection::new(addr(PEER), [7; 20], Vec::new(), session.meta.max_message_length())
    }

    fn piece_message(index: u32, block: Vec<u8>) -> BittorrentP2pMessage {
        BittorrentP2pMessage::Piece(Block {
            index,
            begin: 0,
            block: Bytes::from(block),
        })
    }

    fn drain(session: &mut TestSession) -> Vec<DeferredTask> {
        std::iter::from_fn(|| session.tasks.pop()).collect()
    }

    fn claim(conn: &mut PeerConnection<Vec<u8>>, session: &mut TestSession, index: u32) {
        assert!(session.requests.add(index, conn.peer_addr));
        conn.next_requested_index = Some(index);
        conn.request_in_flight = true;
    }

    #[tokio::test]
    async fn bitfield_declares_interest_and_unchokes() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);

        let input = encode_all(&[bitfield(&[true, false, true])]).await;
        conn.process_input(&input, &mut session).await.expect("valid input");

        assert_eq!(conn.writer, vec![0, 0, 0, 1, 2, 0, 0, 0, 1, 1]);
        assert_eq!(conn.remote_bitfield, Some(bitvec![u8, Msb0; 1, 0, 1]));
        assert!(conn.are_we_interested);
        assert!(!conn.are_we_choking);
        assert_eq!(drain(&mut session), vec![DeferredTask::DetermineNextRequest(addr(PEER))]);
    }

    #[tokio::test]
    async fn input_split_into_single_bytes_is_handled() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);

        let input = encode_all(&[
            BittorrentP2pMessage::KeepAlive,
            bitfield(&[true, true, true]),
            BittorrentP2pMessage::Unchoke,
        ])
        .await;
        for byte in input.chunks(1) {
            conn.process_input(byte, &mut session).await.expect("valid input");
        }

        assert_eq!(conn.remote_bitfield, Some(bitvec![u8, Msb0; 1, 1, 1]));
        assert!(!conn.is_choking_us);
        assert!(conn.decoder.carry().is_empty());
    }

    #[tokio::test]
    async fn pieces_are_claimed_only_while_unchoked() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);
        let mut rng = StdRng::seed_from_u64(1);

        let input = encode_all(&[bitfield(&[false, false, true])]).await;
        conn.process_input(&input, &mut session).await.expect("valid input");
        drain(&mut session);
        conn.writer.clear();

        conn.determine_next_request(&mut session, &mut rng);
        assert!(conn.is_idle(), "a choking peer can't be asked for anything");
        assert!(session.requests.is_empty());
        assert!(session.tasks.is_empty());

        let input = encode_all(&[BittorrentP2pMessage::Unchoke]).await;
        conn.process_input(&input, &mut session).await.expect("valid input");
        assert_eq!(drain(&mut session), vec![DeferredTask::DetermineNextRequest(addr(PEER))]);

        conn.determine_next_request(&mut session, &mut rng);
        assert_eq!(conn.next_requested_index(), Some(2));
        assert_eq!(session.requests.owner(2), Some(addr(PEER)));
        assert_eq!(drain(&mut session), vec![DeferredTask::SendRequest(addr(PEER))]);

        conn.send_request(&session).await.expect("write to a vec");
        // The last piece is shorter than the rest
        assert_eq!(conn.writer, vec![0, 0, 0, 13, 6, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 8]);
        assert!(conn.request_in_flight);
    }

    #[tokio::test]
    async fn choke_gives_the_claim_back() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);
        let mut rng = StdRng::seed_from_u64(1);

        let input = encode_all(&[bitfield(&[true, true, true]), BittorrentP2pMessage::Unchoke]).await;
        conn.process_input(&input, &mut session).await.expect("valid input");
        drain(&mut session);
        conn.determine_next_request(&mut session, &mut rng);
        let index = conn.next_requested_index().expect("something is claimed");
        drain(&mut session);

        let input = encode_all(&[BittorrentP2pMessage::Choke]).await;
        conn.process_input(&input, &mut session).await.expect("valid input");
        assert!(conn.is_idle());
        assert!(!conn.request_in_flight);
        assert!(!session.requests.contains(index));
        assert_eq!(drain(&mut session), vec![DeferredTask::WakeIdlePeers]);

        // Nothing goes out until the peer unchokes us again
        conn.writer.clear();
        conn.determine_next_request(&mut session, &mut rng);
        conn.send_request(&session).await.expect("no-op");
        assert!(conn.writer.is_empty());
        assert!(session.requests.is_empty());
    }

    #[tokio::test]
    async fn have_updates_the_remote_bitfield() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);

        let input = encode_all(&[BittorrentP2pMessage::Have(1), BittorrentP2pMessage::Have(2)]).await;
        conn.process_input(&input, &mut session).await.expect("valid input");
        assert_eq!(conn.remote_bitfield, Some(bitvec![u8, Msb0; 0, 1, 1]));
        // Interest is declared once, so that the peer unchokes us
        assert_eq!(conn.writer, vec![0, 0, 0, 1, 2]);
        assert!(conn.are_we_interested);
        assert_eq!(
            drain(&mut session),
            vec![
                DeferredTask::DetermineNextRequest(addr(PEER)),
                DeferredTask::DetermineNextRequest(addr(PEER))
            ]
        );

        let input = encode_all(&[BittorrentP2pMessage::Have(3)]).await;
        let err = conn
            .process_input(&input, &mut session)
            .await
            .expect_err("index is out of range");
        assert!(matches!(err, Error::WrongPieceIndex(3, 3)));
        assert_eq!(err.kind(), ErrorKind::Framing);
    }

    #[tokio::test]
    async fn partial_write_is_a_transport_error() {
        let mut session = testing::session(3);
        let (writer, attempts) = ShortWriter::new(0);
        let mut conn = PeerConnection::new(addr(PEER), [7; 20], writer, session.meta.max_message_length());
        assert!(session.requests.add(0, addr(PEER)));
        conn.next_requested_index = Some(0);
        conn.is_choking_us = false;

        let err = conn.send_request(&session).await.expect_err("only half of the request fits");
        assert!(matches!(err, Error::ShortWrite { expected: 17, written: 8 }));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!conn.request_in_flight);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn verified_piece_is_stored() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);
        claim(&mut conn, &mut session, 1);

        let input = encode_all(&[piece_message(1, piece(1))]).await;
        conn.process_input(&input, &mut session).await.expect("valid piece");

        assert_eq!(session.storage.have_bitfield().iter_ones().collect::<Vec<_>>(), vec![1]);
        assert_eq!(&testing::stored_contents(&session)[16..32], piece(1).as_slice());
        assert!(session.requests.is_empty());
        assert!(conn.is_idle());
        assert_eq!(drain(&mut session), vec![DeferredTask::DetermineNextRequest(addr(PEER))]);
        assert_eq!(session.storage.times_closed(), 0);
    }

    #[tokio::test]
    async fn corrupted_piece_is_discarded_and_released() {
        let mut session = testing::session(2);
        let mut conn = connection(&session);
        claim(&mut conn, &mut session, 0);

        let input = encode_all(&[piece_message(0, vec![0xFF; 16])]).await;
        conn.process_input(&input, &mut session)
            .await
            .expect("a single failure is tolerated");

        assert!(session.storage.have_bitfield().not_any());
        assert!(testing::stored_contents(&session).iter().all(|byte| *byte == 0));
        assert!(!session.requests.contains(0));
        assert_eq!(conn.hash_failures, 1);
        assert_eq!(
            drain(&mut session),
            vec![
                DeferredTask::DetermineNextRequest(addr(PEER)),
                DeferredTask::WakeIdlePeers
            ]
        );

        claim(&mut conn, &mut session, 0);
        let err = conn
            .process_input(&input, &mut session)
            .await
            .expect_err("the peer keeps sending garbage");
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!session.requests.contains(0));
    }

    #[tokio::test]
    async fn unsolicited_pieces_are_ignored() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);

        let input = encode_all(&[piece_message(0, piece(0))]).await;
        conn.process_input(&input, &mut session).await.expect("valid input");

        assert!(session.storage.have_bitfield().not_any());
        assert!(session.tasks.is_empty());
    }

    #[tokio::test]
    async fn last_piece_closes_the_storage() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);

        for index in [2, 0, 1] {
            claim(&mut conn, &mut session, index);
            let input = encode_all(&[piece_message(index, piece(index))]).await;
            conn.process_input(&input, &mut session).await.expect("valid piece");
        }

        assert!(session.storage.is_complete());
        assert_eq!(session.storage.times_closed(), 1);
        assert_eq!(testing::stored_contents(&session), testing::contents());
        assert!(session.missing_pieces().is_empty());
    }

    #[tokio::test]
    async fn messages_before_a_framing_error_are_dispatched() {
        let mut session = testing::session(3);
        let mut conn = connection(&session);

        let mut input = encode_all(&[BittorrentP2pMessage::Unchoke]).await;
        input.extend_from_slice(&[0, 0, 0, 1, 42]);

        let err = conn
            .process_input(&input, &mut session)
            .await
            .expect_err("unknown message id");
        assert_eq!(err.kind(), ErrorKind::Framing);
        assert!(!conn.is_choking_us);
    }

    #[tokio::test]
    async fn handshakes_are_exchanged_and_validated() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let remote = tokio::spawn(async move {
            let mut buf = [0; Handshake::LENGTH];
            server.read_exact(&mut buf).await.expect("client handshake");
            server
                .write_all(&Handshake::new(INFO_HASH, [9; 20]).to_bytes())
                .await
                .expect("server handshake");
            buf
        });

        let handshake = exchange_handshakes(&mut client, INFO_HASH, [1; 20])
            .await
            .expect("handshake succeeds");
        assert_eq!(handshake.peer_id, [9; 20]);
        assert_eq!(
            remote.await.expect("server task"),
            Handshake::new(INFO_HASH, [1; 20]).to_bytes()
        );

        let (mut client, mut server) = tokio::io::duplex(256);
        server
            .write_all(&Handshake::new([0x22; 20], [9; 20]).to_bytes())
            .await
            .expect("server handshake");
        let err = exchange_handshakes(&mut client, INFO_HASH, [1; 20])
            .await
            .expect_err("wrong torrent");
        assert!(matches!(err, Error::BadInfoHash(hash) if hash == [0x22; 20]));
    }
}
