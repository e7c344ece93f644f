use crate::{Decode, Encode, Error, Result};
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use tokio::io::AsyncWriteExt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            _ => return Err(Error::ConversionError("MessageId is out of range")),
        })
    }
}

/// Payload of the `request` and `cancel` messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    /// Zero-based piece index
    pub index: u32,
    /// Zero-based byte offset within the piece
    pub begin: u32,
    /// Requested length
    pub length: u32,
}

/// Payload of the `piece` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Zero-based piece index
    pub index: u32,
    /// Zero-based byte offset within the piece
    pub begin: u32,
    /// Block of data, which is a subset of the piece specified by index
    pub block: Bytes,
}

/// Represents all possible `Peer Wire Protocol` messages
/// [Source](https://wiki.theory.org/BitTorrentSpecification#Messages)
#[derive(Debug, PartialEq)]
pub enum BittorrentP2pMessage {
    /// The keep-alive message is a message with zero bytes, specified with the length prefix set to zero.
    /// There is no message ID and no payload.
    ///
    /// Peers may close a connection if they receive no messages (keep-alive or any other message) for a
    /// certain period of time, so a keep-alive message must be sent to maintain the connection alive if
    /// no command have been sent for a given amount of time. This amount of time is generally **two minutes**.
    KeepAlive,
    /// When a peer chokes the client, it is a notification that no requests will be answered until the client is unchoked.
    /// The client should not attempt to send requests for blocks, and it should consider all pending (unanswered) requests
    /// to be discarded by the remote peer.
    Choke,
    Unchoke,
    /// This message is a notification that the remote peer will begin requesting blocks when the client unchokes them.
    Interested,
    NotInterested,
    /// The payload is the zero-based index of a piece that has just been successfully downloaded and verified via the hash.
    Have(u32),
    /// The payload is a bitfield representing the pieces that have been successfully downloaded.
    /// The high bit in the first byte corresponds to piece index 0.
    /// Spare bits at the end are set to zero.
    Bitfield(BitVec<u8, Msb0>),
    /// Used to request a block.
    Request(BlockRequest),
    /// A single block of data
    Piece(Block),
    /// Used to cancel block requests. The payload is identical to that of the [BittorrentP2pMessage::Request] message.
    Cancel(BlockRequest),
    /// The listen port of the peer's DHT node.
    Port(u16),
}

impl BittorrentP2pMessage {
    pub const FIXED_PART_LENGTH: usize = 4 /* length */;

    pub fn message_id(&self) -> Option<MessageId> {
        use BittorrentP2pMessage::{
            Bitfield, Cancel, Choke, Have, Interested, KeepAlive, NotInterested, Piece, Port, Request, Unchoke,
        };

        Some(match self {
            KeepAlive => return None,
            Choke => MessageId::Choke,
            Unchoke => MessageId::Unchoke,
            Interested => MessageId::Interested,
            NotInterested => MessageId::NotInterested,
            Have(_) => MessageId::Have,
            Bitfield(_) => MessageId::Bitfield,
            Request(_) => MessageId::Request,
            Piece(_) => MessageId::Piece,
            Cancel(_) => MessageId::Cancel,
            Port(_) => MessageId::Port,
        })
    }

    /// Value of the length prefix: message id plus payload
    pub fn declared_length(&self) -> usize {
        use BittorrentP2pMessage::{
            Bitfield, Cancel, Choke, Have, Interested, KeepAlive, NotInterested, Piece, Port, Request, Unchoke,
        };

        match self {
            KeepAlive => 0,
            Choke | Unchoke | Interested | NotInterested => 1,
            Have(_) => 5,
            Bitfield(bitvec) => 1 + bitvec.as_raw_slice().len(),
            Request(_) | Cancel(_) => 13,
            Piece(Block { block, .. }) => 9 + block.len(),
            Port(_) => 3,
        }
    }

    /// Total number of bytes this message occupies on the wire
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_PART_LENGTH + self.declared_length()
    }

    /// Builds a message from an already framed unit: its id and exactly `declared length - 1` payload bytes
    pub fn from_parts(message_id: MessageId, mut payload: Bytes) -> Result<Self> {
        const U32_SIZE: usize = std::mem::size_of::<u32>();

        Ok(match message_id {
            MessageId::Choke => Self::Choke,
            MessageId::Unchoke => Self::Unchoke,
            MessageId::Interested => Self::Interested,
            MessageId::NotInterested => Self::NotInterested,
            MessageId::Have => {
                check_length!(payload.remaining(), U32_SIZE);
                Self::Have(payload.get_u32())
            }
            MessageId::Bitfield => Self::Bitfield(BitVec::from_vec(payload.to_vec())),
            MessageId::Request | MessageId::Cancel => {
                check_length!(payload.remaining(), U32_SIZE * 3);
                let request = BlockRequest {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                };
                if message_id == MessageId::Request {
                    Self::Request(request)
                } else {
                    Self::Cancel(request)
                }
            }
            MessageId::Piece => {
                check_length!(payload.remaining(), U32_SIZE * 2);
                let index = payload.get_u32();
                let begin = payload.get_u32();
                // The rest is the block itself
                Self::Piece(Block {
                    index,
                    begin,
                    block: payload,
                })
            }
            MessageId::Port => {
                check_length!(payload.remaining(), std::mem::size_of::<u16>());
                Self::Port(payload.get_u16())
            }
        })
    }
}

impl Encode for BittorrentP2pMessage {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        use BittorrentP2pMessage::{
            Bitfield, Cancel, Choke, Have, Interested, KeepAlive, NotInterested, Piece, Port, Request, Unchoke,
        };

        let length = u32::try_from(self.declared_length())
            .map_err(|_| Error::ConversionError("message length doesn't fit into the length prefix"))?;

        dst.write_all(&length.to_be_bytes()).await?;

        if let Some(message_id) = self.message_id() {
            dst.write_all(&[message_id as u8]).await?;
        }

        match self {
            // These message types have no additional info
            KeepAlive | Choke | Unchoke | Interested | NotInterested => {}
            Have(piece_idx) => {
                dst.write_all(&piece_idx.to_be_bytes()).await?;
            }
            Bitfield(bitfield) => {
                dst.write_all(bitfield.as_raw_slice()).await?;
            }
            Request(BlockRequest { index, begin, length }) | Cancel(BlockRequest { index, begin, length }) => {
                dst.write_all(&index.to_be_bytes()).await?;
                dst.write_all(&begin.to_be_bytes()).await?;
                dst.write_all(&length.to_be_bytes()).await?;
            }
            Piece(Block { index, begin, block }) => {
                dst.write_all(&index.to_be_bytes()).await?;
                dst.write_all(&begin.to_be_bytes()).await?;
                dst.write_all(block).await?;
            }
            Port(port) => {
                dst.write_all(&port.to_be_bytes()).await?;
            }
        };

        Ok(())
    }
}

impl<'a> Decode<'a> for BittorrentP2pMessage {
    /// Decodes a single complete frame, length prefix included
    fn decode(src: &'a [u8]) -> Result<Self> {
        check_length!(src.remaining(), Self::FIXED_PART_LENGTH);

        let mut src = Cursor::new(src);

        let length = src.get_i32();
        if length < 0 {
            return Err(Error::ConversionError("negative message length"));
        }
        let length = length as usize;

        if length == 0 {
            return Ok(BittorrentP2pMessage::KeepAlive);
        }

        check_length!(src.remaining(), length);

        let message_id: MessageId = src.get_u8().try_into()?;
        let payload = src.copy_to_bytes(length - 1);

        Self::from_parts(message_id, payload)
    }
}
