use bytes::{Buf, BytesMut};

use crate::{BittorrentP2pMessage, Error, MessageId, Result};

/// Where the decoder is within the unit that currently sits at the front of the carry buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    ReadingLength,
    ReadingId { declared_length: usize },
    ReadingMessage { declared_length: usize, message_id: MessageId },
}

/// Incremental decoder for length-prefixed peer messages.
///
/// Socket reads are appended with [`FrameDecoder::extend`]; complete messages are then pulled out
/// one at a time with [`FrameDecoder::decode_next`]. Bytes that don't complete the unit currently
/// being parsed stay in the carry buffer and are picked up by the next read, so the split points of
/// the underlying reads never matter. Keep-alives are consumed silently.
#[derive(Debug)]
pub struct FrameDecoder {
    phase: FramePhase,
    /// Bytes of the incomplete unit, starting with its length prefix
    carry: BytesMut,
    max_message_length: usize,
}

impl FrameDecoder {
    const LENGTH_PREFIX: usize = BittorrentP2pMessage::FIXED_PART_LENGTH;
    const ID_LENGTH: usize = 1;

    pub fn new(max_message_length: usize) -> Self {
        FrameDecoder {
            phase: FramePhase::ReadingLength,
            carry: BytesMut::new(),
            max_message_length,
        }
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Bytes that were received but don't form a complete unit yet
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.carry.extend_from_slice(data);
    }

    /// Returns the next complete message, or `None` if more bytes are needed.
    ///
    /// Any error means that the stream is corrupted and can't be resynchronized.
    pub fn decode_next(&mut self) -> Result<Option<BittorrentP2pMessage>> {
        loop {
            match self.phase {
                FramePhase::ReadingLength => {
                    if self.carry.len() < Self::LENGTH_PREFIX {
                        return Ok(None);
                    }

                    let raw_length = (&self.carry[..Self::LENGTH_PREFIX]).get_i32();
                    let declared_length = usize::try_from(raw_length)
                        .map_err(|_| Error::ConversionError("negative message length"))?;

                    if declared_length == 0 {
                        self.carry.advance(Self::LENGTH_PREFIX);
                        continue;
                    }

                    if declared_length > self.max_message_length {
                        return Err(Error::MessageTooLarge(declared_length, self.max_message_length));
                    }

                    self.phase = FramePhase::ReadingId { declared_length };
                }
                FramePhase::ReadingId { declared_length } => {
                    if self.carry.len() < Self::LENGTH_PREFIX + Self::ID_LENGTH {
                        return Ok(None);
                    }

                    let message_id = MessageId::try_from(self.carry[Self::LENGTH_PREFIX])?;
                    self.phase = FramePhase::ReadingMessage {
                        declared_length,
                        message_id,
                    };
                }
                FramePhase::ReadingMessage {
                    declared_length,
                    message_id,
                } => {
                    let unit_length = Self::LENGTH_PREFIX + declared_length;
                    if self.carry.len() < unit_length {
                        return Ok(None);
                    }

                    let mut unit = self.carry.split_to(unit_length).freeze();
                    unit.advance(Self::LENGTH_PREFIX + Self::ID_LENGTH);
                    self.phase = FramePhase::ReadingLength;

                    return BittorrentP2pMessage::from_parts(message_id, unit).map(Some);
                }
            }
        }
    }
}
