use crate::metainfo::Info;
use crate::{Error, Result};

const PIECE_HASH_LENGTH: usize = 20;

/// Everything the peer protocol engine needs to know about a torrent
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub info_hash: [u8; 20],
    pub piece_length: usize,
    pub number_of_pieces: usize,
    pub total_length: usize,
    piece_hashes: Vec<[u8; 20]>,
}

impl TorrentMeta {
    pub fn new(info_hash: [u8; 20], piece_length: usize, total_length: usize, hash_blob: &[u8]) -> Result<Self> {
        if hash_blob.len() % PIECE_HASH_LENGTH != 0 {
            return Err(Error::BadMetadata("'pieces' length is not a multiple of 20"));
        }
        if piece_length == 0 {
            return Err(Error::BadMetadata("'piece length' is zero"));
        }

        let piece_hashes = hash_blob
            .chunks_exact(PIECE_HASH_LENGTH)
            .map(|chunk| try_into!(chunk, [u8; 20]))
            .collect::<Result<Vec<[u8; 20]>>>()?;
        let number_of_pieces = piece_hashes.len();

        if number_of_pieces == 0 {
            return Err(Error::BadMetadata("torrent has no pieces"));
        }

        // Every piece but the last one is full, and the last one holds at least one byte
        let full_pieces_length = piece_length
            .checked_mul(number_of_pieces - 1)
            .ok_or(Error::BadMetadata("torrent is too large"))?;
        let fits_into_pieces = piece_length
            .checked_mul(number_of_pieces)
            .map_or(true, |all_pieces_length| total_length <= all_pieces_length);
        if total_length <= full_pieces_length || !fits_into_pieces {
            return Err(Error::BadMetadata("piece count doesn't match the total length"));
        }

        Ok(TorrentMeta {
            info_hash,
            piece_length,
            number_of_pieces,
            total_length,
            piece_hashes,
        })
    }

    pub fn from_info(info: &Info) -> Result<Self> {
        TorrentMeta::new(
            info.hash()?,
            try_into!(info.piece_length, usize)?,
            try_into!(info.total_length()?, usize)?,
            &info.pieces,
        )
    }

    pub fn last_piece_length(&self) -> usize {
        self.total_length - self.piece_length * (self.number_of_pieces - 1)
    }

    /// Length of the piece with the given index; the last one may be shorter than the rest
    pub fn piece_size(&self, index: u32) -> Result<usize> {
        let idx = self.check_index(index)?;
        if idx == self.number_of_pieces - 1 {
            Ok(self.last_piece_length())
        } else {
            Ok(self.piece_length)
        }
    }

    pub fn piece_hash(&self, index: u32) -> Result<&[u8; 20]> {
        let idx = self.check_index(index)?;
        Ok(&self.piece_hashes[idx])
    }

    /// Absolute position of the first byte of the piece within the torrent
    pub fn piece_offset(&self, index: u32) -> Result<u64> {
        let idx = self.check_index(index)?;
        let offset = idx
            .checked_mul(self.piece_length)
            .ok_or(Error::InternalError("piece offset overflows"))?;
        Ok(try_into!(offset, u64)?)
    }

    /// Largest frame a well-behaved peer can send us: a full-piece `piece` message
    pub fn max_message_length(&self) -> usize {
        // id + index + begin
        self.piece_length.max(self.number_of_pieces.div_ceil(8)).saturating_add(9)
    }

    fn check_index(&self, index: u32) -> Result<usize> {
        let idx = try_into!(index, usize)?;
        if idx >= self.number_of_pieces {
            return Err(Error::WrongPieceIndex(index, try_into!(self.number_of_pieces, u32)?));
        }
        Ok(idx)
    }
}
