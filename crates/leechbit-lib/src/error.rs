use std::fmt::Debug;
use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("error while parsing the torrent file: {0}")]
    ParsingError(#[from] serde_bencode::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("an error happened: {0}")]
    InternalError(&'static str),
    #[error("malformed torrent metadata: {0}")]
    BadMetadata(&'static str),
    #[error("downloaded piece {index} has incorrect hash: expected {expected:?}, got {actual:?}")]
    PieceHashMismatch {
        index: u32,
        expected: [u8; 20],
        actual: [u8; 20],
    },
    #[error("wrong info hash: {0:?}")]
    BadInfoHash([u8; 20]),
    #[error("wrong piece index: {0}. Total number of pieces: {1}")]
    WrongPieceIndex(u32, u32),
    #[error("error while encoding or decoding a bittorrent message: {0}")]
    BittorentProtocolError(#[from] leechbit_wire::Error),
    #[error("short write: sent {written} out of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
    #[error("storage failure: {0:#}")]
    StorageError(anyhow::Error),
}

/// How far an error is allowed to travel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The socket is unusable: drop this one connection
    Transport,
    /// The byte stream can't be parsed any more: drop this one connection
    Framing,
    /// A block failed verification: discard it and retry the piece
    Integrity,
    /// A bug or a broken local environment: stop the whole session
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IoError(_) | Error::ShortWrite { .. } => ErrorKind::Transport,
            Error::BittorentProtocolError(leechbit_wire::Error::IoError(_)) => ErrorKind::Transport,
            Error::BittorentProtocolError(_) | Error::BadInfoHash(_) | Error::WrongPieceIndex(..) => {
                ErrorKind::Framing
            }
            Error::PieceHashMismatch { .. } => ErrorKind::Integrity,
            Error::ParsingError(_) | Error::InternalError(_) | Error::BadMetadata(_) | Error::StorageError(_) => {
                ErrorKind::Fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_scoped_by_kind() {
        assert_eq!(Error::ShortWrite { expected: 17, written: 8 }.kind(), ErrorKind::Transport);
        assert_eq!(
            Error::BittorentProtocolError(leechbit_wire::Error::ConversionError("bad id")).kind(),
            ErrorKind::Framing
        );
        assert_eq!(
            Error::PieceHashMismatch {
                index: 0,
                expected: [0; 20],
                actual: [1; 20]
            }
            .kind(),
            ErrorKind::Integrity
        );
        assert_eq!(Error::BadMetadata("pieces").kind(), ErrorKind::Fatal);
    }
}
