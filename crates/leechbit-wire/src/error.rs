use std::fmt::Debug;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("an IO error happened: {0}")]
    IoError(#[from] std::io::Error),
    #[error("an error happened when converting a value: {0}")]
    ConversionError(&'static str),
    #[error("expected at least {0} bytes while got {1}")]
    BadLength(usize, usize),
    #[error("declared message length {0} exceeds the limit of {1} bytes")]
    MessageTooLarge(usize, usize),
    #[error("invalid handshake: {0}")]
    BadHandshake(&'static str),
}
