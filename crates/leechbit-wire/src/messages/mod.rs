mod handshake;
mod p2p_message;

pub use handshake::Handshake;
pub use p2p_message::{BittorrentP2pMessage, Block, BlockRequest, MessageId};
