mod file_storage;
mod memory_storage;
mod storage_manager;
mod util;

use std::path::PathBuf;

use bitvec::order::Msb0;
use bitvec::slice::BitSlice;
pub use file_storage::FileStorage;
pub use memory_storage::MemoryStorage;
pub use storage_manager::{StorageManager, TorrentFileMetadata};

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub length: u64,
}

impl FileInfo {
    pub fn new(path: PathBuf, length: u64) -> Self {
        FileInfo { path, length }
    }
}

/// Byte-addressed backend: one addressable region per torrent file
pub trait Storage {
    fn write_all(&mut self, file_idx: usize, offset: u64, data: &[u8]) -> anyhow::Result<()>;
    /// Returns `false` if the file doesn't hold enough bytes
    fn read_exact(&mut self, file_idx: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<bool>;
    fn flush(&mut self) -> anyhow::Result<()>;
}

/// The view of storage that the peer protocol engine works with: a cursor into the torrent's
/// contiguous byte space plus the local "have" bitfield.
pub trait PieceStorage {
    fn have_bitfield(&self) -> &BitSlice<u8, Msb0>;
    /// Moves the write cursor to an absolute torrent offset
    fn seek(&mut self, offset: u64);
    /// Writes the block at the cursor and advances it
    fn write_block(&mut self, block: &[u8]) -> anyhow::Result<()>;
    fn mark_complete(&mut self, index: u32) -> anyhow::Result<()>;
    fn is_complete(&self) -> bool;
    fn close(&mut self) -> anyhow::Result<()>;
}
