mod file_metadata;

use anyhow::Context;
use bitvec::order::Msb0;
use bitvec::slice::BitSlice;
use bitvec::{bitvec, vec::BitVec};
use sha1::{Digest, Sha1};

pub use file_metadata::TorrentFileMetadata;

use super::util::{find_file_offsets_for_data, read_data_from_files, write_data_to_files};
use super::{PieceStorage, Storage};
use crate::torrent_meta::TorrentMeta;

/// Maps the torrent's contiguous byte space onto its files and tracks which pieces are done
pub struct StorageManager<B> {
    backend: B,
    file_metadata: TorrentFileMetadata,
    have: BitVec<u8, Msb0>,
    position: u64,
    times_closed: usize,
}

impl<B: Storage> StorageManager<B> {
    pub fn new(backend: B, file_metadata: TorrentFileMetadata, number_of_pieces: usize) -> Self {
        StorageManager {
            backend,
            file_metadata,
            have: bitvec![u8, Msb0; 0; number_of_pieces],
            position: 0,
            times_closed: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn times_closed(&self) -> usize {
        self.times_closed
    }

    /// Hashes whatever is already on disk and marks matching pieces as present.
    /// Returns the number of pieces that don't need to be downloaded again.
    #[tracing::instrument(err, skip_all)]
    pub fn restore_verified_pieces(&mut self, meta: &TorrentMeta) -> anyhow::Result<usize> {
        let mut buf = Vec::with_capacity(meta.piece_length);
        let mut hasher = Sha1::new();
        for index in 0..try_into!(meta.number_of_pieces, u32)? {
            buf.resize(meta.piece_size(index)?, 0);

            let offsets = find_file_offsets_for_data(&self.file_metadata.file_infos, meta.piece_offset(index)?)
                .context("bug: piece lies outside of the torrent files?")?;
            let complete = read_data_from_files(&mut self.backend, &mut buf, offsets, &self.file_metadata.file_infos)
                .with_context(|| format!("error while reading piece {}", index))?;
            if !complete {
                continue;
            }

            hasher.update(&buf);
            let calculated_hash: [u8; 20] = hasher.finalize_reset().into();
            if &calculated_hash == meta.piece_hash(index)? {
                self.mark_complete(index)?;
            }
        }

        let verified = self.have.count_ones();
        tracing::info!(verified, total = meta.number_of_pieces, "finished checking existing data");
        Ok(verified)
    }
}

impl<B: Storage> PieceStorage for StorageManager<B> {
    fn have_bitfield(&self) -> &BitSlice<u8, Msb0> {
        &self.have
    }

    fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    fn write_block(&mut self, block: &[u8]) -> anyhow::Result<()> {
        let offsets = find_file_offsets_for_data(&self.file_metadata.file_infos, self.position)
            .with_context(|| format!("write position {} lies outside of the torrent files", self.position))?;
        write_data_to_files(&mut self.backend, block, offsets, &self.file_metadata.file_infos)
            .context("error while writing block to files")?;
        self.position += try_into!(block.len(), u64)?;
        Ok(())
    }

    fn mark_complete(&mut self, index: u32) -> anyhow::Result<()> {
        let idx = try_into!(index, usize)?;
        anyhow::ensure!(idx < self.have.len(), "bug: marking unknown piece {} as complete", index);
        self.have.set(idx, true);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.have.all()
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.backend.flush().context("error while flushing the storage")?;
        self.times_closed += 1;
        tracing::debug!("storage closed");
        Ok(())
    }
}
