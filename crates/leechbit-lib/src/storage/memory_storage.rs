use anyhow::Context;

use super::{FileInfo, Storage};

/// Keeps every file in memory. Handy for tests and tiny torrents.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Vec<Vec<u8>>,
    flushes: usize,
}

impl MemoryStorage {
    pub fn new(file_infos: &[FileInfo]) -> Self {
        MemoryStorage {
            files: file_infos.iter().map(|info| vec![0; info.length as usize]).collect(),
            flushes: 0,
        }
    }

    pub fn file(&self, file_idx: usize) -> &[u8] {
        &self.files[file_idx]
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    fn region(&mut self, file_idx: usize, offset: u64, len: usize) -> anyhow::Result<Option<&mut [u8]>> {
        let file = self.files.get_mut(file_idx).context("bug: non-existing file index?")?;
        let start = usize::try_from(offset)?;
        Ok(file.get_mut(start..start + len))
    }
}

impl Storage for MemoryStorage {
    fn write_all(&mut self, file_idx: usize, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        self.region(file_idx, offset, data.len())?
            .context("write goes past the end of the file")?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_exact(&mut self, file_idx: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<bool> {
        match self.region(file_idx, offset, buf.len())? {
            Some(region) => {
                buf.copy_from_slice(region);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
