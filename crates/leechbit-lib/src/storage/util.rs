use anyhow::Context;

use super::{FileInfo, Storage};

pub(crate) struct FileOffsets {
    pub file_idx: usize,
    pub offset_into_file: u64,
}

pub(crate) fn find_file_offsets_for_data(file_infos: &[FileInfo], global_offset: u64) -> Option<FileOffsets> {
    file_infos
        .iter()
        .enumerate()
        .scan(0, |state, (file_idx, file_info)| {
            // We need this to calculate an in-file offset
            let prev_length = *state;

            *state += file_info.length;

            if global_offset < *state {
                Some(Some(FileOffsets {
                    file_idx,
                    offset_into_file: global_offset - prev_length,
                }))
            } else {
                Some(None)
            }
        })
        // Nested Options make scan traverse the collection as long as we need instead of stopping
        // at the first None, so the outer Option is always Some.
        .find_map(|el| el)
}

pub(crate) fn write_data_to_files(
    storage: &mut dyn Storage,
    buf: &[u8],
    file_offsets: FileOffsets,
    file_infos: &[FileInfo],
) -> anyhow::Result<()> {
    let mut file_idx = file_offsets.file_idx;
    let mut bytes_to_write = buf.len();
    while bytes_to_write != 0 {
        let offset = if file_idx == file_offsets.file_idx {
            file_offsets.offset_into_file
        } else {
            0
        };
        let file = file_infos
            .get(file_idx)
            .context("data runs past the end of the last file")?;
        let current_file_bytes_to_write = bytes_to_write.min(usize::try_from(file.length - offset)?);

        let written_bytes = buf.len() - bytes_to_write;
        storage
            .write_all(
                file_idx,
                offset,
                &buf[written_bytes..written_bytes + current_file_bytes_to_write],
            )
            .with_context(|| format!("error while writing data to file: idx {}, offset {}", file_idx, offset))?;
        file_idx += 1;
        bytes_to_write -= current_file_bytes_to_write;
    }
    Ok(())
}

/// Fills the whole `buf`; returns `false` if some file was too short
pub(crate) fn read_data_from_files(
    storage: &mut dyn Storage,
    buf: &mut [u8],
    file_offsets: FileOffsets,
    file_infos: &[FileInfo],
) -> anyhow::Result<bool> {
    let mut file_idx = file_offsets.file_idx;
    let mut bytes_to_read = buf.len();
    while bytes_to_read != 0 {
        let offset = if file_idx == file_offsets.file_idx {
            file_offsets.offset_into_file
        } else {
            0
        };
        let file = file_infos
            .get(file_idx)
            .context("data runs past the end of the last file")?;
        let current_file_bytes_to_read = bytes_to_read.min(usize::try_from(file.length - offset)?);

        let read_bytes = buf.len() - bytes_to_read;
        let file_had_enough_bytes = storage
            .read_exact(
                file_idx,
                offset,
                &mut buf[read_bytes..read_bytes + current_file_bytes_to_read],
            )
            .with_context(|| format!("error while reading data from file: idx {}, offset {}", file_idx, offset))?;
        if !file_had_enough_bytes {
            return Ok(false);
        }
        file_idx += 1;
        bytes_to_read -= current_file_bytes_to_read;
    }
    Ok(true)
}
