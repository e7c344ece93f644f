use std::path::Path;

use crate::{metainfo::Info, storage::FileInfo, Error, Result};

/// Where every file of a torrent lives on disk, in torrent byte order
#[derive(Debug, Clone)]
pub struct TorrentFileMetadata {
    pub file_infos: Vec<FileInfo>,
}

impl TorrentFileMetadata {
    pub fn new(info: &Info, base_path: &Path) -> Result<Self> {
        let mut file_infos = Vec::with_capacity(1);
        if let Some(files) = info.files.as_deref() {
            file_infos.reserve(files.len());
            for file in files.iter() {
                // Multi-file mode: everything goes into a directory named after the torrent
                let mut path = base_path.join(&info.name);
                for path_part in file.path.iter() {
                    if path_part == ".." || Path::new(path_part).is_absolute() {
                        return Err(Error::BadMetadata("file path escapes the download directory"));
                    }
                    path.push(path_part);
                }

                file_infos.push(FileInfo::new(path, file.length));
            }
        } else {
            let length = info.length.ok_or(Error::BadMetadata(
                "the `length` field is missing in a single-file torrent",
            ))?;

            file_infos.push(FileInfo::new(base_path.join(&info.name), length));
        };

        Ok(TorrentFileMetadata { file_infos })
    }
}
