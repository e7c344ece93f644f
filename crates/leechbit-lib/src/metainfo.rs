use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use sha1::{Digest, Sha1};

use crate::{Error, Result};

/// Multiple File Mode info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    /// Length of the file in bytes
    pub length: u64,
    /// MD5 sum of the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
    /// A list containing one or more string elements that together represent the path and filename.
    /// "dir1/dir2/file.ext" -> ["dir1", "dir2", "file.ext"]
    pub path: Vec<String>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    /// A list of Files (Multi File Mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    /// Length of the file in bytes (Single File Mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// MD5 sum of the file (Single File Mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,
    /// Filename (Single File Mode) / Name of the directory (Multi File Mode)
    pub name: String,
    /// Number of bytes in each piece
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// Concatenated piece hashes (20-byte SHA1 hash values). Must be a multiple of 20
    #[serde_as(as = "Bytes")]
    pub pieces: Vec<u8>,
    /// External peer source (Can be either 0 or 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

impl Info {
    /// SHA1 Hash of bencoded self
    pub fn hash(&self) -> Result<[u8; 20]> {
        let serialized_struct = serde_bencode::to_bytes(self)?;
        let hasher = Sha1::new_with_prefix(serialized_struct);
        Ok(hasher.finalize().into())
    }

    /// Sum of all file lengths
    pub fn total_length(&self) -> Result<u64> {
        match (&self.files, self.length) {
            (Some(files), _) => Ok(files.iter().map(|file| file.length).sum()),
            (None, Some(length)) => Ok(length),
            (None, None) => Err(Error::BadMetadata("both 'files' and 'length' fields are missing")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MetaInfo {
    /// Description of the file(s) of the torrent
    pub info: Info,
    /// The announce URL of the tracker
    pub announce: String,
    /// A list of announce URLs of trackers. Is used if the multitracker specification is supported
    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    /// The creation time of the torrent (UNIX epoch format)
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<u64>,
    /// Free-form comments of the author
    #[serde(default)]
    pub comment: Option<String>,
    /// Name and version of the program used to create the Metainfo file
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
}

impl MetaInfo {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(raw)?)
    }

    /// All HTTP announce URLs, the primary one first
    pub fn announce_urls(&self) -> Vec<&str> {
        let mut urls = vec![self.announce.as_str()];
        if let Some(tiers) = &self.announce_list {
            for url in tiers.iter().flatten() {
                if !urls.contains(&url.as_str()) {
                    urls.push(url);
                }
            }
        }
        urls
    }
}
