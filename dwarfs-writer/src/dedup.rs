//! Content deduplication keyed on a configurable file hash.
//!
//! The unit of deduplication is the categorizer fragment: equal fragment
//! bytes (as decided by the configured hash) collapse to a single chunk
//! stream. Files whose entire fragment sequence matches end up sharing a
//! store and become shared inodes in the metadata; for files that
//! categorize to one default fragment this degenerates to plain
//! whole-file deduplication. `none` disables deduplication entirely,
//! treating every file as unique.

use std::collections::HashMap;

use sha2::{Digest as _, Sha256, Sha512, Sha512_256};
use xxhash_rust::xxh3::xxh3_128;

use crate::{Error, Result};

/// The hash used to compare file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileHash {
    /// Disable deduplication.
    None,
    #[default]
    Sha512,
    Sha512_256,
    Sha256,
    Xxh3_128,
}

impl std::str::FromStr for FileHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "none" => Self::None,
            "sha512" => Self::Sha512,
            "sha512-256" => Self::Sha512_256,
            "sha256" => Self::Sha256,
            "xxh3-128" => Self::Xxh3_128,
            _ => bail!(Error::bad_args(format!("unknown file hash: {s}"))),
        })
    }
}

impl FileHash {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
            Self::Sha512_256 => Sha512_256::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Xxh3_128 => xxh3_128(data).to_le_bytes().to_vec(),
        }
    }
}

/// Maps content digests to previously registered ids.
#[derive(Debug)]
pub struct Deduper {
    hash: FileHash,
    /// Digest (plus length, to keep truncated-hash collisions honest) to
    /// first id seen with that content.
    table: HashMap<(u64, Vec<u8>), u32>,
    pub duplicate_bytes: u64,
}

impl Deduper {
    pub fn new(hash: FileHash) -> Self {
        Self { hash, table: HashMap::new(), duplicate_bytes: 0 }
    }

    /// Register a fragment's bytes under `id`, or return the id of
    /// identical earlier content. With [`FileHash::None`] everything is
    /// unique.
    pub fn dedup(&mut self, content: &[u8], id: u32) -> Option<u32> {
        if self.hash == FileHash::None {
            return None;
        }
        let key = (content.len() as u64, self.hash.digest(content));
        match self.table.entry(key) {
            std::collections::hash_map::Entry::Occupied(ent) => {
                self.duplicate_bytes += content.len() as u64;
                Some(*ent.get())
            }
            std::collections::hash_map::Entry::Vacant(ent) => {
                ent.insert(id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_by_content() {
        let mut d = Deduper::new(FileHash::Sha512);
        assert_eq!(d.dedup(b"aaa", 0), None);
        assert_eq!(d.dedup(b"bbb", 1), None);
        assert_eq!(d.dedup(b"aaa", 2), Some(0));
        assert_eq!(d.dedup(b"aaa", 3), Some(0));
        assert_eq!(d.duplicate_bytes, 6);
    }

    #[test]
    fn hash_none_disables() {
        let mut d = Deduper::new(FileHash::None);
        assert_eq!(d.dedup(b"aaa", 0), None);
        assert_eq!(d.dedup(b"aaa", 1), None);
    }

    #[test]
    fn all_hashes_distinguish() {
        for hash in [FileHash::Sha512, FileHash::Sha512_256, FileHash::Sha256, FileHash::Xxh3_128] {
            assert_ne!(hash.digest(b"x"), hash.digest(b"y"));
            assert_eq!(hash.digest(b"x"), hash.digest(b"x"));
        }
        assert!("sha512".parse::<FileHash>().is_ok());
        assert!("md5".parse::<FileHash>().is_err());
    }
}
