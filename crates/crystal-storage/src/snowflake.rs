//! Snowflake records, packed file identifiers, and blob path derivation.
//!
//! A snowflake is one stored blob's metadata within a shard. Its 32-bit id
//! maps deterministically to a two-level on-disk path so blobs spread across
//! up to 256 subdirectories instead of piling into one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Nibble alphabet for path derivation. Digits first, then letters starting
/// at `W` so derived names never collide with ordinary hex dumps.
const PATH_ALPHABET: &[u8; 16] = b"0123456789WXYZAB";

/// File extension for snowflake blob files.
const BLOB_EXTENSION: &str = "zen";

/// Metadata for one stored blob within a shard.
///
/// Liveness is tracked by membership in the shard's snowflake index, not by
/// a flag on the record itself; a deleted snowflake is removed from the live
/// index while its file removal completes in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snowflake {
    /// Non-zero id unique within the owning shard.
    pub id: u32,
    /// Payload size in bytes (hash header excluded).
    pub size: i32,
}

impl Snowflake {
    /// Creates a new snowflake record.
    pub fn new(id: u32, size: i32) -> Self {
        Self { id, size }
    }
}

/// A packed 64-bit file identifier: `[directory id: u32][snowflake id: u32]`.
///
/// Zero means "unallocated". Ids are minted exclusively by a directory shard
/// under its index lock and never reused while alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct FileId(u64);

impl FileId {
    /// The unallocated file id.
    pub const NONE: FileId = FileId(0);

    /// Packs a directory id and snowflake id.
    pub fn new(directory_id: u32, snowflake_id: u32) -> Self {
        Self(((directory_id as u64) << 32) | snowflake_id as u64)
    }

    /// Reconstructs a file id from its raw packed form.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw packed value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The directory (shard) id in the upper 32 bits.
    pub fn directory_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The directory id interpreted as a 16-bit storage id.
    pub fn storage_id(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    /// The snowflake id in the lower 32 bits.
    pub fn snowflake_id(&self) -> u32 {
        self.0 as u32
    }

    /// Whether this id is unallocated.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// Derives the blob path for a snowflake id under the given shard root.
///
/// The top two nibbles select a 2-character subdirectory (256 possible), the
/// remaining six nibbles form the file name.
pub fn blob_path(root: &Path, snowflake_id: u32) -> PathBuf {
    let mut chars = [0u8; 8];
    for (i, c) in chars.iter_mut().enumerate() {
        let nibble = (snowflake_id >> ((7 - i) * 4)) & 0xF;
        *c = PATH_ALPHABET[nibble as usize];
    }
    let subdir = std::str::from_utf8(&chars[..2]).expect("alphabet is ascii");
    let name = std::str::from_utf8(&chars[2..]).expect("alphabet is ascii");
    root.join(subdir).join(format!("{name}.{BLOB_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_packing() {
        let id = FileId::new(0xDEAD_BEEF, 0x1234_5678);
        assert_eq!(id.directory_id(), 0xDEAD_BEEF);
        assert_eq!(id.snowflake_id(), 0x1234_5678);
        assert_eq!(id.storage_id(), 0xBEEF);
        assert!(!id.is_none());
    }

    #[test]
    fn test_file_id_none() {
        assert!(FileId::NONE.is_none());
        assert!(FileId::default().is_none());
        assert!(!FileId::new(0, 1).is_none());
    }

    #[test]
    fn test_file_id_raw_round_trip() {
        let id = FileId::new(7, 9);
        assert_eq!(FileId::from_raw(id.raw()), id);
    }

    #[test]
    fn test_blob_path_deterministic() {
        let root = Path::new("/data/shard0");
        assert_eq!(blob_path(root, 42), blob_path(root, 42));
        assert_ne!(blob_path(root, 42), blob_path(root, 43));
    }

    #[test]
    fn test_blob_path_shape() {
        let root = Path::new("r");
        let path = blob_path(root, 0x12AB_34CD);
        let subdir = path.parent().unwrap().file_name().unwrap();
        assert_eq!(subdir.to_str().unwrap().len(), 2);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".zen"));
        assert_eq!(name.len(), 6 + 1 + 3);
    }

    #[test]
    fn test_blob_path_subdir_spread() {
        // ids differing only in their top byte land in different subdirs
        let root = Path::new("r");
        let a = blob_path(root, 0x0100_0000);
        let b = blob_path(root, 0x0200_0000);
        assert_ne!(a.parent(), b.parent());
    }

    #[test]
    fn test_alphabet_characters() {
        let root = Path::new("r");
        let path = blob_path(root, 0xFFFF_FFFF);
        let name = path.file_name().unwrap().to_str().unwrap();
        // nibble 0xF maps to 'B' in the custom alphabet
        assert!(name.starts_with("BBBBBB"));
    }
}
