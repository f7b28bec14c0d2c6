//! Durable identity allocation over a fixed-layout slot file.
//!
//! The registry maps identity keys to small numeric ids. Ids are claimed
//! lock-free with a compare-and-swap on a per-slot liveness word and are
//! never reused for the lifetime of the backing file. Each slot occupies
//! one 64-byte cache line, so two threads claiming neighbouring slots
//! never contend on the same line.
//!
//! On-disk layout, per slot (little-endian):
//!
//! ```text
//! offset 0   u32  liveness (0 = free, 1 = live)
//! offset 4   u32  id (slot index + 1)
//! offset 8   [u8; 32] identity key, NUL padded
//! offset 40  [u8; 24] reserved, always zero
//! ```

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::OnceCell;
use thiserror::Error;

/// Size of one slot in the backing file. One cache line.
pub const SLOT_SIZE: usize = 64;
/// Bytes reserved for the identity key inside a slot. The last byte is
/// always NUL, so a stored key holds at most `KEY_SIZE - 1` bytes.
pub const KEY_SIZE: usize = 32;
/// Slot capacity of a registry opened with [`IdentityRegistry::open`].
pub const DEFAULT_CAPACITY: usize = 1024;

const LIVENESS_OFFSET: usize = 0;
const ID_OFFSET: usize = 4;
const KEY_OFFSET: usize = 8;

// Liveness words. `SLOT_RESERVED` exists only in memory while the winning
// claimant fills in its slot; the file only ever holds 0 or 1.
const SLOT_FREE: u32 = 0;
const SLOT_LIVE: u32 = 1;
const SLOT_RESERVED: u32 = 2;

/// Identifier handed out by the registry. Ids are 1-based; id `n` lives in
/// slot `n - 1`, and 0 is never a valid id.
pub type IdentityId = u32;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("identity registry full: all {capacity} slots claimed")]
    Full { capacity: usize },
    #[error("registry capacity {capacity} does not fit in a u32 id")]
    CapacityTooLarge { capacity: usize },
    #[error("failed to initialize identity storage at {path:?}: {source}")]
    StorageInit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("identity storage at {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to persist identity slot {index} at {path:?}: {source}")]
    Persist {
        index: usize,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn storage_init(path: &Path, source: io::Error) -> RegistryError {
    RegistryError::StorageInit {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> RegistryError {
    RegistryError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Immutable snapshot of a claimed slot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityBlock {
    id: IdentityId,
    key: [u8; KEY_SIZE],
}

impl IdentityBlock {
    pub fn id(&self) -> IdentityId {
        self.id
    }

    /// The identity key with NUL padding stripped. Keys written through
    /// [`IdentityRegistry::allocate`] are always valid UTF-8; bytes a
    /// foreign writer left behind are replaced lossily.
    pub fn key(&self) -> String {
        let end = self.key.iter().position(|&b| b == 0).unwrap_or(KEY_SIZE);
        String::from_utf8_lossy(&self.key[..end]).into_owned()
    }

    /// Raw key bytes, including NUL padding.
    pub fn key_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for IdentityBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityBlock")
            .field("id", &self.id)
            .field("key", &self.key())
            .finish()
    }
}

struct Slot {
    liveness: AtomicU32,
    block: OnceCell<IdentityBlock>,
}

impl Slot {
    fn free() -> Self {
        Slot {
            liveness: AtomicU32::new(SLOT_FREE),
            block: OnceCell::new(),
        }
    }

    fn live(block: IdentityBlock) -> Self {
        Slot {
            liveness: AtomicU32::new(SLOT_LIVE),
            block: OnceCell::with_value(block),
        }
    }

    fn is_live(&self) -> bool {
        self.liveness.load(Ordering::Acquire) == SLOT_LIVE
    }
}

/// Persistent key-to-id allocator backed by a fixed-size slot file.
///
/// `allocate` takes `&self` and is safe to call from many threads at once;
/// every other accessor is a read. Claims are written through to the file
/// and fsynced before the id is returned, so a claim that was handed out
/// survives reopening the file.
pub struct IdentityRegistry {
    path: PathBuf,
    slots: Vec<Slot>,
}

impl IdentityRegistry {
    /// Opens (creating if absent) a registry with [`DEFAULT_CAPACITY`] slots.
    pub fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        Self::open_with_capacity(path, DEFAULT_CAPACITY)
    }

    /// Opens (creating if absent) a registry with `capacity` slots.
    ///
    /// A fresh file is sized to exactly `capacity * SLOT_SIZE` zero bytes.
    /// An existing file must have that exact length and every slot must
    /// parse. A capacity whose highest slot id would not fit in a `u32` is
    /// refused before the file is touched.
    pub fn open_with_capacity(path: impl AsRef<Path>, capacity: usize) -> RegistryResult<Self> {
        if capacity >= u32::MAX as usize {
            return Err(RegistryError::CapacityTooLarge { capacity });
        }
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| storage_init(&path, err))?;
        let expected_len = (capacity * SLOT_SIZE) as u64;
        let len = file
            .metadata()
            .map_err(|err| storage_init(&path, err))?
            .len();
        if len == 0 {
            file.set_len(expected_len)
                .map_err(|err| storage_init(&path, err))?;
        } else if len != expected_len {
            return Err(corrupt(
                &path,
                format!("file is {len} bytes, expected {expected_len}"),
            ));
        }
        let mut bytes = vec![0u8; capacity * SLOT_SIZE];
        file.read_exact(&mut bytes)
            .map_err(|err| storage_init(&path, err))?;

        let mut slots = Vec::with_capacity(capacity);
        let mut live = 0usize;
        for (index, raw) in bytes.chunks_exact(SLOT_SIZE).enumerate() {
            match read_word(raw, LIVENESS_OFFSET) {
                SLOT_FREE => slots.push(Slot::free()),
                SLOT_LIVE => {
                    let id = read_word(raw, ID_OFFSET);
                    if id as usize != index + 1 {
                        return Err(corrupt(
                            &path,
                            format!("slot {index} claims id {id}, expected {}", index + 1),
                        ));
                    }
                    let mut key = [0u8; KEY_SIZE];
                    key.copy_from_slice(&raw[KEY_OFFSET..KEY_OFFSET + KEY_SIZE]);
                    slots.push(Slot::live(IdentityBlock { id, key }));
                    live += 1;
                }
                other => {
                    return Err(corrupt(
                        &path,
                        format!("slot {index} has liveness word {other}"),
                    ));
                }
            }
        }
        log::debug!(
            "attached identity registry at {} ({live}/{capacity} slots live)",
            path.display()
        );
        Ok(Self { path, slots })
    }

    /// Claims the lowest free slot for `key` and returns its id.
    ///
    /// Keys longer than `KEY_SIZE - 1` bytes are truncated at a character
    /// boundary before they are stored; two keys that agree on their
    /// truncated form claim distinct ids but are indistinguishable to
    /// [`IdentityRegistry::find`]. Returns [`RegistryError::Full`] once
    /// every slot is claimed. If the write-through fails the claimed slot
    /// stays reserved in memory and is not handed out again.
    pub fn allocate(&self, key: &str) -> RegistryResult<IdentityId> {
        let encoded = encode_key(key);
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .liveness
                .compare_exchange(SLOT_FREE, SLOT_RESERVED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // This thread owns the slot from here on.
            let id = (index + 1) as IdentityId;
            let block = *slot.block.get_or_init(|| IdentityBlock { id, key: encoded });
            self.write_slot(index, &block)
                .map_err(|err| RegistryError::Persist {
                    index,
                    path: self.path.clone(),
                    source: err,
                })?;
            slot.liveness.store(SLOT_LIVE, Ordering::Release);
            return Ok(id);
        }
        Err(RegistryError::Full {
            capacity: self.slots.len(),
        })
    }

    /// Looks up the block claimed under `id`, if any.
    pub fn lookup(&self, id: IdentityId) -> Option<IdentityBlock> {
        if id == 0 {
            return None;
        }
        let slot = self.slots.get(id as usize - 1)?;
        if !slot.is_live() {
            return None;
        }
        slot.block.get().copied()
    }

    /// Returns the first live block whose stored key matches `key`.
    ///
    /// `key` is truncated the same way `allocate` truncates it, so a find
    /// with the original over-long key still matches.
    pub fn find(&self, key: &str) -> Option<IdentityBlock> {
        let encoded = encode_key(key);
        self.iter_live().find(|block| block.key == encoded)
    }

    /// Snapshot of every live block, in slot order.
    pub fn blocks(&self) -> Vec<IdentityBlock> {
        self.iter_live().collect()
    }

    /// Number of claimed slots.
    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn iter_live(&self) -> impl Iterator<Item = IdentityBlock> + '_ {
        self.slots
            .iter()
            .filter(|slot| slot.is_live())
            .filter_map(|slot| slot.block.get().copied())
    }

    fn write_slot(&self, index: usize, block: &IdentityBlock) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start((index * SLOT_SIZE) as u64))?;
        file.write_all(&encode_slot(block))?;
        file.sync_all()?;
        Ok(())
    }
}

impl fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("path", &self.path)
            .field("capacity", &self.slots.len())
            .field("allocated", &self.allocated())
            .finish()
    }
}

fn read_word(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
}

fn encode_slot(block: &IdentityBlock) -> [u8; SLOT_SIZE] {
    let mut raw = [0u8; SLOT_SIZE];
    raw[LIVENESS_OFFSET..LIVENESS_OFFSET + 4].copy_from_slice(&SLOT_LIVE.to_le_bytes());
    raw[ID_OFFSET..ID_OFFSET + 4].copy_from_slice(&block.id.to_le_bytes());
    raw[KEY_OFFSET..KEY_OFFSET + KEY_SIZE].copy_from_slice(&block.key);
    raw
}

fn encode_key(key: &str) -> [u8; KEY_SIZE] {
    let mut buf = [0u8; KEY_SIZE];
    let mut len = key.len().min(KEY_SIZE - 1);
    while !key.is_char_boundary(len) {
        len -= 1;
    }
    buf[..len].copy_from_slice(&key.as_bytes()[..len]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry_path(tmp: &TempDir) -> PathBuf {
        tmp.path().join("identities.bin")
    }

    #[test]
    fn allocates_sequential_ids() {
        let tmp = TempDir::new().unwrap();
        let registry = IdentityRegistry::open_with_capacity(registry_path(&tmp), 8).unwrap();
        for n in 1..=8u32 {
            let id = registry.allocate(&format!("entity-{n}")).unwrap();
            assert_eq!(id, n);
        }
        assert_eq!(registry.allocated(), 8);
        let err = registry.allocate("one-too-many").unwrap_err();
        assert!(matches!(err, RegistryError::Full { capacity: 8 }));
    }

    #[test]
    fn lookup_round_trips_key() {
        let tmp = TempDir::new().unwrap();
        let registry = IdentityRegistry::open_with_capacity(registry_path(&tmp), 4).unwrap();
        let id = registry.allocate("the man").unwrap();
        let block = registry.lookup(id).unwrap();
        assert_eq!(block.id(), id);
        assert_eq!(block.key(), "the man");
        assert_eq!(&block.key_bytes()[..7], b"the man");
        assert!(block.key_bytes()[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn lookup_misses_are_none() {
        let tmp = TempDir::new().unwrap();
        let registry = IdentityRegistry::open_with_capacity(registry_path(&tmp), 4).unwrap();
        registry.allocate("only").unwrap();
        assert!(registry.lookup(0).is_none());
        assert!(registry.lookup(2).is_none());
        assert!(registry.lookup(99).is_none());
    }

    #[test]
    fn find_matches_truncated_key() {
        let tmp = TempDir::new().unwrap();
        let registry = IdentityRegistry::open_with_capacity(registry_path(&tmp), 4).unwrap();
        let long = "a".repeat(KEY_SIZE + 9);
        let id = registry.allocate(&long).unwrap();
        let block = registry.find(&long).unwrap();
        assert_eq!(block.id(), id);
        assert_eq!(block.key().len(), KEY_SIZE - 1);
        assert!(registry.find("a").is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let tmp = TempDir::new().unwrap();
        let registry = IdentityRegistry::open_with_capacity(registry_path(&tmp), 4).unwrap();
        // 15 two-byte characters: byte 31 falls inside the 16th.
        let key = "é".repeat(20);
        let id = registry.allocate(&key).unwrap();
        let stored = registry.lookup(id).unwrap().key();
        assert_eq!(stored, "é".repeat(15));
    }

    #[test]
    fn slot_bytes_match_layout() {
        let tmp = TempDir::new().unwrap();
        let path = registry_path(&tmp);
        let registry = IdentityRegistry::open_with_capacity(&path, 4).unwrap();
        registry.allocate("the man").unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 4 * SLOT_SIZE);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..15], b"the man");
        assert!(bytes[15..SLOT_SIZE].iter().all(|&b| b == 0));
        assert!(bytes[SLOT_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_capacity_beyond_the_id_range() {
        let tmp = TempDir::new().unwrap();
        let path = registry_path(&tmp);
        let err = IdentityRegistry::open_with_capacity(&path, u32::MAX as usize).unwrap_err();
        assert!(matches!(err, RegistryError::CapacityTooLarge { .. }));
        // Refused before the backing file was created.
        assert!(!path.exists());
    }

    #[test]
    fn rejects_wrong_file_length() {
        let tmp = TempDir::new().unwrap();
        let path = registry_path(&tmp);
        fs::write(&path, vec![0u8; 3 * SLOT_SIZE]).unwrap();
        let err = IdentityRegistry::open_with_capacity(&path, 4).unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { .. }));
    }

    #[test]
    fn rejects_unknown_liveness_word() {
        let tmp = TempDir::new().unwrap();
        let path = registry_path(&tmp);
        let mut bytes = vec![0u8; 4 * SLOT_SIZE];
        bytes[0..4].copy_from_slice(&3u32.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        let err = IdentityRegistry::open_with_capacity(&path, 4).unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { .. }));
    }

    #[test]
    fn rejects_id_slot_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = registry_path(&tmp);
        let mut bytes = vec![0u8; 4 * SLOT_SIZE];
        bytes[0..4].copy_from_slice(&1u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        let err = IdentityRegistry::open_with_capacity(&path, 4).unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { .. }));
    }

    #[test]
    fn empty_key_is_allowed() {
        let tmp = TempDir::new().unwrap();
        let registry = IdentityRegistry::open_with_capacity(registry_path(&tmp), 4).unwrap();
        let id = registry.allocate("").unwrap();
        assert_eq!(registry.lookup(id).unwrap().key(), "");
    }
}
