//! Append-only name interning pool.
//!
//! The buffer is the entire backing content (NUL-terminated strings
//! back to back); a name offset is stable for the table's lifetime.
//! Deduplication is an FNV-1a hash to offset map with linear-probing
//! collision resolution.

use fnv::FnvHasher;
use parking_lot::RwLock;
use std::hash::Hasher;

use crate::config::MAX_NAME_LEN;
use crate::error::{RazorError, Result};

const INITIAL_CAPACITY: usize = 4096;
const HASH_TABLE_INITIAL_SLOTS: usize = 1024;

struct Inner {
    buf: Vec<u8>,
    /// Open-addressed hash -> byte offset of the interned string.
    /// `None` marks an empty slot.
    hash_index: Vec<Option<u32>>,
}

impl Inner {
    fn hash_of(bytes: &[u8]) -> u64 {
        let mut h = FnvHasher::default();
        h.write(bytes);
        h.finish()
    }

    fn lookup(&self, name: &[u8]) -> Option<u32> {
        let slots = self.hash_index.len();
        if slots == 0 {
            return None;
        }
        let mut idx = (Self::hash_of(name) as usize) % slots;
        for _ in 0..slots {
            match self.hash_index[idx] {
                None => return None,
                Some(off) => {
                    if self.get(off) == name {
                        return Some(off);
                    }
                }
            }
            idx = (idx + 1) % slots;
        }
        None
    }

    fn insert_into_index(&mut self, name: &[u8], offset: u32) {
        if (self.live_entries() + 1) * 2 > self.hash_index.len() {
            self.rehash(self.hash_index.len() * 2);
        }
        let slots = self.hash_index.len();
        let mut idx = (Self::hash_of(name) as usize) % slots;
        loop {
            if self.hash_index[idx].is_none() {
                self.hash_index[idx] = Some(offset);
                return;
            }
            idx = (idx + 1) % slots;
        }
    }

    fn live_entries(&self) -> usize {
        self.hash_index.iter().filter(|s| s.is_some()).count()
    }

    fn rehash(&mut self, new_slots: usize) {
        let new_slots = new_slots.max(HASH_TABLE_INITIAL_SLOTS);
        let offsets: Vec<u32> = self.hash_index.iter().filter_map(|s| *s).collect();
        self.hash_index = vec![None; new_slots];
        for off in offsets {
            let name = self.get(off).to_vec();
            let mut idx = (Self::hash_of(&name) as usize) % new_slots;
            loop {
                if self.hash_index[idx].is_none() {
                    self.hash_index[idx] = Some(off);
                    break;
                }
                idx = (idx + 1) % new_slots;
            }
        }
    }

    fn get(&self, offset: u32) -> &[u8] {
        let start = offset as usize;
        let end = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(self.buf.len());
        &self.buf[start..end]
    }
}

/// Leaf lock: never held while acquiring a node lock.
pub struct StringTable {
    inner: RwLock<Inner>,
}

impl StringTable {
    pub fn new() -> StringTable {
        StringTable {
            inner: RwLock::new(Inner {
                buf: Vec::with_capacity(INITIAL_CAPACITY),
                hash_index: vec![None; HASH_TABLE_INITIAL_SLOTS],
            }),
        }
    }

    /// Rebuilds the table from raw buffer content on persistence
    /// attach: the used length is read back and the hash index is
    /// rebuilt by scanning NUL-terminated strings.
    pub fn from_raw(buf: Vec<u8>) -> StringTable {
        let mut inner = Inner {
            buf,
            hash_index: vec![None; HASH_TABLE_INITIAL_SLOTS],
        };
        let mut offset = 0u32;
        while (offset as usize) < inner.buf.len() {
            let name = inner.get(offset).to_vec();
            inner.insert_into_index(&name, offset);
            offset += name.len() as u32 + 1;
        }
        StringTable { inner: RwLock::new(inner) }
    }

    /// `intern(name) -> offset`: identical bytes always map to the
    /// same offset, stable for the table's lifetime.
    pub fn intern(&self, name: &[u8]) -> Result<u32> {
        if name.len() > MAX_NAME_LEN {
            return Err(RazorError::NameTooLong);
        }
        {
            let inner = self.inner.read();
            if let Some(off) = inner.lookup(name) {
                return Ok(off);
            }
        }
        let mut inner = self.inner.write();
        // Re-check: another writer may have interned it while we
        // upgraded from the read lock.
        if let Some(off) = inner.lookup(name) {
            return Ok(off);
        }
        if inner.buf.len() + name.len() + 1 > u32::MAX as usize {
            return Err(RazorError::OutOfSpace);
        }
        let offset = inner.buf.len() as u32;
        inner.buf.extend_from_slice(name);
        inner.buf.push(0);
        inner.insert_into_index(name, offset);
        Ok(offset)
    }

    pub fn get(&self, offset: u32) -> Vec<u8> {
        self.inner.read().get(offset).to_vec()
    }

    pub fn used_len(&self) -> usize {
        self.inner.read().buf.len()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.read().buf.clone()
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}
