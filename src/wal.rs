//! Append-only, crash-durable operation log.
//!
//! Each record is a 4-byte length prefix, then LSN, tx-id, op-type,
//! timestamp, a payload whose shape depends on the op-type, and a
//! trailing CRC-32 over everything before it. The engine only ever
//! produces one record shape, so a plain enum is enough; there's no
//! need for a generic adapter layer on top of it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{RazorError, Result};

pub const WAL_MAGIC: u32 = 0x52465741; // "RFWA"
pub const WAL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    Begin = 0,
    Insert = 1,
    Delete = 2,
    Update = 3,
    Rename = 4,
    Write = 5,
    Commit = 6,
    Abort = 7,
    Checkpoint = 8,
}

impl OpType {
    fn from_u8(b: u8) -> Option<OpType> {
        Some(match b {
            0 => OpType::Begin,
            1 => OpType::Insert,
            2 => OpType::Delete,
            3 => OpType::Update,
            4 => OpType::Rename,
            5 => OpType::Write,
            6 => OpType::Commit,
            7 => OpType::Abort,
            8 => OpType::Checkpoint,
            _ => return None,
        })
    }
}

pub const FIELD_SIZE: u8 = 1 << 0;
pub const FIELD_MTIME: u8 = 1 << 1;
pub const FIELD_MODE: u8 = 1 << 2;
pub const FIELD_UID: u8 = 1 << 3;
pub const FIELD_GID: u8 = 1 << 4;

#[derive(Debug, Clone)]
pub enum Payload {
    Begin,
    Insert {
        parent_idx: u16,
        name_offset: u32,
        mode: u8,
        uid: u32,
        gid: u32,
        new_node_idx: u16,
        assigned_inode: u32,
    },
    Delete {
        parent_idx: u16,
        node_idx: u16,
        prior_name_offset: u32,
        prior_mode: u8,
        prior_size: u64,
        prior_inode: u32,
        prior_uid: u32,
        prior_gid: u32,
        prior_mtime: u32,
    },
    Update {
        node_idx: u16,
        field_mask: u8,
        new_size: u64,
        new_mtime: u32,
        new_mode: u8,
        new_uid: u32,
        new_gid: u32,
        prior_size: u64,
        prior_mtime: u32,
        prior_mode: u8,
        prior_uid: u32,
        prior_gid: u32,
    },
    Rename {
        old_parent: u16,
        new_parent: u16,
        old_name_offset: u32,
        new_name_offset: u32,
    },
    Write {
        inode: u32,
        offset: u64,
        length: u32,
        prior_size: u64,
        content_hash: u64,
    },
    Commit,
    Abort,
    Checkpoint {
        live_inodes: Vec<u32>,
        next_inode: u32,
    },
}

impl Payload {
    fn op_type(&self) -> OpType {
        match self {
            Payload::Begin => OpType::Begin,
            Payload::Insert { .. } => OpType::Insert,
            Payload::Delete { .. } => OpType::Delete,
            Payload::Update { .. } => OpType::Update,
            Payload::Rename { .. } => OpType::Rename,
            Payload::Write { .. } => OpType::Write,
            Payload::Commit => OpType::Commit,
            Payload::Abort => OpType::Abort,
            Payload::Checkpoint { .. } => OpType::Checkpoint,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Payload::Begin | Payload::Commit | Payload::Abort => {}
            Payload::Insert {
                parent_idx,
                name_offset,
                mode,
                uid,
                gid,
                new_node_idx,
                assigned_inode,
            } => {
                buf.extend_from_slice(&parent_idx.to_le_bytes());
                buf.extend_from_slice(&name_offset.to_le_bytes());
                buf.push(*mode);
                buf.extend_from_slice(&uid.to_le_bytes());
                buf.extend_from_slice(&gid.to_le_bytes());
                buf.extend_from_slice(&new_node_idx.to_le_bytes());
                buf.extend_from_slice(&assigned_inode.to_le_bytes());
            }
            Payload::Delete {
                parent_idx,
                node_idx,
                prior_name_offset,
                prior_mode,
                prior_size,
                prior_inode,
                prior_uid,
                prior_gid,
                prior_mtime,
            } => {
                buf.extend_from_slice(&parent_idx.to_le_bytes());
                buf.extend_from_slice(&node_idx.to_le_bytes());
                buf.extend_from_slice(&prior_name_offset.to_le_bytes());
                buf.push(*prior_mode);
                buf.extend_from_slice(&prior_size.to_le_bytes());
                buf.extend_from_slice(&prior_inode.to_le_bytes());
                buf.extend_from_slice(&prior_uid.to_le_bytes());
                buf.extend_from_slice(&prior_gid.to_le_bytes());
                buf.extend_from_slice(&prior_mtime.to_le_bytes());
            }
            Payload::Update {
                node_idx,
                field_mask,
                new_size,
                new_mtime,
                new_mode,
                new_uid,
                new_gid,
                prior_size,
                prior_mtime,
                prior_mode,
                prior_uid,
                prior_gid,
            } => {
                buf.extend_from_slice(&node_idx.to_le_bytes());
                buf.push(*field_mask);
                buf.extend_from_slice(&new_size.to_le_bytes());
                buf.extend_from_slice(&new_mtime.to_le_bytes());
                buf.push(*new_mode);
                buf.extend_from_slice(&new_uid.to_le_bytes());
                buf.extend_from_slice(&new_gid.to_le_bytes());
                buf.extend_from_slice(&prior_size.to_le_bytes());
                buf.extend_from_slice(&prior_mtime.to_le_bytes());
                buf.push(*prior_mode);
                buf.extend_from_slice(&prior_uid.to_le_bytes());
                buf.extend_from_slice(&prior_gid.to_le_bytes());
            }
            Payload::Rename {
                old_parent,
                new_parent,
                old_name_offset,
                new_name_offset,
            } => {
                buf.extend_from_slice(&old_parent.to_le_bytes());
                buf.extend_from_slice(&new_parent.to_le_bytes());
                buf.extend_from_slice(&old_name_offset.to_le_bytes());
                buf.extend_from_slice(&new_name_offset.to_le_bytes());
            }
            Payload::Write {
                inode,
                offset,
                length,
                prior_size,
                content_hash,
            } => {
                buf.extend_from_slice(&inode.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&length.to_le_bytes());
                buf.extend_from_slice(&prior_size.to_le_bytes());
                buf.extend_from_slice(&content_hash.to_le_bytes());
            }
            Payload::Checkpoint { live_inodes, next_inode } => {
                buf.extend_from_slice(&(live_inodes.len() as u32).to_le_bytes());
                for ino in live_inodes {
                    buf.extend_from_slice(&ino.to_le_bytes());
                }
                buf.extend_from_slice(&next_inode.to_le_bytes());
            }
        }
    }

    fn decode(op: OpType, buf: &[u8]) -> Option<Payload> {
        let mut p = Cursor(buf);
        Some(match op {
            OpType::Begin => Payload::Begin,
            OpType::Commit => Payload::Commit,
            OpType::Abort => Payload::Abort,
            OpType::Insert => Payload::Insert {
                parent_idx: p.u16()?,
                name_offset: p.u32()?,
                mode: p.u8()?,
                uid: p.u32()?,
                gid: p.u32()?,
                new_node_idx: p.u16()?,
                assigned_inode: p.u32()?,
            },
            OpType::Delete => Payload::Delete {
                parent_idx: p.u16()?,
                node_idx: p.u16()?,
                prior_name_offset: p.u32()?,
                prior_mode: p.u8()?,
                prior_size: p.u64()?,
                prior_inode: p.u32()?,
                prior_uid: p.u32()?,
                prior_gid: p.u32()?,
                prior_mtime: p.u32()?,
            },
            OpType::Update => Payload::Update {
                node_idx: p.u16()?,
                field_mask: p.u8()?,
                new_size: p.u64()?,
                new_mtime: p.u32()?,
                new_mode: p.u8()?,
                new_uid: p.u32()?,
                new_gid: p.u32()?,
                prior_size: p.u64()?,
                prior_mtime: p.u32()?,
                prior_mode: p.u8()?,
                prior_uid: p.u32()?,
                prior_gid: p.u32()?,
            },
            OpType::Rename => Payload::Rename {
                old_parent: p.u16()?,
                new_parent: p.u16()?,
                old_name_offset: p.u32()?,
                new_name_offset: p.u32()?,
            },
            OpType::Write => Payload::Write {
                inode: p.u32()?,
                offset: p.u64()?,
                length: p.u32()?,
                prior_size: p.u64()?,
                content_hash: p.u64()?,
            },
            OpType::Checkpoint => {
                let n = p.u32()? as usize;
                let mut live_inodes = Vec::with_capacity(n);
                for _ in 0..n {
                    live_inodes.push(p.u32()?);
                }
                Payload::Checkpoint { live_inodes, next_inode: p.u32()? }
            }
        })
    }
}

struct Cursor<'a>(&'a [u8]);
impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Some(head)
    }
    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }
    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub lsn: u64,
    pub tx_id: u64,
    pub timestamp: u32,
    pub payload: Payload,
}

impl Record {
    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        body.extend_from_slice(&self.lsn.to_le_bytes());
        body.extend_from_slice(&self.tx_id.to_le_bytes());
        body.push(self.payload.op_type() as u8);
        body.extend_from_slice(&self.timestamp.to_le_bytes());
        self.payload.encode(&mut body);

        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    first_lsn: u64,
    last_lsn: u64,
    last_checkpoint_lsn: u64,
    clean_shutdown: bool,
}

const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 1;

impl Header {
    fn fresh() -> Header {
        Header { first_lsn: 1, last_lsn: 0, last_checkpoint_lsn: 0, clean_shutdown: true }
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&WAL_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.first_lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_lsn.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_checkpoint_lsn.to_le_bytes());
        buf[32] = self.clean_shutdown as u8;
        buf
    }

    fn decode(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_LEN {
            return Err(RazorError::Corruption("WAL header truncated".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if magic != WAL_MAGIC {
            return Err(RazorError::Corruption("bad WAL magic".into()));
        }
        if version != WAL_VERSION {
            return Err(RazorError::Corruption(format!("unsupported WAL version {version}")));
        }
        Ok(Header {
            first_lsn: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            last_lsn: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            last_checkpoint_lsn: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            clean_shutdown: buf[32] != 0,
        })
    }
}

struct GroupCommitState {
    /// Bytes written (ticket) that still need an fsync.
    pending_ticket: u64,
    /// Bytes written that are already durable.
    durable_ticket: u64,
    flushing: bool,
}

/// Append-only WAL file with group commit.
pub struct Wal {
    file: Mutex<File>,
    next_lsn: AtomicU64,
    last_checkpoint_lsn: AtomicU64,
    clean_shutdown_on_open: bool,
    group_commit: Mutex<GroupCommitState>,
    group_commit_cv: Condvar,
    window: Duration,
}

impl Wal {
    pub fn open(path: &Path, group_commit_window_ms: u64) -> Result<Wal> {
        let fresh = !path.exists();
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let header = if fresh {
            let h = Header::fresh();
            file.write_all(&h.encode())?;
            file.sync_all()?;
            h
        } else {
            let mut buf = vec![0u8; HEADER_LEN];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            Header::decode(&buf)?
        };
        let clean_shutdown_on_open = header.clean_shutdown && fresh.then_some(true).unwrap_or(header.clean_shutdown);
        // Mark the file dirty for the duration of this mount; a clean
        // `close()` restores the clean bit.
        Self::write_clean_flag(&mut file, false)?;
        file.sync_all()?;
        Ok(Wal {
            file: Mutex::new(file),
            next_lsn: AtomicU64::new(header.last_lsn + 1),
            last_checkpoint_lsn: AtomicU64::new(header.last_checkpoint_lsn),
            clean_shutdown_on_open: header.clean_shutdown,
            group_commit: Mutex::new(GroupCommitState { pending_ticket: 0, durable_ticket: 0, flushing: false }),
            group_commit_cv: Condvar::new(),
            window: Duration::from_millis(group_commit_window_ms.max(1)),
        })
    }

    /// True if recovery must run before serving requests.
    pub fn needs_recovery(&self) -> bool {
        !self.clean_shutdown_on_open
    }

    fn write_clean_flag(file: &mut File, clean: bool) -> Result<()> {
        file.seek(SeekFrom::Start(32))?;
        file.write_all(&[clean as u8])?;
        Ok(())
    }

    fn write_last_lsn(file: &mut File, lsn: u64) -> Result<()> {
        file.seek(SeekFrom::Start(16))?;
        file.write_all(&lsn.to_le_bytes())?;
        Ok(())
    }

    fn write_last_checkpoint(file: &mut File, lsn: u64) -> Result<()> {
        file.seek(SeekFrom::Start(24))?;
        file.write_all(&lsn.to_le_bytes())?;
        Ok(())
    }

    /// Appends one record under the single append lock; the
    /// durability barrier happens outside this lock in `commit_barrier`
    /// so independent transactions can share one fsync.
    pub fn append(&self, tx_id: u64, timestamp: u32, payload: Payload) -> Result<u64> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = Record { lsn, tx_id, timestamp, payload };
        let bytes = record.encode();
        let mut file = self.file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&bytes)?;
        Self::write_last_lsn(&mut file, lsn)?;
        debug!("wal: appended lsn={lsn} tx={tx_id} op={:?}", record.payload.op_type());
        Ok(lsn)
    }

    /// Durability barrier. Multiple callers arriving within `window`
    /// of each other share a single fsync (group commit).
    pub fn commit_barrier(&self) -> Result<()> {
        let mut state = self.group_commit.lock();
        let my_ticket = state.pending_ticket + 1;
        state.pending_ticket = my_ticket;
        if !state.flushing {
            state.flushing = true;
            drop(state);
            std::thread::sleep(self.window);
            let file = self.file.lock();
            file.sync_all().map_err(RazorError::from)?;
            drop(file);
            let mut state = self.group_commit.lock();
            state.durable_ticket = state.pending_ticket;
            state.flushing = false;
            self.group_commit_cv.notify_all();
        } else {
            self.group_commit_cv.wait_while(&mut state, |s| s.durable_ticket < my_ticket);
        }
        Ok(())
    }

    pub fn last_checkpoint_lsn(&self) -> u64 {
        self.last_checkpoint_lsn.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self, live_inodes: Vec<u32>, next_inode: u32, timestamp: u32) -> Result<u64> {
        let lsn = self.append(0, timestamp, Payload::Checkpoint { live_inodes, next_inode })?;
        self.commit_barrier()?;
        let mut file = self.file.lock();
        Self::write_last_checkpoint(&mut file, lsn)?;
        file.sync_all()?;
        self.last_checkpoint_lsn.store(lsn, Ordering::SeqCst);
        Ok(lsn)
    }

    pub fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Scans the whole log from the first record on. Callers that only
    /// care about what happened since the last checkpoint should filter
    /// the result against `last_checkpoint_lsn()` themselves. A record
    /// whose CRC fails, or whose LSN does not strictly increase, ends
    /// the scan: everything after it is a torn tail and is discarded.
    pub fn scan(&self) -> Result<Vec<Record>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        drop(file);

        let mut records = Vec::new();
        let mut pos = 0usize;
        let mut last_lsn = 0u64;
        while pos + 4 <= raw.len() {
            let len = u32::from_le_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
            let record_end = pos + 4 + len + 4;
            if record_end > raw.len() {
                warn!("wal: torn tail at byte {pos}, discarding remainder");
                break;
            }
            let crc_recorded = u32::from_le_bytes(raw[pos + 4 + len..record_end].try_into().unwrap());
            let crc_actual = crc32fast::hash(&raw[pos..pos + 4 + len]);
            if crc_recorded != crc_actual {
                warn!("wal: CRC mismatch at byte {pos}, discarding remainder as torn tail");
                break;
            }
            let body = &raw[pos + 4..pos + 4 + len];
            if body.len() < 21 {
                warn!("wal: short record body at byte {pos}, discarding remainder");
                break;
            }
            let lsn = u64::from_le_bytes(body[0..8].try_into().unwrap());
            let tx_id = u64::from_le_bytes(body[8..16].try_into().unwrap());
            let op = match OpType::from_u8(body[16]) {
                Some(op) => op,
                None => {
                    warn!("wal: unknown op-type at byte {pos}, discarding remainder");
                    break;
                }
            };
            let timestamp = u32::from_le_bytes(body[17..21].try_into().unwrap());
            if lsn <= last_lsn {
                warn!("wal: LSN {lsn} not strictly greater than {last_lsn}, discarding remainder as torn tail");
                break;
            }
            let payload = match Payload::decode(op, &body[21..]) {
                Some(p) => p,
                None => {
                    warn!("wal: malformed payload at byte {pos}, discarding remainder");
                    break;
                }
            };
            records.push(Record { lsn, tx_id, timestamp, payload });
            last_lsn = lsn;
            pos = record_end;
        }
        Ok(records)
    }

    /// Detach: durability barrier, mark clean, release.
    pub fn close(&self) -> Result<()> {
        self.commit_barrier()?;
        let mut file = self.file.lock();
        Self::write_clean_flag(&mut file, true)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_wal_does_not_need_recovery() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal.log"), 1).unwrap();
        assert!(!wal.needs_recovery());
    }

    #[test]
    fn reopening_a_dirty_wal_requires_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path, 1).unwrap();
            wal.append(1, 0, Payload::Begin).unwrap();
            // no close() -> simulates a crash
        }
        let wal = Wal::open(&path, 1).unwrap();
        assert!(wal.needs_recovery());
    }

    #[test]
    fn clean_close_leaves_wal_clean_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path, 1).unwrap();
            wal.append(1, 0, Payload::Begin).unwrap();
            wal.append(1, 0, Payload::Commit).unwrap();
            wal.close().unwrap();
        }
        let wal = Wal::open(&path, 1).unwrap();
        assert!(!wal.needs_recovery());
    }

    #[test]
    fn records_round_trip_through_scan() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal.log"), 1).unwrap();
        wal.append(1, 10, Payload::Begin).unwrap();
        wal.append(
            1,
            10,
            Payload::Insert {
                parent_idx: 0,
                name_offset: 5,
                mode: 0b01_111_111,
                uid: 0,
                gid: 0,
                new_node_idx: 1,
                assigned_inode: 2,
            },
        )
        .unwrap();
        wal.append(1, 10, Payload::Commit).unwrap();
        let records = wal.scan().unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0].payload, Payload::Begin));
        assert!(matches!(records[1].payload, Payload::Insert { .. }));
        assert!(matches!(records[2].payload, Payload::Commit));
        assert!(records.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn torn_tail_is_discarded_without_poisoning_earlier_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let wal = Wal::open(&path, 1).unwrap();
        wal.append(1, 0, Payload::Begin).unwrap();
        wal.append(1, 0, Payload::Commit).unwrap();
        drop(wal);

        // corrupt the tail with a partial trailing record
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02]).unwrap();

        let wal = Wal::open(&path, 1).unwrap();
        let records = wal.scan().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn group_commit_lets_concurrent_committers_share_one_barrier() {
        use std::sync::Arc;
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(&dir.path().join("wal.log"), 5).unwrap());
        let mut handles = vec![];
        for i in 0..8u64 {
            let wal = wal.clone();
            handles.push(std::thread::spawn(move || {
                wal.append(i, 0, Payload::Begin).unwrap();
                wal.commit_barrier().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wal.scan().unwrap().len(), 8);
    }
}
