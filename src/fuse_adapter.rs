//! Thin `fuser::Filesystem` impl wiring kernel requests to `Engine`.
//!
//! One method per FUSE callback, translating each into the matching
//! `Engine` call and a `reply.error(errno)` on failure.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT};
use log::{debug, warn};

use crate::engine::Engine;
use crate::error::RazorError;
use crate::node::{FileKind, Mode, Node, R_BIT, W_BIT, X_BIT};
use crate::tree::MetadataUpdate;

const TTL: Duration = Duration::from_secs(1);

fn ino_to_idx(ino: u64) -> u16 {
    (ino.saturating_sub(1)) as u16
}

fn idx_to_ino(idx: u16) -> u64 {
    idx as u64 + 1
}

fn node_to_attr(ino: u64, node: &Node) -> FileAttr {
    let kind = if node.mode.is_directory() { FileType::Directory } else { FileType::RegularFile };
    let perm = 0o100 | ((node.mode.owner_rwx() as u16) << 6) | ((node.mode.shared_rwx() as u16) << 3) | (node.mode.shared_rwx() as u16);
    let mtime = UNIX_EPOCH + Duration::from_secs(node.mtime as u64);
    FileAttr {
        ino,
        size: node.size,
        blocks: node.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm,
        nlink: if node.mode.is_directory() { 2 } else { 1 },
        uid: node.uid,
        gid: node.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn errno(e: &RazorError) -> i32 {
    e.to_errno()
}

pub struct RazorFuse {
    engine: Engine,
}

impl RazorFuse {
    pub fn new(engine: Engine) -> RazorFuse {
        RazorFuse { engine }
    }

    fn caller(&self, req: &Request<'_>) -> (u32, Vec<u32>) {
        (req.uid(), vec![req.gid()])
    }
}

impl Filesystem for RazorFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut fuser::KernelConfig) -> Result<(), i32> {
        if self.engine.needs_consistency_check() {
            warn!("fuse: mounted after a recovered crash, a consistency check is recommended");
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.engine.unmount() {
            warn!("fuse: error during unmount: {e}");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.engine.lookup(ino_to_idx(parent), name.as_bytes()) {
            Ok((idx, node)) => reply.entry(&TTL, &node_to_attr(idx_to_ino(idx), &node), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.engine.getattr(ino_to_idx(ino)) {
            Ok(node) => reply.attr(&TTL, &node_to_attr(ino, &node)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let idx = ino_to_idx(ino);
        let mode_update = mode.map(|m| {
            let kind = if self.engine.getattr(idx).map(|n| n.mode.is_directory()).unwrap_or(false) {
                FileKind::Directory
            } else {
                FileKind::Regular
            };
            Mode::new(kind, ((m >> 6) & 0b111) as u8, (m & 0b111) as u8)
        });
        let mtime_secs = match mtime {
            Some(TimeOrNow::SpecificTime(t)) => t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).ok(),
            Some(TimeOrNow::Now) | None => None,
        };
        let update = MetadataUpdate { size, mtime: mtime_secs, mode: mode_update, uid, gid };
        if size.is_some() {
            if let Err(e) = self.engine.truncate(idx, size.unwrap()) {
                reply.error(errno(&e));
                return;
            }
        }
        match self.engine.setattr(idx, update) {
            Ok(node) => reply.attr(&TTL, &node_to_attr(ino, &node)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let (uid, gids) = self.caller(req);
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        let owner = ((mode >> 6) & 0b111) as u8;
        let shared = (mode & 0b111) as u8;
        match self.engine.create(ino_to_idx(parent), name.as_bytes(), FileKind::Directory, owner | X_BIT, shared, req.uid(), req.gid(), uid, &gids) {
            Ok((idx, _inode)) => {
                let node = self.engine.getattr(idx).unwrap();
                reply.entry(&TTL, &node_to_attr(idx_to_ino(idx), &node), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let (uid, gids) = self.caller(req);
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        let owner = ((mode >> 6) & 0b111) as u8;
        let shared = (mode & 0b111) as u8;
        match self.engine.create(ino_to_idx(parent), name.as_bytes(), FileKind::Regular, owner, shared, req.uid(), req.gid(), uid, &gids) {
            Ok((idx, _inode)) => {
                let node = self.engine.getattr(idx).unwrap();
                reply.created(&TTL, &node_to_attr(idx_to_ino(idx), &node), 0, 0, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (uid, gids) = self.caller(req);
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.engine.remove(ino_to_idx(parent), name.as_bytes(), uid, &gids) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.unlink(req, parent, name, reply)
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (uid, gids) = self.caller(req);
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(EINVAL);
            return;
        };
        match self.engine.rename(ino_to_idx(parent), name.as_bytes(), ino_to_idx(newparent), newname.as_bytes(), uid, &gids) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, size: u32, _flags: i32, _lock: Option<u64>, reply: ReplyData) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.engine.read(ino_to_idx(ino), offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.engine.write(ino_to_idx(ino), offset as u64, data) {
            Ok(_new_len) => reply.written(data.len() as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.engine.fsync(ino_to_idx(ino)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.engine.fsync(ino_to_idx(ino)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
        reply.ok()
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let idx = ino_to_idx(ino);
        let entries = match self.engine.readdir(idx) {
            Ok(e) => e,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };
        let mut all = vec![(ino, FileType::Directory, ".".to_string()), (ino, FileType::Directory, "..".to_string())];
        for (name, child_idx, node) in entries {
            let kind = if node.mode.is_directory() { FileType::Directory } else { FileType::RegularFile };
            all.push((idx_to_ino(child_idx), kind, String::from_utf8_lossy(&name).into_owned()));
        }
        for (i, (entry_ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok()
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.engine.getattr(ino_to_idx(ino)) {
            Ok(_) => reply.ok(),
            Err(_) => reply.error(ENOENT),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = self.engine.statfs();
        reply.statfs(s.total_nodes, s.free_node_slots, s.free_node_slots, s.used_nodes, s.free_node_slots, 4096, 255, 512);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ino_index_conversion_round_trips() {
        assert_eq!(ino_to_idx(idx_to_ino(0)), 0);
        assert_eq!(ino_to_idx(idx_to_ino(42)), 42);
        assert_eq!(idx_to_ino(0), 1);
    }

    #[test]
    fn directory_attr_has_execute_bit_set_for_owner() {
        let mut node = Node::default();
        node.mode = Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT);
        let attr = node_to_attr(1, &node);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm & 0o700, 0o700);
    }
}
