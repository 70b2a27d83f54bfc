//! Facade tying the String Table, Tree Store, File-Data Store,
//! Persistence layer, WAL and Recovery together behind one mount
//! lifecycle.
//!
//! Everything the engine needs lives in ordinary instance state behind
//! one `Engine` value per mount, rather than process-global statics
//! (see DESIGN.md for the rationale) — the fork/retry/signal mount
//! loop itself lives in `main.rs`.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use nix::fcntl::{flock, FlockArg};

use crate::config::Config;
use crate::error::{RazorError, Result};
use crate::file_data;
use crate::node::{FileKind, Mode, Node};
use crate::persistence;
use crate::recovery;
use crate::string_table::StringTable;
use crate::tree::{MetadataUpdate, Tree, ROOT_INDEX};
use crate::wal::{Payload, Wal};

pub fn now_timestamp() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Statfs {
    pub total_nodes: u64,
    pub used_nodes: u64,
    pub total_bytes_stored: u64,
    pub free_node_slots: u64,
    pub name_table_bytes_used: u64,
}

/// Holds the exclusive `flock` on `<storage-dir>/.razorfs.lock` for the
/// engine's lifetime; dropping it (at unmount) releases the lock.
struct MountGuard {
    _file: File,
}

impl MountGuard {
    fn acquire(config: &Config) -> Result<MountGuard> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let file = OpenOptions::new().read(true).write(true).create(true).open(config.lock_path())?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| {
            RazorError::IOError(format!("another process already holds {}: {e}", config.lock_path().display()))
        })?;
        Ok(MountGuard { _file: file })
    }
}

pub struct Engine {
    config: Config,
    tree: Tree,
    strings: StringTable,
    wal: Wal,
    next_tx_id: AtomicU64,
    consistency_check_needed: AtomicBool,
    _mount_guard: MountGuard,
}

impl Engine {
    pub fn mount(config: Config) -> Result<Engine> {
        let mount_guard = MountGuard::acquire(&config)?;
        let root_mode = Mode::new(
            FileKind::Directory,
            crate::node::R_BIT | crate::node::W_BIT | crate::node::X_BIT,
            crate::node::R_BIT | crate::node::X_BIT,
        );
        let attached = persistence::attach(&config, 0, 0, root_mode)?;
        let wal = Wal::open(&config.wal_path(), config.group_commit_window_ms)?;

        let mut consistency_check_needed = false;
        if wal.needs_recovery() {
            warn!("engine: unclean shutdown detected, running recovery");
            // nodes.dat/strings.dat already reflect every record up to
            // and including the last checkpoint, so only records after
            // it need replaying; redoing the whole log from genesis
            // would re-apply records whose slot has since been freed
            // and reused by something unrelated.
            let checkpoint_lsn = wal.last_checkpoint_lsn();
            let records: Vec<_> = wal.scan()?.into_iter().filter(|r| r.lsn > checkpoint_lsn).collect();
            let report = recovery::recover(&attached.tree, &attached.strings, records);
            info!(
                "engine: recovery scanned {} record(s), redid {}, undid {}",
                report.records_scanned, report.transactions_redone, report.transactions_undone
            );
            persistence::flush(&config, &attached.tree, &attached.strings)?;
            let live_inodes: Vec<u32> = attached.tree.snapshot().into_iter().filter(|n| !n.is_free()).map(|n| n.inode).collect();
            wal.checkpoint(live_inodes, attached.tree.next_inode_hint(), now_timestamp())?;
            consistency_check_needed = true;
        }

        Ok(Engine {
            config,
            tree: attached.tree,
            strings: attached.strings,
            wal,
            next_tx_id: AtomicU64::new(1),
            consistency_check_needed: AtomicBool::new(consistency_check_needed),
            _mount_guard: mount_guard,
        })
    }

    pub fn needs_consistency_check(&self) -> bool {
        self.consistency_check_needed.load(Ordering::SeqCst)
    }

    fn begin_tx(&self, timestamp: u32) -> Result<u64> {
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        self.wal.append(tx_id, timestamp, Payload::Begin)?;
        Ok(tx_id)
    }

    fn commit_tx(&self, tx_id: u64, timestamp: u32) -> Result<()> {
        self.wal.append(tx_id, timestamp, Payload::Commit)?;
        self.wal.commit_barrier()
    }

    pub fn resolve(&self, path: &str) -> Result<u16> {
        self.tree.path_resolve(&self.strings, path)
    }

    pub fn lookup(&self, parent_idx: u16, name: &[u8]) -> Result<(u16, Node)> {
        let idx = self.tree.lookup_child(&self.strings, parent_idx, name)?;
        Ok((idx, self.tree.node_snapshot(idx)?))
    }

    pub fn getattr(&self, idx: u16) -> Result<Node> {
        self.tree.node_snapshot(idx)
    }

    pub fn readdir(&self, idx: u16) -> Result<Vec<(Vec<u8>, u16, Node)>> {
        self.tree.list(&self.strings, idx)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        parent_idx: u16,
        name: &[u8],
        kind: FileKind,
        owner_rwx: u8,
        shared_rwx: u8,
        uid: u32,
        gid: u32,
        caller_uid: u32,
        caller_gids: &[u32],
    ) -> Result<(u16, u32)> {
        if self.needs_consistency_check() {
            return Err(RazorError::RecoveryRequired);
        }
        let ts = now_timestamp();
        let tx = self.begin_tx(ts)?;
        let result = self.tree.insert(&self.strings, &self.wal, tx, ts, parent_idx, name, kind, owner_rwx, shared_rwx, uid, gid, caller_uid, caller_gids);
        match result {
            Ok(v) => {
                self.commit_tx(tx, ts)?;
                Ok(v)
            }
            Err(e) => {
                self.wal.append(tx, ts, Payload::Abort)?;
                Err(e)
            }
        }
    }

    pub fn remove(&self, parent_idx: u16, name: &[u8], caller_uid: u32, caller_gids: &[u32]) -> Result<()> {
        if self.needs_consistency_check() {
            return Err(RazorError::RecoveryRequired);
        }
        let ts = now_timestamp();
        let tx = self.begin_tx(ts)?;
        match self.tree.delete(&self.strings, &self.wal, tx, ts, parent_idx, name, caller_uid, caller_gids) {
            Ok(inode) => {
                self.commit_tx(tx, ts)?;
                file_data::remove_blob(&self.config.blob_path(inode))?;
                Ok(())
            }
            Err(e) => {
                self.wal.append(tx, ts, Payload::Abort)?;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rename(
        &self,
        old_parent_idx: u16,
        old_name: &[u8],
        new_parent_idx: u16,
        new_name: &[u8],
        caller_uid: u32,
        caller_gids: &[u32],
    ) -> Result<()> {
        if self.needs_consistency_check() {
            return Err(RazorError::RecoveryRequired);
        }
        let ts = now_timestamp();
        let tx = self.begin_tx(ts)?;
        match self.tree.rename(&self.strings, &self.wal, tx, ts, old_parent_idx, old_name, new_parent_idx, new_name, caller_uid, caller_gids) {
            Ok(()) => self.commit_tx(tx, ts),
            Err(e) => {
                self.wal.append(tx, ts, Payload::Abort)?;
                Err(e)
            }
        }
    }

    pub fn setattr(&self, idx: u16, update: MetadataUpdate) -> Result<Node> {
        if self.needs_consistency_check() {
            return Err(RazorError::RecoveryRequired);
        }
        let ts = now_timestamp();
        let tx = self.begin_tx(ts)?;
        match self.tree.update_metadata(&self.wal, tx, ts, idx, update) {
            Ok(()) => {
                self.commit_tx(tx, ts)?;
                self.tree.node_snapshot(idx)
            }
            Err(e) => {
                self.wal.append(tx, ts, Payload::Abort)?;
                Err(e)
            }
        }
    }

    pub fn read(&self, idx: u16, offset: u64, length: usize) -> Result<Vec<u8>> {
        let node = self.tree.node_snapshot(idx)?;
        if !node.mode.is_regular() {
            return Err(RazorError::IsDirectory);
        }
        file_data::read_range(&self.config.blob_path(node.inode), offset, length)
    }

    pub fn write(&self, idx: u16, offset: u64, data: &[u8]) -> Result<u64> {
        if self.needs_consistency_check() {
            return Err(RazorError::RecoveryRequired);
        }
        let node = self.tree.node_snapshot(idx)?;
        if !node.mode.is_regular() {
            return Err(RazorError::IsDirectory);
        }
        let ts = now_timestamp();
        let tx = self.begin_tx(ts)?;
        let result = (|| -> Result<u64> {
            let new_len = file_data::write_range(&self.config.blob_path(node.inode), offset, data, node.inode)?;
            self.wal.append(
                tx,
                ts,
                Payload::Write {
                    inode: node.inode,
                    offset,
                    length: data.len() as u32,
                    prior_size: node.size,
                    content_hash: crc32fast::hash(data) as u64,
                },
            )?;
            self.tree.update_metadata(&self.wal, tx, ts, idx, MetadataUpdate { size: Some(new_len), mtime: Some(ts), ..Default::default() })?;
            Ok(new_len)
        })();
        match result {
            Ok(len) => {
                self.commit_tx(tx, ts)?;
                Ok(len)
            }
            Err(e) => {
                self.wal.append(tx, ts, Payload::Abort)?;
                Err(e)
            }
        }
    }

    pub fn truncate(&self, idx: u16, new_len: u64) -> Result<()> {
        if self.needs_consistency_check() {
            return Err(RazorError::RecoveryRequired);
        }
        let node = self.tree.node_snapshot(idx)?;
        if !node.mode.is_regular() {
            return Err(RazorError::IsDirectory);
        }
        let ts = now_timestamp();
        let tx = self.begin_tx(ts)?;
        let result = (|| -> Result<()> {
            file_data::truncate_blob(&self.config.blob_path(node.inode), new_len, node.inode)?;
            self.tree.update_metadata(&self.wal, tx, ts, idx, MetadataUpdate { size: Some(new_len), mtime: Some(ts), ..Default::default() })
        })();
        match result {
            Ok(()) => self.commit_tx(tx, ts),
            Err(e) => {
                self.wal.append(tx, ts, Payload::Abort)?;
                Err(e)
            }
        }
    }

    /// Durability barrier for one inode: flushes the WAL through the
    /// last record touching it, then syncs the blob itself.
    pub fn fsync(&self, idx: u16) -> Result<()> {
        let node = self.tree.node_snapshot(idx)?;
        self.wal.commit_barrier()?;
        if node.mode.is_regular() {
            file_data::fsync_blob(&self.config.blob_path(node.inode))?;
        }
        Ok(())
    }

    pub fn statfs(&self) -> Statfs {
        let nodes = self.tree.snapshot();
        let used_nodes = nodes.iter().filter(|n| !n.is_free()).count() as u64;
        let total_bytes_stored: u64 = nodes.iter().filter(|n| n.mode.is_regular()).map(|n| n.size).sum();
        Statfs {
            total_nodes: nodes.len() as u64,
            used_nodes,
            total_bytes_stored,
            free_node_slots: nodes.len() as u64 - used_nodes,
            name_table_bytes_used: self.strings.used_len() as u64,
        }
    }

    /// Forces a checkpoint once the WAL has grown past the configured
    /// threshold. Cheap no-op otherwise.
    pub fn checkpoint_if_needed(&self) -> Result<()> {
        if self.wal.len_bytes()? < self.config.checkpoint_threshold_bytes {
            return Ok(());
        }
        persistence::flush(&self.config, &self.tree, &self.strings)?;
        let live_inodes: Vec<u32> = self.tree.snapshot().into_iter().filter(|n| !n.is_free()).map(|n| n.inode).collect();
        self.wal.checkpoint(live_inodes, self.tree.next_inode_hint(), now_timestamp())?;
        Ok(())
    }

    /// Clean detach: flush both backing files, mark the WAL clean,
    /// release the mount lock (dropped alongside `self`).
    pub fn unmount(&self) -> Result<()> {
        persistence::flush(&self.config, &self.tree, &self.strings)?;
        self.wal.close()?;
        info!("engine: clean unmount of {}", self.config.storage_dir.display());
        Ok(())
    }

    pub fn root_index(&self) -> u16 {
        ROOT_INDEX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_engine(dir: &std::path::Path) -> Engine {
        let config = Config::default().with_storage_dir(dir);
        Engine::mount(config).unwrap()
    }

    #[test]
    fn create_read_write_delete_round_trip() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let (idx, _inode) = engine
            .create(engine.root_index(), b"greeting.txt", FileKind::Regular, crate::node::R_BIT | crate::node::W_BIT, crate::node::R_BIT, 0, 0, 0, &[])
            .unwrap();
        engine.write(idx, 0, b"hello").unwrap();
        assert_eq!(engine.read(idx, 0, 5).unwrap(), b"hello");
        engine.remove(engine.root_index(), b"greeting.txt", 0, &[]).unwrap();
        assert!(engine.lookup(engine.root_index(), b"greeting.txt").is_err());
    }

    #[test]
    fn a_second_mount_of_the_same_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let _first = test_engine(dir.path());
        let config = Config::default().with_storage_dir(dir.path());
        assert!(Engine::mount(config).is_err());
    }

    #[test]
    fn statfs_reflects_created_files() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine.create(engine.root_index(), b"a", FileKind::Regular, crate::node::R_BIT | crate::node::W_BIT, crate::node::R_BIT, 0, 0, 0, &[]).unwrap();
        let stats = engine.statfs();
        assert_eq!(stats.used_nodes, 2); // root + a
    }

    #[test]
    fn unmount_then_remount_preserves_content() {
        let dir = tempdir().unwrap();
        {
            let engine = test_engine(dir.path());
            let (idx, _) = engine
                .create(engine.root_index(), b"persisted.txt", FileKind::Regular, crate::node::R_BIT | crate::node::W_BIT, crate::node::R_BIT, 0, 0, 0, &[])
                .unwrap();
            engine.write(idx, 0, b"data").unwrap();
            engine.unmount().unwrap();
        }
        let config = Config::default().with_storage_dir(dir.path());
        let engine = Engine::mount(config).unwrap();
        let (idx, _) = engine.lookup(engine.root_index(), b"persisted.txt").unwrap();
        assert_eq!(engine.read(idx, 0, 4).unwrap(), b"data");
        assert!(!engine.needs_consistency_check());
    }

    #[test]
    fn mutating_operations_refuse_to_run_once_recovery_is_required() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let (idx, _) = engine
            .create(engine.root_index(), b"f", FileKind::Regular, crate::node::R_BIT | crate::node::W_BIT, crate::node::R_BIT, 0, 0, 0, &[])
            .unwrap();
        engine.consistency_check_needed.store(true, Ordering::SeqCst);

        assert!(matches!(
            engine.create(engine.root_index(), b"g", FileKind::Regular, crate::node::R_BIT | crate::node::W_BIT, crate::node::R_BIT, 0, 0, 0, &[]),
            Err(RazorError::RecoveryRequired)
        ));
        assert!(matches!(engine.remove(engine.root_index(), b"f", 0, &[]), Err(RazorError::RecoveryRequired)));
        assert!(matches!(engine.rename(engine.root_index(), b"f", engine.root_index(), b"h", 0, &[]), Err(RazorError::RecoveryRequired)));
        assert!(matches!(engine.setattr(idx, MetadataUpdate::default()), Err(RazorError::RecoveryRequired)));
        assert!(matches!(engine.write(idx, 0, b"x"), Err(RazorError::RecoveryRequired)));
        assert!(matches!(engine.truncate(idx, 0), Err(RazorError::RecoveryRequired)));

        // Reads are unaffected: the flag only gates mutation.
        assert!(engine.lookup(engine.root_index(), b"f").is_ok());
    }

    const RW: u8 = crate::node::R_BIT | crate::node::W_BIT;

    #[test]
    fn basic_create_read_write_delete() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let root = engine.root_index();

        let (a_idx, _) = engine.create(root, b"a", FileKind::Directory, crate::node::R_BIT | crate::node::W_BIT | crate::node::X_BIT, crate::node::R_BIT | crate::node::X_BIT, 0, 0, 0, &[]).unwrap();
        let (f_idx, _) = engine.create(a_idx, b"f", FileKind::Regular, RW, crate::node::R_BIT, 0, 0, 0, &[]).unwrap();

        engine.write(f_idx, 0, b"hello").unwrap();
        assert_eq!(engine.read(f_idx, 0, 5).unwrap(), b"hello");

        engine.remove(a_idx, b"f", 0, &[]).unwrap();
        assert!(matches!(engine.lookup(a_idx, b"f"), Err(RazorError::NotFound)));
    }

    #[test]
    fn persistence_round_trip_across_clean_detach() {
        let dir = tempdir().unwrap();
        let (uid, gid) = (42, 7);
        {
            let engine = test_engine(dir.path());
            let root = engine.root_index();
            let (x_idx, _) = engine.create(root, b"x", FileKind::Directory, crate::node::R_BIT | crate::node::W_BIT | crate::node::X_BIT, crate::node::R_BIT | crate::node::X_BIT, uid, gid, 0, &[]).unwrap();
            let (y_idx, _) = engine.create(x_idx, b"y", FileKind::Regular, RW, crate::node::R_BIT, uid, gid, 0, &[]).unwrap();
            engine.write(y_idx, 0, b"abc").unwrap();
            engine.unmount().unwrap();
        }

        let engine = test_engine(dir.path());
        let root = engine.root_index();
        let (x_idx, _) = engine.lookup(root, b"x").unwrap();
        let (y_idx, y_node) = engine.lookup(x_idx, b"y").unwrap();
        assert_eq!(engine.read(y_idx, 0, 3).unwrap(), b"abc");
        assert_eq!(y_node.uid, uid);
        assert_eq!(y_node.gid, gid);
        assert!(!engine.needs_consistency_check());
    }

    #[test]
    fn rename_within_the_same_directory() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let root = engine.root_index();

        let (d_idx, _) = engine.create(root, b"d", FileKind::Directory, crate::node::R_BIT | crate::node::W_BIT | crate::node::X_BIT, crate::node::R_BIT | crate::node::X_BIT, 0, 0, 0, &[]).unwrap();
        engine.create(d_idx, b"a", FileKind::Regular, RW, crate::node::R_BIT, 0, 0, 0, &[]).unwrap();

        engine.rename(d_idx, b"a", d_idx, b"b", 0, &[]).unwrap();

        let listing = engine.readdir(d_idx).unwrap();
        let names: Vec<&[u8]> = listing.iter().map(|(name, _, _)| name.as_slice()).collect();
        assert_eq!(names, vec![b"b".as_slice()]);
        assert!(matches!(engine.lookup(d_idx, b"a"), Err(RazorError::NotFound)));
    }

    #[test]
    fn rename_across_directories_does_not_deadlock() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let root = engine.root_index();

        let (x_idx, _) = engine.create(root, b"x", FileKind::Directory, crate::node::R_BIT | crate::node::W_BIT | crate::node::X_BIT, crate::node::R_BIT | crate::node::X_BIT, 0, 0, 0, &[]).unwrap();
        let (y_idx, _) = engine.create(root, b"y", FileKind::Directory, crate::node::R_BIT | crate::node::W_BIT | crate::node::X_BIT, crate::node::R_BIT | crate::node::X_BIT, 0, 0, 0, &[]).unwrap();
        engine.create(x_idx, b"f", FileKind::Regular, RW, crate::node::R_BIT, 0, 0, 0, &[]).unwrap();

        engine.rename(x_idx, b"f", y_idx, b"f", 0, &[]).unwrap();

        assert!(engine.readdir(x_idx).unwrap().is_empty());
        assert_eq!(engine.readdir(y_idx).unwrap().len(), 1);
        assert!(engine.lookup(y_idx, b"f").is_ok());

        // rename(a→b); rename(b→a) returns to the starting state (modulo mtime).
        engine.rename(y_idx, b"f", x_idx, b"f", 0, &[]).unwrap();
        assert!(engine.readdir(y_idx).unwrap().is_empty());
        assert!(engine.lookup(x_idx, b"f").is_ok());
    }

    #[test]
    fn compression_round_trip_survives_a_detach_and_reattach() {
        let dir = tempdir().unwrap();
        let payload = vec![b'a'; 4096];

        let inode;
        {
            let engine = test_engine(dir.path());
            let root = engine.root_index();
            let (f_idx, node_inode) = engine.create(root, b"big.txt", FileKind::Regular, RW, crate::node::R_BIT, 0, 0, 0, &[]).unwrap();
            inode = node_inode;
            engine.write(f_idx, 0, &payload).unwrap();
            engine.unmount().unwrap();
        }

        let blob_path = Config::default().with_storage_dir(dir.path()).blob_path(inode);
        let on_disk_len = std::fs::metadata(&blob_path).unwrap().len();
        assert!(on_disk_len < payload.len() as u64 + 64, "highly compressible content should not be stored raw");

        let engine = test_engine(dir.path());
        let root = engine.root_index();
        let (f_idx, _) = engine.lookup(root, b"big.txt").unwrap();
        assert_eq!(engine.read(f_idx, 0, payload.len()).unwrap(), payload);
    }

    #[test]
    fn setattr_updates_survive_through_the_engine_facade() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let root = engine.root_index();
        let (f_idx, _) = engine.create(root, b"f", FileKind::Regular, RW, crate::node::R_BIT, 0, 0, 0, &[]).unwrap();

        let updated = engine.setattr(f_idx, MetadataUpdate { uid: Some(99), gid: Some(100), ..Default::default() }).unwrap();
        assert_eq!(updated.uid, 99);
        assert_eq!(updated.gid, 100);
    }
}
