//! In-memory namespace tree over the fixed `Node` array.
//!
//! Structural growth of the node array is guarded by an outer
//! `RwLock`; every other access only needs its *read* side, because
//! the actual mutation of an already-allocated slot goes through that
//! slot's own `RwLock<Node>`. The free-list head and inode counter
//! live behind a short-lived allocator lock that is never held while
//! a node lock is held. Two-node operations always acquire locks in
//! ascending index order.

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::BRANCHING;
use crate::error::{RazorError, Result};
use crate::node::{FileKind, Mode, Node, INVALID_INDEX};
use crate::string_table::StringTable;
use crate::wal::{Payload, Wal, FIELD_GID, FIELD_MODE, FIELD_MTIME, FIELD_SIZE, FIELD_UID};

pub const ROOT_INDEX: u16 = 0;
pub const ROOT_INODE: u32 = 1;

struct Allocator {
    free_head: u16,
    next_inode: u32,
}

pub struct Tree {
    nodes: RwLock<Vec<RwLock<Node>>>,
    allocator: Mutex<Allocator>,
}

/// Field-level update requested by `setattr`/`chmod`/`chown`/`truncate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataUpdate {
    pub size: Option<u64>,
    pub mtime: Option<u32>,
    pub mode: Option<Mode>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl MetadataUpdate {
    fn field_mask(&self) -> u8 {
        let mut mask = 0u8;
        if self.size.is_some() {
            mask |= FIELD_SIZE;
        }
        if self.mtime.is_some() {
            mask |= FIELD_MTIME;
        }
        if self.mode.is_some() {
            mask |= FIELD_MODE;
        }
        if self.uid.is_some() {
            mask |= FIELD_UID;
        }
        if self.gid.is_some() {
            mask |= FIELD_GID;
        }
        mask
    }
}

impl Tree {
    pub fn new(root_uid: u32, root_gid: u32, root_mode: Mode) -> Tree {
        let mut root = Node::default();
        root.inode = ROOT_INODE;
        root.parent = INVALID_INDEX;
        root.uid = root_uid;
        root.gid = root_gid;
        root.mode = root_mode;
        Tree {
            nodes: RwLock::new(vec![RwLock::new(root)]),
            allocator: Mutex::new(Allocator { free_head: INVALID_INDEX, next_inode: ROOT_INODE + 1 }),
        }
    }

    /// Rebuilds from a flat array read off `nodes.dat` at attach time;
    /// free slots are re-threaded into the allocator's free list and
    /// the inode counter resumes above the highest inode seen.
    pub fn from_raw(raw: Vec<Node>, next_inode_hint: u32) -> Tree {
        let max_inode = raw.iter().filter(|n| !n.is_free()).map(|n| n.inode).max().unwrap_or(ROOT_INODE);

        // Re-thread the free list deterministically (ascending order)
        // instead of trusting the pre-crash chain, which may have been
        // left inconsistent by a torn write.
        let mut nodes: Vec<RwLock<Node>> = raw.into_iter().map(RwLock::new).collect();
        let mut head = INVALID_INDEX;
        for idx in (0..nodes.len()).rev() {
            let mut guard = nodes[idx].write();
            if guard.is_free() {
                guard.parent = head;
                head = idx as u16;
            }
        }
        Tree {
            nodes: RwLock::new(nodes),
            allocator: Mutex::new(Allocator { free_head: head, next_inode: next_inode_hint.max(max_inode + 1) }),
        }
    }

    pub fn snapshot(&self) -> Vec<Node> {
        let nodes = self.nodes.read();
        nodes.iter().map(|slot| *slot.read()).collect()
    }

    pub fn next_inode_hint(&self) -> u32 {
        self.allocator.lock().next_inode
    }

    pub fn node_snapshot(&self, idx: u16) -> Result<Node> {
        let nodes = self.nodes.read();
        let slot = nodes.get(idx as usize).ok_or(RazorError::NoSuchInode)?;
        Ok(*slot.read())
    }

    fn name_of(nodes: &RwLockReadGuard<Vec<RwLock<Node>>>, strings: &StringTable, idx: u16) -> Vec<u8> {
        strings.get(nodes[idx as usize].read().name_offset)
    }

    /// Resolves a `/`-separated absolute path to a node index.
    pub fn path_resolve(&self, strings: &StringTable, path: &str) -> Result<u16> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let mut cur = ROOT_INDEX;
        if path.is_empty() {
            return Ok(cur);
        }
        for component in path.split('/') {
            Self::validate_name(component.as_bytes())?;
            cur = self.lookup_child(strings, cur, component.as_bytes())?;
        }
        Ok(cur)
    }

    /// Looks up one child of `parent_idx` by name.
    pub fn lookup_child(&self, strings: &StringTable, parent_idx: u16, name: &[u8]) -> Result<u16> {
        let nodes = self.nodes.read();
        let parent = nodes.get(parent_idx as usize).ok_or(RazorError::NoSuchInode)?.read();
        if !parent.mode.is_directory() {
            return Err(RazorError::NotDirectory);
        }
        match parent.find_child(name, |c| Self::name_of(&nodes, strings, c)) {
            Ok(pos) => Ok(parent.children[pos]),
            Err(_) => Err(RazorError::NotFound),
        }
    }

    pub fn list(&self, strings: &StringTable, dir_idx: u16) -> Result<Vec<(Vec<u8>, u16, Node)>> {
        let nodes = self.nodes.read();
        let dir = nodes.get(dir_idx as usize).ok_or(RazorError::NoSuchInode)?.read();
        if !dir.mode.is_directory() {
            return Err(RazorError::NotDirectory);
        }
        let mut out = Vec::with_capacity(dir.child_count as usize);
        for &c in &dir.children[..dir.child_count as usize] {
            let name = Self::name_of(&nodes, strings, c);
            let node = *nodes[c as usize].read();
            out.push((name, c, node));
        }
        Ok(out)
    }

    /// Rejects anything that cannot be a single path component: empty,
    /// `.`/`..`, or containing `/` or a NUL byte.
    fn validate_name(name: &[u8]) -> Result<()> {
        if name.is_empty() {
            return Err(RazorError::InvalidPath("empty component"));
        }
        if name == b"." || name == b".." {
            return Err(RazorError::InvalidPath("'.' and '..' are not valid entry names"));
        }
        if name.contains(&b'/') {
            return Err(RazorError::InvalidPath("name contains '/'"));
        }
        if name.contains(&0u8) {
            return Err(RazorError::InvalidPath("name contains a NUL byte"));
        }
        Ok(())
    }

    fn check_write_permission(dir: &Node, uid: u32, gids: &[u32]) -> Result<()> {
        if uid == 0 {
            return Ok(());
        }
        let bits = dir.mode.permission_for(dir.uid, dir.gid, uid, gids);
        if bits & crate::node::W_BIT == 0 {
            return Err(RazorError::PermissionDenied);
        }
        Ok(())
    }

    /// Carves a free slot (or grows the array) for a brand-new node.
    /// Returns the new index and its freshly assigned inode number.
    /// Must be called without holding any node lock.
    fn allocate(&self) -> (u16, u32) {
        let mut alloc = self.allocator.lock();
        let inode = alloc.next_inode;
        alloc.next_inode += 1;
        if alloc.free_head != INVALID_INDEX {
            let idx = alloc.free_head;
            let next = self.nodes.read()[idx as usize].read().parent;
            alloc.free_head = next;
            return (idx, inode);
        }
        drop(alloc);
        let mut nodes = self.nodes.write();
        let idx = nodes.len() as u16;
        nodes.push(RwLock::new(Node::default()));
        (idx, inode)
    }

    fn release(&self, idx: u16) {
        let mut alloc = self.allocator.lock();
        let nodes = self.nodes.read();
        let mut slot = nodes[idx as usize].write();
        *slot = Node::free_slot(alloc.free_head);
        alloc.free_head = idx;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        strings: &StringTable,
        wal: &Wal,
        tx_id: u64,
        timestamp: u32,
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
        Self::validate_name(name)?;
        let (new_idx, inode) = self.allocate();
        let result = (|| -> Result<(u16, u32)> {
            let nodes = self.nodes.read();
            // Lock both slots in ascending index order, regardless of
            // whether the freshly allocated slot landed above or below
            // the parent in the array.
            let parent_is_lo = parent_idx <= new_idx;
            let (lo, hi) = if parent_is_lo { (parent_idx, new_idx) } else { (new_idx, parent_idx) };
            let mut lo_guard = nodes[lo as usize].write();
            let mut hi_guard = nodes[hi as usize].write();
            let parent = if parent_is_lo { &mut lo_guard } else { &mut hi_guard };

            if !parent.mode.is_directory() {
                return Err(RazorError::NotDirectory);
            }
            Self::check_write_permission(parent, caller_uid, caller_gids)?;
            if parent.child_count as usize >= BRANCHING {
                return Err(RazorError::OutOfSpace);
            }
            let pos = match parent.find_child(name, |c| Self::name_of(&nodes, strings, c)) {
                Ok(_) => return Err(RazorError::Exists),
                Err(pos) => pos,
            };
            let name_offset = strings.intern(name)?;
            let mode = Mode::new(kind, owner_rwx, shared_rwx);

            wal.append(
                tx_id,
                timestamp,
                Payload::Insert { parent_idx, name_offset, mode: mode.0, uid, gid, new_node_idx: new_idx, assigned_inode: inode },
            )?;

            {
                let new_node = if parent_is_lo { &mut hi_guard } else { &mut lo_guard };
                **new_node = Node::default();
                new_node.inode = inode;
                new_node.name_offset = name_offset;
                new_node.parent = parent_idx;
                new_node.mode = mode;
                new_node.uid = uid;
                new_node.gid = gid;
                new_node.mtime = timestamp;
            }
            let parent = if parent_is_lo { &mut lo_guard } else { &mut hi_guard };
            for i in (pos..parent.child_count as usize).rev() {
                parent.children[i + 1] = parent.children[i];
            }
            parent.children[pos] = new_idx;
            parent.child_count += 1;
            parent.mtime = timestamp;
            Ok((new_idx, inode))
        })();
        if result.is_err() {
            self.release(new_idx);
        }
        result
    }

    pub fn delete(
        &self,
        strings: &StringTable,
        wal: &Wal,
        tx_id: u64,
        timestamp: u32,
        parent_idx: u16,
        name: &[u8],
        caller_uid: u32,
        caller_gids: &[u32],
    ) -> Result<u32> {
        let nodes = self.nodes.read();
        let (lo, hi, parent_is_lo) = {
            let parent_peek = nodes[parent_idx as usize].read();
            if !parent_peek.mode.is_directory() {
                return Err(RazorError::NotDirectory);
            }
            let pos = parent_peek
                .find_child(name, |c| Self::name_of(&nodes, strings, c))
                .map_err(|_| RazorError::NotFound)?;
            let child_idx = parent_peek.children[pos];
            drop(parent_peek);
            if parent_idx <= child_idx {
                (parent_idx, child_idx, true)
            } else {
                (child_idx, parent_idx, false)
            }
        };
        let mut lo_guard = nodes[lo as usize].write();
        let mut hi_guard = nodes[hi as usize].write();
        let (parent, child_idx) = if parent_is_lo {
            (&mut lo_guard, hi)
        } else {
            (&mut hi_guard, lo)
        };
        Self::check_write_permission(parent, caller_uid, caller_gids)?;
        let pos = parent
            .find_child(name, |c| Self::name_of(&nodes, strings, c))
            .map_err(|_| RazorError::NotFound)?;
        let child = if parent_is_lo { &hi_guard } else { &lo_guard };
        if child.mode.is_directory() && child.child_count > 0 {
            return Err(RazorError::NotEmpty);
        }
        let prior_name_offset = child.name_offset;
        let prior_mode = child.mode.0;
        let prior_size = child.size;
        let prior_uid = child.uid;
        let prior_gid = child.gid;
        let prior_mtime = child.mtime;
        let inode = child.inode;

        wal.append(
            tx_id,
            timestamp,
            Payload::Delete {
                parent_idx,
                node_idx: child_idx,
                prior_name_offset,
                prior_mode,
                prior_size,
                prior_inode: inode,
                prior_uid,
                prior_gid,
                prior_mtime,
            },
        )?;

        let parent = if parent_is_lo { &mut lo_guard } else { &mut hi_guard };
        for i in pos..parent.child_count as usize - 1 {
            parent.children[i] = parent.children[i + 1];
        }
        parent.child_count -= 1;
        parent.children[parent.child_count as usize] = INVALID_INDEX;
        parent.mtime = timestamp;
        drop(lo_guard);
        drop(hi_guard);
        drop(nodes);
        self.release(child_idx);
        Ok(inode)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rename(
        &self,
        strings: &StringTable,
        wal: &Wal,
        tx_id: u64,
        timestamp: u32,
        old_parent_idx: u16,
        old_name: &[u8],
        new_parent_idx: u16,
        new_name: &[u8],
        caller_uid: u32,
        caller_gids: &[u32],
    ) -> Result<()> {
        Self::validate_name(new_name)?;
        if old_parent_idx == new_parent_idx && old_name == new_name {
            return Ok(());
        }
        let nodes = self.nodes.read();
        let distinct_parents = old_parent_idx != new_parent_idx;

        // Lock both parent slots in ascending index order, in a single
        // small owned Vec so there is no aliasing and no unsafe code.
        let mut order = [old_parent_idx, new_parent_idx];
        order.sort_unstable();
        order.dedup();
        let mut guards: Vec<parking_lot::RwLockWriteGuard<Node>> = order.iter().map(|&i| nodes[i as usize].write()).collect();
        let old_pos_in_order = order.iter().position(|&i| i == old_parent_idx).unwrap();
        let new_pos_in_order = order.iter().position(|&i| i == new_parent_idx).unwrap();

        if !guards[old_pos_in_order].mode.is_directory() {
            return Err(RazorError::NotDirectory);
        }
        Self::check_write_permission(&guards[old_pos_in_order], caller_uid, caller_gids)?;
        let old_pos = guards[old_pos_in_order]
            .find_child(old_name, |c| Self::name_of(&nodes, strings, c))
            .map_err(|_| RazorError::NotFound)?;
        let moving_idx = guards[old_pos_in_order].children[old_pos];

        if !guards[new_pos_in_order].mode.is_directory() {
            return Err(RazorError::NotDirectory);
        }
        Self::check_write_permission(&guards[new_pos_in_order], caller_uid, caller_gids)?;
        if guards[new_pos_in_order].find_child(new_name, |c| Self::name_of(&nodes, strings, c)).is_ok() {
            return Err(RazorError::Exists);
        }
        if guards[new_pos_in_order].child_count as usize >= BRANCHING {
            return Err(RazorError::OutOfSpace);
        }

        // Reject moving a directory into its own subtree.
        if distinct_parents {
            let mut walk = new_parent_idx;
            loop {
                if walk == moving_idx {
                    return Err(RazorError::InvalidPath("cannot move a directory into its own descendant"));
                }
                let p = nodes[walk as usize].read().parent;
                if p == INVALID_INDEX {
                    break;
                }
                walk = p;
            }
        }

        let old_name_offset_val = nodes[moving_idx as usize].read().name_offset;
        let new_name_offset = strings.intern(new_name)?;

        wal.append(
            tx_id,
            timestamp,
            Payload::Rename {
                old_parent: old_parent_idx,
                new_parent: new_parent_idx,
                old_name_offset: old_name_offset_val,
                new_name_offset,
            },
        )?;

        {
            let old_parent = &mut guards[old_pos_in_order];
            for i in old_pos..old_parent.child_count as usize - 1 {
                old_parent.children[i] = old_parent.children[i + 1];
            }
            old_parent.child_count -= 1;
            old_parent.children[old_parent.child_count as usize] = INVALID_INDEX;
            old_parent.mtime = timestamp;
        }
        // Recomputed after the removal above: when old/new parent are
        // the same node this keeps the insertion point consistent with
        // the just-shrunk children array.
        let insert_pos = match guards[new_pos_in_order].find_child(new_name, |c| Self::name_of(&nodes, strings, c)) {
            Ok(_) => unreachable!("existence already checked above"),
            Err(pos) => pos,
        };
        {
            let new_parent = &mut guards[new_pos_in_order];
            for i in (insert_pos..new_parent.child_count as usize).rev() {
                new_parent.children[i + 1] = new_parent.children[i];
            }
            new_parent.children[insert_pos] = moving_idx;
            new_parent.child_count += 1;
            new_parent.mtime = timestamp;
        }

        drop(guards);

        let mut moving = nodes[moving_idx as usize].write();
        moving.name_offset = new_name_offset;
        moving.parent = new_parent_idx;
        Ok(())
    }

    pub fn update_metadata(&self, wal: &Wal, tx_id: u64, timestamp: u32, node_idx: u16, update: MetadataUpdate) -> Result<()> {
        let nodes = self.nodes.read();
        let mut node = nodes.get(node_idx as usize).ok_or(RazorError::NoSuchInode)?.write();
        if node.is_free() {
            return Err(RazorError::NoSuchInode);
        }
        let prior_size = node.size;
        let prior_mtime = node.mtime;
        let prior_mode = node.mode.0;
        let prior_uid = node.uid;
        let prior_gid = node.gid;

        let new_size = update.size.unwrap_or(node.size);
        let new_mtime = update.mtime.unwrap_or(node.mtime);
        let new_mode = update.mode.map(|m| m.0).unwrap_or(node.mode.0);
        let new_uid = update.uid.unwrap_or(node.uid);
        let new_gid = update.gid.unwrap_or(node.gid);

        wal.append(
            tx_id,
            timestamp,
            Payload::Update {
                node_idx,
                field_mask: update.field_mask(),
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
            },
        )?;

        node.size = new_size;
        node.mtime = new_mtime;
        node.mode = Mode(new_mode);
        node.uid = new_uid;
        node.gid = new_gid;
        Ok(())
    }

    // --- Recovery replay primitives: no permission checks, no WAL
    // emission, idempotent against already-applied state. ---

    pub fn redo_insert(&self, parent_idx: u16, name_offset: u32, mode: u8, uid: u32, gid: u32, new_node_idx: u16, inode: u32) -> Result<()> {
        let nodes = self.nodes.read();
        while nodes.len() <= new_node_idx as usize {
            drop(nodes);
            let mut w = self.nodes.write();
            if w.len() <= new_node_idx as usize {
                w.push(RwLock::new(Node::default()));
            }
            drop(w);
            return self.redo_insert(parent_idx, name_offset, mode, uid, gid, new_node_idx, inode);
        }
        let (lo, hi) = if parent_idx <= new_node_idx { (parent_idx, new_node_idx) } else { (new_node_idx, parent_idx) };
        let mut lo_guard = nodes[lo as usize].write();
        let mut hi_guard = nodes[hi as usize].write();
        let (parent, child) = if parent_idx <= new_node_idx { (&mut lo_guard, &mut hi_guard) } else { (&mut hi_guard, &mut lo_guard) };
        if !child.is_free() && child.inode == inode {
            return Ok(()); // already applied
        }
        child.inode = inode;
        child.name_offset = name_offset;
        child.parent = parent_idx;
        child.mode = Mode(mode);
        child.uid = uid;
        child.gid = gid;
        if parent.child_count < BRANCHING as u8 && !parent.children[..parent.child_count as usize].contains(&new_node_idx) {
            parent.children[parent.child_count as usize] = new_node_idx;
            parent.child_count += 1;
        }
        let mut alloc = self.allocator.lock();
        alloc.next_inode = alloc.next_inode.max(inode + 1);
        Ok(())
    }

    pub fn redo_delete(&self, parent_idx: u16, node_idx: u16) -> Result<()> {
        let nodes = self.nodes.read();
        if node_idx as usize >= nodes.len() {
            return Ok(());
        }
        let (lo, hi) = if parent_idx <= node_idx { (parent_idx, node_idx) } else { (node_idx, parent_idx) };
        let mut lo_guard = nodes[lo as usize].write();
        let mut hi_guard = nodes[hi as usize].write();
        let (parent, child) = if parent_idx <= node_idx { (&mut lo_guard, &mut hi_guard) } else { (&mut hi_guard, &mut lo_guard) };
        if child.is_free() {
            return Ok(()); // already applied
        }
        if let Some(pos) = parent.children[..parent.child_count as usize].iter().position(|&c| c == node_idx) {
            for i in pos..parent.child_count as usize - 1 {
                parent.children[i] = parent.children[i + 1];
            }
            parent.child_count -= 1;
            parent.children[parent.child_count as usize] = INVALID_INDEX;
        }
        drop(lo_guard);
        drop(hi_guard);
        drop(nodes);
        self.release(node_idx);
        Ok(())
    }

    pub fn redo_update(&self, node_idx: u16, field_mask: u8, size: u64, mtime: u32, mode: u8, uid: u32, gid: u32) -> Result<()> {
        let nodes = self.nodes.read();
        let Some(slot) = nodes.get(node_idx as usize) else { return Ok(()) };
        let mut node = slot.write();
        if field_mask & FIELD_SIZE != 0 {
            node.size = size;
        }
        if field_mask & FIELD_MTIME != 0 {
            node.mtime = mtime;
        }
        if field_mask & FIELD_MODE != 0 {
            node.mode = Mode(mode);
        }
        if field_mask & FIELD_UID != 0 {
            node.uid = uid;
        }
        if field_mask & FIELD_GID != 0 {
            node.gid = gid;
        }
        Ok(())
    }

    pub fn redo_rename(&self, old_parent: u16, new_parent: u16, old_name_offset: u32, new_name_offset: u32) -> Result<()> {
        let nodes = self.nodes.read();
        if (old_parent.max(new_parent)) as usize >= nodes.len() {
            return Ok(());
        }
        let moving_idx = {
            let op = nodes[old_parent as usize].read();
            op.children[..op.child_count as usize]
                .iter()
                .find(|&&c| nodes[c as usize].read().name_offset == old_name_offset)
                .copied()
        };
        let Some(moving_idx) = moving_idx else { return Ok(()) }; // already moved
        let mut order = [old_parent, new_parent, moving_idx];
        order.sort_unstable();
        order.dedup();
        let mut guards: Vec<parking_lot::RwLockWriteGuard<Node>> = order.iter().map(|&i| nodes[i as usize].write()).collect();
        let idx_of = |target: u16| order.iter().position(|&i| i == target).unwrap();

        {
            let op = &mut guards[idx_of(old_parent)];
            if let Some(pos) = op.children[..op.child_count as usize].iter().position(|&c| c == moving_idx) {
                for i in pos..op.child_count as usize - 1 {
                    op.children[i] = op.children[i + 1];
                }
                op.child_count -= 1;
                op.children[op.child_count as usize] = INVALID_INDEX;
            }
        }
        {
            let np = &mut guards[idx_of(new_parent)];
            if !np.children[..np.child_count as usize].contains(&moving_idx) && (np.child_count as usize) < BRANCHING {
                np.children[np.child_count as usize] = moving_idx;
                np.child_count += 1;
            }
        }
        {
            let mv = &mut guards[idx_of(moving_idx)];
            mv.name_offset = new_name_offset;
            mv.parent = new_parent;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FileKind, R_BIT, W_BIT, X_BIT};
    use tempfile::tempdir;

    fn test_wal() -> (tempfile::TempDir, Wal) {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal.log"), 1).unwrap();
        (dir, wal)
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        let (idx, inode) = tree
            .insert(&strings, &wal, 1, 0, ROOT_INDEX, b"a.txt", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[])
            .unwrap();
        assert!(inode > ROOT_INODE);
        let found = tree.lookup_child(&strings, ROOT_INDEX, b"a.txt").unwrap();
        assert_eq!(found, idx);
    }

    #[test]
    fn inserting_duplicate_name_fails() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        tree.insert(&strings, &wal, 1, 0, ROOT_INDEX, b"dup", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[]).unwrap();
        let err = tree.insert(&strings, &wal, 1, 0, ROOT_INDEX, b"dup", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[]);
        assert!(matches!(err, Err(RazorError::Exists)));
    }

    #[test]
    fn delete_removes_child_and_frees_slot() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        tree.insert(&strings, &wal, 1, 0, ROOT_INDEX, b"f", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[]).unwrap();
        tree.delete(&strings, &wal, 2, 0, ROOT_INDEX, b"f", 0, &[]).unwrap();
        assert!(matches!(tree.lookup_child(&strings, ROOT_INDEX, b"f"), Err(RazorError::NotFound)));
    }

    #[test]
    fn deleting_nonempty_directory_fails() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        let (dir_idx, _) = tree
            .insert(&strings, &wal, 1, 0, ROOT_INDEX, b"dir", FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT, 0, 0, 0, &[])
            .unwrap();
        tree.insert(&strings, &wal, 2, 0, dir_idx, b"child", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[]).unwrap();
        let err = tree.delete(&strings, &wal, 3, 0, ROOT_INDEX, b"dir", 0, &[]);
        assert!(matches!(err, Err(RazorError::NotEmpty)));
    }

    #[test]
    fn rename_within_same_directory() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        tree.insert(&strings, &wal, 1, 0, ROOT_INDEX, b"old", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[]).unwrap();
        tree.rename(&strings, &wal, 2, 0, ROOT_INDEX, b"old", ROOT_INDEX, b"new", 0, &[]).unwrap();
        assert!(matches!(tree.lookup_child(&strings, ROOT_INDEX, b"old"), Err(RazorError::NotFound)));
        assert!(tree.lookup_child(&strings, ROOT_INDEX, b"new").is_ok());
    }

    #[test]
    fn rename_across_directories_moves_the_node() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        let (a_idx, _) = tree
            .insert(&strings, &wal, 1, 0, ROOT_INDEX, b"a", FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT, 0, 0, 0, &[])
            .unwrap();
        let (b_idx, _) = tree
            .insert(&strings, &wal, 2, 0, ROOT_INDEX, b"b", FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT, 0, 0, 0, &[])
            .unwrap();
        tree.insert(&strings, &wal, 3, 0, a_idx, b"f", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[]).unwrap();
        tree.rename(&strings, &wal, 4, 0, a_idx, b"f", b_idx, b"f", 0, &[]).unwrap();
        assert!(matches!(tree.lookup_child(&strings, a_idx, b"f"), Err(RazorError::NotFound)));
        assert!(tree.lookup_child(&strings, b_idx, b"f").is_ok());
    }

    #[test]
    fn rename_rejects_moving_directory_into_its_own_child() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        let (a_idx, _) = tree
            .insert(&strings, &wal, 1, 0, ROOT_INDEX, b"a", FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT, 0, 0, 0, &[])
            .unwrap();
        let (b_idx, _) = tree
            .insert(&strings, &wal, 2, 0, a_idx, b"b", FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT, 0, 0, 0, &[])
            .unwrap();
        let err = tree.rename(&strings, &wal, 3, 0, ROOT_INDEX, b"a", b_idx, b"a", 0, &[]);
        assert!(matches!(err, Err(RazorError::InvalidPath(_))));
    }

    #[test]
    fn path_resolve_walks_nested_components() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        let (a_idx, _) = tree
            .insert(&strings, &wal, 1, 0, ROOT_INDEX, b"a", FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT, 0, 0, 0, &[])
            .unwrap();
        let (_b_idx, _) = tree
            .insert(&strings, &wal, 2, 0, a_idx, b"b", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[])
            .unwrap();
        let resolved = tree.path_resolve(&strings, "/a/b").unwrap();
        let node = tree.node_snapshot(resolved).unwrap();
        assert!(node.mode.is_regular());
    }

    #[test]
    fn update_metadata_applies_only_requested_fields() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        let (idx, _) = tree
            .insert(&strings, &wal, 1, 0, ROOT_INDEX, b"f", FileKind::Regular, R_BIT | W_BIT, R_BIT, 0, 0, 0, &[])
            .unwrap();
        tree.update_metadata(&wal, 2, 0, idx, MetadataUpdate { size: Some(42), ..Default::default() }).unwrap();
        let node = tree.node_snapshot(idx).unwrap();
        assert_eq!(node.size, 42);
        assert_eq!(node.uid, 0);
    }

    #[test]
    fn non_owner_without_write_bit_is_denied() {
        let tree = Tree::new(0, 0, Mode::new(FileKind::Directory, R_BIT | W_BIT | X_BIT, R_BIT | X_BIT));
        let strings = StringTable::new();
        let (_d, wal) = test_wal();
        let err = tree.insert(&strings, &wal, 1, 0, ROOT_INDEX, b"f", FileKind::Regular, R_BIT | W_BIT, R_BIT, 1000, 1000, 1000, &[]);
        assert!(matches!(err, Err(RazorError::PermissionDenied)));
    }
}
