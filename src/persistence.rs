//! `nodes.dat` / `strings.dat` lifecycle: init-or-attach, flush, detach.
//!
//! Both files are memory-mapped: a small magic/version header up
//! front, then the flat payload (the `Node` array, or the string
//! arena) mapped directly rather than read through buffered I/O.

use std::fs::{File, OpenOptions};
use std::path::Path;

use log::{debug, info};
use memmap2::{Mmap, MmapMut};

use crate::config::Config;
use crate::error::{RazorError, Result};
use crate::node::Node;
use crate::string_table::StringTable;
use crate::tree::Tree;

const NODES_MAGIC: u32 = 0x52465A4E; // "RFZN"
const NODES_VERSION: u32 = 1;
const NODES_HEADER_LEN: usize = 4 + 4 + 4 + 4; // magic, version, count, next_inode

const STRINGS_MAGIC: u32 = 0x52465A53; // "RFZS"
const STRINGS_VERSION: u32 = 1;
const STRINGS_HEADER_LEN: usize = 4 + 4 + 8; // magic, version, used_len

/// Result of attaching to a storage directory: either a brand new
/// empty namespace, or one rebuilt from disk.
pub struct Attached {
    pub tree: Tree,
    pub strings: StringTable,
    pub fresh: bool,
}

pub fn attach(config: &Config, root_uid: u32, root_gid: u32, root_mode: crate::node::Mode) -> Result<Attached> {
    std::fs::create_dir_all(&config.storage_dir)?;
    let nodes_path = config.nodes_path();
    let strings_path = config.strings_path();

    if !nodes_path.exists() || !strings_path.exists() {
        info!("persistence: no existing store at {}, initializing fresh", config.storage_dir.display());
        let tree = Tree::new(root_uid, root_gid, root_mode);
        let strings = StringTable::new();
        flush(config, &tree, &strings)?;
        return Ok(Attached { tree, strings, fresh: true });
    }

    let nodes_raw = read_nodes(&nodes_path)?;
    let strings_raw = read_strings(&strings_path)?;
    let next_inode = nodes_raw.1;
    let tree = Tree::from_raw(nodes_raw.0, next_inode);
    let strings = StringTable::from_raw(strings_raw);
    info!("persistence: attached existing store at {}", config.storage_dir.display());
    Ok(Attached { tree, strings, fresh: false })
}

fn read_nodes(path: &Path) -> Result<(Vec<Node>, u32)> {
    let file = File::open(path)?;
    // SAFETY: the file is exclusively ours for the duration of the
    // mapping (held behind the mount lock); nothing else truncates or
    // writes to it while this map is alive.
    let mmap = unsafe { Mmap::map(&file)? };
    if mmap.len() < NODES_HEADER_LEN {
        return Err(RazorError::Corruption("nodes.dat shorter than its header".into()));
    }
    let header = &mmap[..NODES_HEADER_LEN];
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if magic != NODES_MAGIC {
        return Err(RazorError::Corruption("bad nodes.dat magic".into()));
    }
    if version != NODES_VERSION {
        return Err(RazorError::Corruption(format!("unsupported nodes.dat version {version}")));
    }
    let count = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let next_inode = u32::from_le_bytes(header[12..16].try_into().unwrap());

    let body = &mmap[NODES_HEADER_LEN..];
    let expected_len = count * std::mem::size_of::<Node>();
    if body.len() != expected_len {
        return Err(RazorError::Corruption(format!(
            "nodes.dat body length {} does not match header count {count}",
            body.len()
        )));
    }
    let mut nodes = Vec::with_capacity(count);
    for chunk in body.chunks_exact(std::mem::size_of::<Node>()) {
        // SAFETY: `Node` is `#[repr(C, align(64))]` with only integer
        // and `Mode(u8)` fields, so any 64-byte pattern of the right
        // length is a valid bit pattern for it.
        let node: Node = unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const Node) };
        nodes.push(node);
    }
    Ok((nodes, next_inode))
}

fn read_strings(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    // SAFETY: same as `read_nodes` above.
    let mmap = unsafe { Mmap::map(&file)? };
    if mmap.len() < STRINGS_HEADER_LEN {
        return Err(RazorError::Corruption("strings.dat shorter than its header".into()));
    }
    let header = &mmap[..STRINGS_HEADER_LEN];
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if magic != STRINGS_MAGIC {
        return Err(RazorError::Corruption("bad strings.dat magic".into()));
    }
    if version != STRINGS_VERSION {
        return Err(RazorError::Corruption(format!("unsupported strings.dat version {version}")));
    }
    let used_len = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;
    let body = &mmap[STRINGS_HEADER_LEN..];
    if body.len() < used_len {
        return Err(RazorError::Corruption("strings.dat shorter than recorded used length".into()));
    }
    Ok(body[..used_len].to_vec())
}

/// Writes both backing files in full (used at checkpoint time and at
/// clean detach), through a fresh memory mapping each time rather than
/// buffered writes. Each node record lands at its natural 64-byte
/// alignment by construction of the flat `Vec<Node>` layout.
pub fn flush(config: &Config, tree: &Tree, strings: &StringTable) -> Result<()> {
    std::fs::create_dir_all(&config.storage_dir)?;
    let nodes = tree.snapshot();
    let next_inode = tree.next_inode_hint();

    let node_size = std::mem::size_of::<Node>();
    let nodes_total_len = NODES_HEADER_LEN + nodes.len() * node_size;
    let nodes_file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(config.nodes_path())?;
    nodes_file.set_len(nodes_total_len as u64)?;
    {
        // SAFETY: we just created/truncated this file to `nodes_total_len`
        // and hold the only handle to it.
        let mut mmap = unsafe { MmapMut::map_mut(&nodes_file)? };
        mmap[0..4].copy_from_slice(&NODES_MAGIC.to_le_bytes());
        mmap[4..8].copy_from_slice(&NODES_VERSION.to_le_bytes());
        mmap[8..12].copy_from_slice(&(nodes.len() as u32).to_le_bytes());
        mmap[12..16].copy_from_slice(&next_inode.to_le_bytes());
        for (i, node) in nodes.iter().enumerate() {
            // SAFETY: reading a `#[repr(C)]`, `Copy` struct's own bytes
            // for the length of its own size is always sound.
            let bytes = unsafe { std::slice::from_raw_parts(node as *const Node as *const u8, node_size) };
            let start = NODES_HEADER_LEN + i * node_size;
            mmap[start..start + node_size].copy_from_slice(bytes);
        }
        mmap.flush()?;
    }

    let snapshot = strings.snapshot();
    let strings_total_len = STRINGS_HEADER_LEN + snapshot.len();
    let strings_file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(config.strings_path())?;
    strings_file.set_len(strings_total_len as u64)?;
    {
        // SAFETY: same as the nodes.dat mapping above.
        let mut mmap = unsafe { MmapMut::map_mut(&strings_file)? };
        mmap[0..4].copy_from_slice(&STRINGS_MAGIC.to_le_bytes());
        mmap[4..8].copy_from_slice(&STRINGS_VERSION.to_le_bytes());
        mmap[8..16].copy_from_slice(&(snapshot.len() as u64).to_le_bytes());
        mmap[STRINGS_HEADER_LEN..].copy_from_slice(&snapshot);
        mmap.flush()?;
    }

    debug!("persistence: flushed {} nodes, {} string bytes", nodes.len(), snapshot.len());
    Ok(())
}
