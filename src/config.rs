//! All tunables gathered in one place so the CLI (`main.rs`) and the
//! engine agree on defaults.

use std::path::{Path, PathBuf};

use log::warn;

/// Children per directory node. Fixed, not dynamic.
pub const BRANCHING: usize = 16;

/// Below this child count a linear scan beats binary search because
/// the whole children array fits in one cache line.
pub const LINEAR_THRESHOLD: usize = 8;

/// Maximum bytes in an interned name.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `nodes.dat`, `strings.dat`, `file_<inode>` and `wal.log`.
    pub storage_dir: PathBuf,
    /// Whether `storage_dir` was chosen from a fallback location.
    pub using_fallback: bool,
    /// Compression kicks in only once logical size reaches this.
    pub compression_min_size: usize,
    /// Stored size must be <= ratio * logical size to keep the compressed copy.
    pub compression_ratio: f32,
    /// Commits within this window share one durability barrier.
    pub group_commit_window_ms: u64,
    /// A checkpoint is forced once the WAL exceeds this size.
    pub checkpoint_threshold_bytes: u64,
    /// If true, a scratch (tmpfs-like) storage directory is tolerated with a warning.
    pub fallback_allowed: bool,
}

impl Default for Config {
    fn default() -> Self {
        let (storage_dir, using_fallback) = Self::default_storage_dir(true);
        Config {
            storage_dir,
            using_fallback,
            compression_min_size: 512,
            compression_ratio: 0.9,
            group_commit_window_ms: 1,
            checkpoint_threshold_bytes: 64 * 1024 * 1024,
            fallback_allowed: true,
        }
    }
}

impl Config {
    /// Resolves the OS persistent app-data directory, falling back to
    /// `/tmp/razorfs` when it is unavailable (or unconditionally, if
    /// the caller already knows it wants the scratch path).
    pub fn default_storage_dir(fallback_allowed: bool) -> (PathBuf, bool) {
        if let Some(data_dir) = dirs::data_dir() {
            return (data_dir.join("razorfs"), false);
        }
        if fallback_allowed {
            warn!("no OS persistent app-data directory found; falling back to a scratch filesystem location, data will not survive a reboot");
            (std::env::temp_dir().join("razorfs"), true)
        } else {
            (PathBuf::from("./razorfs-data"), false)
        }
    }

    pub fn with_storage_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.storage_dir = dir.as_ref().to_path_buf();
        self.using_fallback = false;
        self
    }

    pub fn nodes_path(&self) -> PathBuf {
        self.storage_dir.join("nodes.dat")
    }

    pub fn strings_path(&self) -> PathBuf {
        self.storage_dir.join("strings.dat")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.storage_dir.join("wal.log")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.storage_dir.join(".razorfs.lock")
    }

    pub fn blob_path(&self, inode: u32) -> PathBuf {
        self.storage_dir.join(format!("file_{inode}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_nested_under_storage_dir() {
        let cfg = Config::default().with_storage_dir("/tmp/example-razorfs");
        assert_eq!(cfg.nodes_path(), Path::new("/tmp/example-razorfs/nodes.dat"));
        assert_eq!(cfg.wal_path(), Path::new("/tmp/example-razorfs/wal.log"));
        assert_eq!(cfg.blob_path(7), Path::new("/tmp/example-razorfs/file_7"));
    }
}
