pub mod config;
pub mod engine;
pub mod error;
pub mod file_data;
pub mod fuse_adapter;
pub mod node;
pub mod persistence;
pub mod recovery;
pub mod string_table;
pub mod tree;
pub mod wal;

pub use config::Config;
pub use engine::Engine;
pub use error::{RazorError, Result};
pub use fuse_adapter::RazorFuse;
