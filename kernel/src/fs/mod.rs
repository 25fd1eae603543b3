//! Filesystem layer.

pub mod kfs;

pub use kfs::{fs_mount, fs_open};
