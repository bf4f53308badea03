//! The on-disk directory layout of one tablet.
//!
//! A tablet's directory contains `regular/` (the committed
//! store's files), `intents/` (the intent store's files), `wal/` (the
//! consensus log, out of scope — owned and written by the external
//! consensus implementation, never by this crate), and `metadata.pb` (see
//! [`crate::metadata::TabletMetadata`]). This module only computes paths;
//! it does not create or open files — the pluggable KV store contract
//! (`tablet_storage::KvStore`) owns actual directory and file creation for
//! `regular/` and `intents/`.

use std::path::{Path, PathBuf};

/// Resolves the well-known subpaths inside one tablet's root directory.
#[derive(Debug, Clone)]
pub struct TabletLayout {
    root: PathBuf,
}

impl TabletLayout {
    /// Anchor a layout at `root`, the tablet's own directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TabletLayout { root: root.into() }
    }

    /// The tablet's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The committed store's directory.
    pub fn regular_dir(&self) -> PathBuf {
        self.root.join("regular")
    }

    /// The intent store's directory.
    pub fn intents_dir(&self) -> PathBuf {
        self.root.join("intents")
    }

    /// The consensus log's directory (not written by this crate).
    pub fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    /// The tablet metadata file's path.
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.pb")
    }
}
