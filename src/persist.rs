//! Durable record of the latest committed view
//!
//! The journal keeps a single JSON document with the newest snapshot. On
//! restart the node seeds its store from it and rejoins the agreement
//! protocol at the recorded view instead of view zero.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConveneResult;
use crate::view::ClusterView;

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    view_id: u64,
    members: Vec<crate::types::NodeId>,
}

/// File-backed journal for the latest committed view
#[derive(Debug, Clone)]
pub struct ViewJournal {
    path: PathBuf,
}

impl ViewJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted view, if any. A missing file is a fresh start;
    /// an unreadable file is treated the same after a warning, since the
    /// protocol recovers via resync anyway.
    pub fn load(&self) -> ConveneResult<Option<ClusterView>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str::<JournalEntry>(&raw) {
            Ok(entry) => {
                debug!(view_id = entry.view_id, path = %self.path.display(), "loaded persisted view");
                Ok(Some(ClusterView::new(entry.view_id, entry.members)))
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "discarding corrupt view journal");
                Ok(None)
            }
        }
    }

    /// Persist a committed view, replacing whatever came before it. The
    /// write goes through a temporary file so a crash mid-write leaves
    /// the previous entry intact.
    pub fn save(&self, view: &ClusterView) -> ConveneResult<()> {
        let entry = JournalEntry {
            view_id: view.view_id(),
            members: view.members().to_vec(),
        };
        let raw = serde_json::to_string_pretty(&entry)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        debug!(view_id = view.view_id(), path = %self.path.display(), "persisted view");
        Ok(())
    }
}
