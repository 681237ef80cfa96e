//! Local mount path reservations
//!
//! Guarantees that two feeds never publish to the same RTSP mount.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MountError {
    #[error("Mount path {0} is already in use")]
    InUse(String),
}

/// Registry of local mount paths currently claimed by feeds
pub trait MountRegistry: Send + Sync {
    fn reserve(&self, path: &str) -> Result<(), MountError>;

    /// Release a path; releasing an unknown path is a no-op
    fn release(&self, path: &str);

    fn contains(&self, path: &str) -> bool;

    fn paths(&self) -> Vec<String>;
}

/// In-memory [`MountRegistry`]
#[derive(Debug, Default)]
pub struct MountTable {
    reserved: Mutex<BTreeSet<String>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MountRegistry for MountTable {
    fn reserve(&self, path: &str) -> Result<(), MountError> {
        if self.reserved.lock().insert(path.to_string()) {
            tracing::debug!("Reserved mount {}", path);
            Ok(())
        } else {
            Err(MountError::InUse(path.to_string()))
        }
    }

    fn release(&self, path: &str) {
        if self.reserved.lock().remove(path) {
            tracing::debug!("Released mount {}", path);
        }
    }

    fn contains(&self, path: &str) -> bool {
        self.reserved.lock().contains(path)
    }

    fn paths(&self) -> Vec<String> {
        self.reserved.lock().iter().cloned().collect()
    }
}

/// Normalise a configured mount path, or derive one from the camera id
/// (`/` + last id segment) when none is configured.
pub fn resolve_mount_path(camera_id: &str, configured: Option<&str>) -> String {
    let raw = match configured.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => path.to_string(),
        None => camera_id.rsplit('/').next().unwrap_or(camera_id).to_string(),
    };
    if raw.starts_with('/') {
        raw
    } else {
        format!("/{}", raw)
    }
}
