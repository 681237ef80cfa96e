//! Feed registry
//!
//! Maps camera ids to their supervisors. Command handlers mutate it; the
//! sweeps only take snapshots. The lock is never held across an await.

use crate::feed::{FeedSnapshot, FeedSupervisor, SupervisorDeps};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Feed {0} already exists")]
    AlreadyExists(String),

    #[error("Feed {0} not found")]
    NotFound(String),
}

/// Live feeds keyed by camera id
pub struct FeedRegistry {
    feeds: RwLock<HashMap<String, FeedSupervisor>>,
    deps: SupervisorDeps,
}

impl FeedRegistry {
    pub fn new(deps: SupervisorDeps) -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            deps,
        }
    }

    /// Create and register a supervisor, refusing duplicates.
    pub fn create(&self, id: &str, path: &str) -> Result<FeedSupervisor, RegistryError> {
        let mut feeds = self.feeds.write();
        if feeds.contains_key(id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }
        let supervisor = FeedSupervisor::spawn(id, path, self.deps.clone());
        feeds.insert(id.to_string(), supervisor.clone());
        tracing::info!(feed = %id, path = %path, "Feed registered");
        Ok(supervisor)
    }

    pub fn get(&self, id: &str) -> Result<FeedSupervisor, RegistryError> {
        self.feeds
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Drop a feed from the map; its task exits once the last handle is gone.
    pub fn remove(&self, id: &str) -> Option<FeedSupervisor> {
        let removed = self.feeds.write().remove(id);
        if removed.is_some() {
            tracing::info!(feed = %id, "Feed unregistered");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.feeds.read().contains_key(id)
    }

    /// Registered camera ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.feeds.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn supervisors(&self) -> Vec<FeedSupervisor> {
        self.feeds.read().values().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<FeedSnapshot> {
        self.supervisors()
            .iter()
            .map(FeedSupervisor::snapshot)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.feeds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.read().is_empty()
    }
}
