//! In-memory registry
//!
//! Reference backend for the registry contract. Each operation takes the
//! store lock once, which gives the per-document atomicity the contract
//! requires. The availability switch simulates a store outage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use canopy_core::{CanopyError, CanopyResult, Depth, OwnerId, PeerId};

use crate::{ChildSummary, Registry, RegistryEntry};

/// Shared in-memory document store
#[derive(Debug)]
pub struct MemoryRegistry {
    documents: Mutex<BTreeMap<PeerId, RegistryEntry>>,
    available: AtomicBool,
    operations: AtomicU64,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry {
            documents: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            operations: AtomicU64::new(0),
        }
    }

    /// Simulate the store going away or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of operations that reached the store
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Copy of every document, ordered by peer
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.documents.lock().values().cloned().collect()
    }

    /// Parents currently listing this peer as a child
    pub fn parents_of(&self, peer: PeerId) -> Vec<PeerId> {
        self.documents
            .lock()
            .values()
            .filter(|doc| doc.lists_child(peer))
            .map(|doc| doc.peer)
            .collect()
    }

    fn guard(&self, op: &'static str) -> CanopyResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            tracing::debug!(op, "Registry operation refused, store unavailable");
            return Err(CanopyError::TransientStoreFailure(format!(
                "{}: store unavailable",
                op
            )));
        }
        self.operations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Registry for MemoryRegistry {
    fn register(&self, entry: RegistryEntry) -> CanopyResult<()> {
        self.guard("register")?;
        let mut docs = self.documents.lock();
        match docs.get_mut(&entry.peer) {
            Some(existing) => {
                existing.owner = entry.owner;
                existing.depth = entry.depth;
            }
            None => {
                docs.insert(entry.peer, entry);
            }
        }
        Ok(())
    }

    fn release_self(&self, peer: PeerId) -> CanopyResult<()> {
        self.guard("release_self")?;
        let mut docs = self.documents.lock();
        for doc in docs.values_mut() {
            doc.children.retain(|c| c.peer != peer);
        }
        Ok(())
    }

    fn attach_as_child(
        &self,
        parent: PeerId,
        peer: PeerId,
        depth: Depth,
        timestamp: SystemTime,
    ) -> CanopyResult<()> {
        self.guard("attach_as_child")?;
        let mut docs = self.documents.lock();
        if let Some(doc) = docs.get_mut(&parent) {
            doc.children.push(ChildSummary {
                peer,
                depth: Some(depth),
                timestamp,
            });
        }
        Ok(())
    }

    fn find_open_slot(
        &self,
        owner: OwnerId,
        capacity: usize,
        exclude: PeerId,
    ) -> CanopyResult<Option<RegistryEntry>> {
        self.guard("find_open_slot")?;
        let docs = self.documents.lock();
        let slot = docs
            .values()
            .filter(|doc| doc.owner == Some(owner))
            .filter(|doc| doc.peer != exclude)
            .filter(|doc| doc.depth.is_some_and(Depth::is_relay))
            .filter(|doc| doc.has_room(capacity))
            .min_by_key(|doc| (doc.depth, doc.peer))
            .cloned();
        Ok(slot)
    }

    fn reparent_self(&self, peer: PeerId, depth: Depth) -> CanopyResult<()> {
        self.guard("reparent_self")?;
        let mut docs = self.documents.lock();
        if let Some(doc) = docs.get_mut(&peer) {
            doc.children.retain(|c| c.depth.is_some());
            doc.depth = Some(depth);
        }
        Ok(())
    }

    fn propagate_depth_to_self_entries(&self, peer: PeerId, depth: Depth) -> CanopyResult<()> {
        self.guard("propagate_depth")?;
        let mut docs = self.documents.lock();
        for doc in docs.values_mut() {
            for child in doc.children.iter_mut().filter(|c| c.peer == peer) {
                child.depth = Some(depth);
            }
        }
        Ok(())
    }

    fn reclaim_empty_owners(&self, owner: OwnerId) -> CanopyResult<()> {
        self.guard("reclaim_empty_owners")?;
        let mut docs = self.documents.lock();
        for doc in docs.values_mut() {
            if doc.owner == Some(owner) && doc.children.is_empty() {
                doc.owner = None;
            }
        }
        Ok(())
    }

    fn entry(&self, peer: PeerId) -> CanopyResult<Option<RegistryEntry>> {
        self.guard("entry")?;
        Ok(self.documents.lock().get(&peer).cloned())
    }
}
