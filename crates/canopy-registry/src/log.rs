//! Session log - one entry per node process, observability only

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use canopy_core::{CanopyError, CanopyResult, OwnerId, SessionId};

/// Random per-process log identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub u64);

impl LogId {
    pub fn generate() -> Self {
        LogId(rand::thread_rng().gen())
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Log({:016x})", self.0)
    }
}

/// Session log document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub id: LogId,
    /// Process kind, `"child"` for relay nodes
    pub kind: String,
    pub owner: OwnerId,
    pub session: SessionId,
    pub start: SystemTime,
    pub end: Option<SystemTime>,
}

impl SessionLogEntry {
    pub fn child(id: LogId, owner: OwnerId, session: SessionId, start: SystemTime) -> Self {
        SessionLogEntry {
            id,
            kind: String::from("child"),
            owner,
            session,
            start,
            end: None,
        }
    }
}

/// Append-only log; the single permitted update stamps the end time
pub trait SessionLog: Send + Sync {
    fn open(&self, entry: SessionLogEntry) -> CanopyResult<()>;

    fn close(&self, id: LogId, end: SystemTime) -> CanopyResult<()>;
}

/// In-memory session log
#[derive(Debug, Default)]
pub struct MemorySessionLog {
    entries: Mutex<HashMap<LogId, SessionLogEntry>>,
}

impl MemorySessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: LogId) -> Option<SessionLogEntry> {
        self.entries.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SessionLog for MemorySessionLog {
    fn open(&self, entry: SessionLogEntry) -> CanopyResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&entry.id) {
            return Err(CanopyError::TransientStoreFailure(format!(
                "duplicate log id {:?}",
                entry.id
            )));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    fn close(&self, id: LogId, end: SystemTime) -> CanopyResult<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.end = Some(end);
                Ok(())
            }
            None => Err(CanopyError::TransientStoreFailure(format!(
                "unknown log id {:?}",
                id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_open_then_close() {
        let log = MemorySessionLog::new();
        let id = LogId::generate();
        let start = SystemTime::UNIX_EPOCH;
        log.open(SessionLogEntry::child(id, OwnerId::new(1), SessionId::new(2), start))
            .unwrap();
        assert_eq!(log.get(id).unwrap().end, None);

        let end = start + Duration::from_secs(30);
        log.close(id, end).unwrap();
        assert_eq!(log.get(id).unwrap().end, Some(end));
    }

    #[test]
    fn test_append_only() {
        let log = MemorySessionLog::new();
        let id = LogId::generate();
        let entry = SessionLogEntry::child(id, OwnerId::new(1), SessionId::new(2), SystemTime::UNIX_EPOCH);
        log.open(entry.clone()).unwrap();
        assert!(log.open(entry).is_err());
        assert!(log.close(LogId(id.0 ^ 1), SystemTime::UNIX_EPOCH).is_err());
        assert_eq!(log.len(), 1);
    }
}
