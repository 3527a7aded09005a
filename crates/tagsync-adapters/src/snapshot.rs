use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tagsync_core::{MemberId, MemberRecord};
use tokio::sync::RwLock;

use crate::{DirectoryClient, DirectoryError};

/// Directory served from memory, optionally seeded from a contacts JSON file.
///
/// Backs offline `sync --snapshot` runs and stands in for the live directory in tests.
/// The filter expression is ignored and every record is returned.
#[derive(Debug, Default)]
pub struct SnapshotDirectory {
    records: RwLock<BTreeMap<MemberId, MemberRecord>>,
    unavailable: AtomicBool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Wrapped {
        #[serde(rename = "Contacts")]
        contacts: Vec<MemberRecord>,
    },
    Bare(Vec<MemberRecord>),
}

impl SnapshotDirectory {
    pub fn new(records: impl IntoIterator<Item = MemberRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id, r)).collect()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Accepts either `{"Contacts": [...]}` or a bare array of contacts.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let parsed: SnapshotFile =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        let records = match parsed {
            SnapshotFile::Wrapped { contacts } => contacts,
            SnapshotFile::Bare(contacts) => contacts,
        };
        Ok(Self::new(records))
    }

    pub async fn replace(&self, records: impl IntoIterator<Item = MemberRecord>) {
        *self.records.write().await = records.into_iter().map(|r| (r.id, r)).collect();
    }

    pub async fn upsert(&self, record: MemberRecord) {
        self.records.write().await.insert(record.id, record);
    }

    pub async fn remove(&self, member_id: MemberId) -> Option<MemberRecord> {
        self.records.write().await.remove(&member_id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Simulate an upstream outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("snapshot directory marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryClient for SnapshotDirectory {
    async fn list_active_members(&self, _filter: &str) -> Result<Vec<MemberRecord>, DirectoryError> {
        self.check_available()?;
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get_member(&self, member_id: MemberId) -> Result<Option<MemberRecord>, DirectoryError> {
        self.check_available()?;
        Ok(self.records.read().await.get(&member_id).cloned())
    }
}
