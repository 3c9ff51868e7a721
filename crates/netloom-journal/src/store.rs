//! Journal storage: trait + file-backed implementation.
//!
//! Records are stored as JSON files organized by date and record ID.
//! The directory can be put under version control for an append-only trail.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use netloom_core::{JobStatus, TenantId};
use uuid::Uuid;

use crate::{JobRecord, RecordId};

/// Errors that can occur during journal operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Journal record not found: {0}")]
    NotFound(RecordId),

    #[error("Integrity check failed for record {0}: stored hash does not match content")]
    IntegrityViolation(RecordId),

    #[error("Journal record has no content hash (not finalized)")]
    NotFinalized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Query parameters for listing records.
#[derive(Debug, Default)]
pub struct JournalQuery {
    pub tenant_id: Option<TenantId>,
    pub job_id: Option<Uuid>,
    pub config_id: Option<String>,
    pub status: Option<JobStatus>,
    /// Only include records started at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only include records started at or before this time.
    pub to: Option<DateTime<Utc>>,
}

/// Trait for journal persistence backends.
pub trait JournalStore: Send + Sync {
    /// Store a finalized record. Returns an error if it has no content hash.
    fn save(&self, record: &JobRecord) -> Result<(), JournalError>;

    /// Retrieve a record by ID, verifying integrity.
    fn get(&self, id: RecordId) -> Result<JobRecord, JournalError>;

    /// List records matching the query, newest first.
    fn list(&self, query: &JournalQuery) -> Result<Vec<JobRecord>, JournalError>;
}

/// File-system backed journal.
///
/// ```text
/// {root}/
///   2026/
///     10/
///       16/
///         {record_id}.json
/// ```
pub struct FileJournal {
    root: PathBuf,
}

impl FileJournal {
    /// Create a journal rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, record: &JobRecord) -> PathBuf {
        let date = record.started_at.format("%Y/%m/%d");
        self.root.join(format!("{}/{}.json", date, record.id.0))
    }

    fn find_path(&self, id: RecordId) -> Result<PathBuf, JournalError> {
        let filename = format!("{}.json", id.0);
        find_file_recursive(&self.root, &filename).ok_or(JournalError::NotFound(id))
    }
}

impl JournalStore for FileJournal {
    fn save(&self, record: &JobRecord) -> Result<(), JournalError> {
        if record.content_hash.is_none() {
            return Err(JournalError::NotFinalized);
        }

        let path = self.record_path(record);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)?;

        tracing::debug!(
            record_id = %record.id,
            job_id = %record.job_id,
            path = %path.display(),
            "Job record saved"
        );

        Ok(())
    }

    fn get(&self, id: RecordId) -> Result<JobRecord, JournalError> {
        let path = self.find_path(id)?;
        let json = fs::read_to_string(&path)?;
        let record: JobRecord = serde_json::from_str(&json)?;

        if !record.verify_integrity() {
            return Err(JournalError::IntegrityViolation(id));
        }

        Ok(record)
    }

    fn list(&self, query: &JournalQuery) -> Result<Vec<JobRecord>, JournalError> {
        let mut results = Vec::new();
        collect_records_recursive(&self.root, query, &mut results)?;
        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(results)
    }
}

fn find_file_recursive(dir: &Path, filename: &str) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }

    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file_recursive(&path, filename) {
                return Some(found);
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(filename) {
            return Some(path);
        }
    }

    None
}

fn collect_records_recursive(
    dir: &Path,
    query: &JournalQuery,
    results: &mut Vec<JobRecord>,
) -> Result<(), JournalError> {
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_records_recursive(&path, query, results)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let json = fs::read_to_string(&path)?;
            let record: JobRecord = serde_json::from_str(&json)?;
            if matches_query(&record, query) {
                results.push(record);
            }
        }
    }

    Ok(())
}

fn matches_query(record: &JobRecord, query: &JournalQuery) -> bool {
    if query.tenant_id.is_some_and(|t| t != record.tenant_id) {
        return false;
    }
    if query.job_id.is_some_and(|j| j != record.job_id) {
        return false;
    }
    if let Some(cid) = &query.config_id {
        if record.config_id.as_ref() != Some(cid) {
            return false;
        }
    }
    if query.status.is_some() && query.status != record.status {
        return false;
    }
    if query.from.is_some_and(|from| record.started_at < from) {
        return false;
    }
    if query.to.is_some_and(|to| record.started_at > to) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::JournalSession;
    use netloom_core::{JobOrigin, Protocol};

    fn create_test_record(tenant_id: TenantId, config_id: &str, status: JobStatus) -> JobRecord {
        let mut session =
            JournalSession::new(tenant_id, Uuid::new_v4(), JobOrigin::Scheduled, "192.168.1.0/24");
        session.set_config_id(Some(config_id.to_string()));
        session.record_protocol(Protocol::Arp, "ran", 4, None);
        session.add_step(
            "scan",
            "Collected observations",
            serde_json::json!({"observations": 4}),
            true,
        );
        session.finalize(status).unwrap()
    }

    #[test]
    fn save_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournal::new(dir.path()).unwrap();
        let record = create_test_record(TenantId::new(), "lan", JobStatus::Success);
        let id = record.id;

        store.save(&record).unwrap();
        let retrieved = store.get(id).unwrap();

        assert_eq!(retrieved, record);
        assert_eq!(retrieved.protocols.len(), 1);
        assert!(retrieved.verify_integrity());
    }

    #[test]
    fn integrity_violation_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournal::new(dir.path()).unwrap();
        let record = create_test_record(TenantId::new(), "lan", JobStatus::Success);
        let id = record.id;
        store.save(&record).unwrap();

        // Rewrite the status on disk without re-hashing.
        let path = store.find_path(id).unwrap();
        let mut tampered: JobRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        tampered.status = Some(JobStatus::Failed);
        fs::write(&path, serde_json::to_string_pretty(&tampered).unwrap()).unwrap();

        assert!(matches!(store.get(id), Err(JournalError::IntegrityViolation(_))));
    }

    #[test]
    fn save_rejects_unfinalized() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournal::new(dir.path()).unwrap();
        let mut record = create_test_record(TenantId::new(), "lan", JobStatus::Success);
        record.content_hash = None;

        assert!(matches!(store.save(&record), Err(JournalError::NotFinalized)));
    }

    #[test]
    fn list_filters_by_config_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournal::new(dir.path()).unwrap();
        let tenant = TenantId::new();

        store.save(&create_test_record(tenant, "lan", JobStatus::Success)).unwrap();
        store.save(&create_test_record(tenant, "lan", JobStatus::Partial)).unwrap();
        store.save(&create_test_record(tenant, "lab", JobStatus::Success)).unwrap();
        store
            .save(&create_test_record(TenantId::new(), "lan", JobStatus::Success))
            .unwrap();

        let lan = store
            .list(&JournalQuery {
                tenant_id: Some(tenant),
                config_id: Some("lan".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(lan.len(), 2);

        let partial = store
            .list(&JournalQuery {
                status: Some(JobStatus::Partial),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].config_id.as_deref(), Some("lan"));
    }
}
