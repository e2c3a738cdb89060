use std::{
    collections::BTreeMap,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::*;

use crate::{error::JournalError, types::JournalEntry};

/// This is an alias for the result type returned by the [`Journal`].
pub type JournalResult<T> = Result<T, JournalError>;

/// The local, authoritative record of fully completed payments.
///
/// One JSON object per line on disk. Every mutation rewrites the file
/// atomically: serialize to a sibling temp file, fsync, rename over, fsync
/// the directory. A completed entry therefore survives process and OS
/// crashes once `mark_completed` has returned, and an entry's presence means
/// the obligation must never be paid again.
///
/// All operations are serialized through an internal mutex; the journal is
/// safe to share across tasks.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    entries: Mutex<BTreeMap<u64, JournalEntry>>,
}

impl Journal {
    /// Opens the journal at `path`, loading any existing entries.
    ///
    /// A missing file is an empty journal, not an error.
    pub async fn open(path: impl Into<PathBuf>) -> JournalResult<Self> {
        let path = path.into();
        let load_path = path.clone();
        let entries = tokio::task::spawn_blocking(move || load_entries(&load_path))
            .await
            .map_err(|e| JournalError::Io(std::io::Error::other(e)))??;
        debug!(path = %path.display(), entries = entries.len(), "Opened completion journal");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Whether `obligation_id` has been completed.
    pub async fn is_completed(&self, obligation_id: u64) -> bool {
        self.entries.lock().await.contains_key(&obligation_id)
    }

    /// The txid that completed `obligation_id`, if journaled.
    pub async fn transaction_of(&self, obligation_id: u64) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(&obligation_id)
            .map(|e| e.transaction_id.clone())
    }

    /// Records that `obligation_id` was completed by `transaction_id`.
    ///
    /// Durable once this returns. Idempotent for a matching txid; a
    /// different txid for an already-present id is refused with
    /// [`JournalError::Conflict`] and the journal is left unchanged.
    pub async fn mark_completed(
        &self,
        obligation_id: u64,
        transaction_id: &str,
    ) -> JournalResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&obligation_id) {
            if existing.transaction_id == transaction_id {
                return Ok(());
            }
            return Err(JournalError::Conflict {
                id: obligation_id,
                existing: existing.transaction_id.clone(),
                new: transaction_id.to_string(),
            });
        }

        let entry = JournalEntry {
            obligation_id,
            transaction_id: transaction_id.to_string(),
            completed_at: Utc::now(),
        };
        entries.insert(obligation_id, entry);

        let snapshot: Vec<JournalEntry> = entries.values().cloned().collect();
        let path = self.path.clone();
        let persisted = tokio::task::spawn_blocking(move || persist(&path, &snapshot))
            .await
            .map_err(|e| JournalError::Io(std::io::Error::other(e)))
            .and_then(|r| r);
        if let Err(e) = persisted {
            // keep memory and disk consistent: the mark did not happen
            entries.remove(&obligation_id);
            return Err(e);
        }
        debug!(%obligation_id, %transaction_id, "Journaled completed payment");
        Ok(())
    }

    /// All entries, ordered by obligation id. Operational tooling only.
    pub async fn snapshot(&self) -> Vec<JournalEntry> {
        self.entries.lock().await.values().cloned().collect()
    }
}

fn load_entries(path: &Path) -> JournalResult<BTreeMap<u64, JournalEntry>> {
    let mut entries = BTreeMap::new();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry = serde_json::from_str(line).map_err(|source| {
            JournalError::Corrupt {
                line: idx + 1,
                source,
            }
        })?;
        entries.insert(entry.obligation_id, entry);
    }
    Ok(entries)
}

fn persist(path: &Path, entries: &[JournalEntry]) -> JournalResult<()> {
    let mut buf = Vec::with_capacity(entries.len() * 128);
    for entry in entries {
        serde_json::to_writer(&mut buf, entry).map_err(JournalError::Encode)?;
        buf.push(b'\n');
    }

    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;

    // fsync the directory so the rename itself is durable
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            if let Ok(dir_file) = File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_empty_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("journal.jsonl")).await.unwrap();
        assert!(!journal.is_completed(1).await);
        assert_eq!(journal.transaction_of(1).await, None);
        assert!(journal.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        let journal = Journal::open(&path).await.unwrap();
        journal.mark_completed(42, "tx-a").await.unwrap();
        journal.mark_completed(7, "tx-b").await.unwrap();
        drop(journal);

        let reopened = Journal::open(&path).await.unwrap();
        assert!(reopened.is_completed(42).await);
        assert_eq!(reopened.transaction_of(7).await, Some("tx-b".to_string()));
        // snapshot is ordered by obligation id
        let ids: Vec<u64> = reopened
            .snapshot()
            .await
            .iter()
            .map(|e| e.obligation_id)
            .collect();
        assert_eq!(ids, vec![7, 42]);
    }

    #[tokio::test]
    async fn re_marking_same_txid_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("j.jsonl")).await.unwrap();
        journal.mark_completed(1, "tx-a").await.unwrap();
        journal.mark_completed(1, "tx-a").await.unwrap();
        assert_eq!(journal.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_txid_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("j.jsonl")).await.unwrap();
        journal.mark_completed(1, "tx-a").await.unwrap();

        let err = journal.mark_completed(1, "tx-b").await.unwrap_err();
        match err {
            JournalError::Conflict { id, existing, new } => {
                assert_eq!(id, 1);
                assert_eq!(existing, "tx-a");
                assert_eq!(new, "tx-b");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // the original record is untouched
        assert_eq!(journal.transaction_of(1).await, Some("tx-a".to_string()));
    }

    #[tokio::test]
    async fn on_disk_form_is_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::open(&path).await.unwrap();
        journal.mark_completed(100, "tx-1").await.unwrap();
        journal.mark_completed(101, "tx-2").await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.get("paymentId").is_some());
            assert!(v.get("transactionId").is_some());
            assert!(v.get("completedAt").is_some());
        }
        // no temp sibling left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_line_is_reported_with_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(
            &path,
            "{\"paymentId\":1,\"transactionId\":\"t\",\"completedAt\":\"2026-01-01T00:00:00Z\"}\nnot json\n",
        )
        .unwrap();

        let err = Journal::open(&path).await.unwrap_err();
        match err {
            JournalError::Corrupt { line, .. } => assert_eq!(line, 2),
            other => panic!("expected corrupt, got {other:?}"),
        }
    }
}
