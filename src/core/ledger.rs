//! Append-only attestation ledger with file-based persistence.
//!
//! Each Change gets a directory holding `attestations.jsonl`, one
//! attestation per line. Every process sharing a home directory goes
//! through `fs2` locks:
//! - appends hold an exclusive lock on the ledger while they read the
//!   tail, seal the next link and write it
//! - reads hold a shared lock, so they never see a half-written line
//! - `lock_change` takes `operations.lock`, serializing check-then-append
//!   operations on one Change across processes

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::fs;
use uuid::Uuid;

use crate::domain::Attestation;

const LEDGER_FILE: &str = "attestations.jsonl";
const OPERATIONS_LOCK: &str = "operations.lock";

/// Decoded ledger contents, including the first undecodable line if any
#[derive(Debug, Default)]
pub struct LedgerContents {
    pub links: Vec<Attestation>,

    /// `(line index, parse error)` of the first line that failed to decode.
    /// Reading stops there.
    pub corrupt_at: Option<(u64, String)>,
}

/// Position the next link must take
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTail {
    /// Number of links already persisted
    pub length: u64,

    /// Hash of the last link, `None` for an empty ledger
    pub head: Option<String>,
}

/// Exclusive hold on a Change's operations; released on drop
#[derive(Debug)]
pub struct ChangeLock {
    file: std::fs::File,
}

impl Drop for ChangeLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// File-based store of attestation chains, one JSONL file per Change
#[derive(Debug, Clone)]
pub struct Ledger {
    base_dir: PathBuf,
}

impl Ledger {
    /// Open a ledger rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Ledger under the configured home (`~/.gatechain/changes` or `$GATECHAIN_HOME/changes`)
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::config::changes_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn change_dir(&self, change_id: Uuid) -> PathBuf {
        self.base_dir.join(change_id.to_string())
    }

    pub fn ledger_path(&self, change_id: Uuid) -> PathBuf {
        self.change_dir(change_id).join(LEDGER_FILE)
    }

    /// Whether any attestation has been persisted for this Change
    pub fn exists(&self, change_id: Uuid) -> bool {
        self.ledger_path(change_id).exists()
    }

    /// Append the link built from the current tail.
    ///
    /// The ledger stays exclusively locked from reading the tail until the
    /// new line is synced, so links written by other processes are always
    /// seen and the chain cannot fork. A ledger with an undecodable line
    /// refuses appends.
    pub async fn append_next<F>(&self, change_id: Uuid, seal: F) -> Result<Attestation>
    where
        F: FnOnce(&LedgerTail) -> Result<Attestation> + Send + 'static,
    {
        let dir = self.change_dir(change_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create change directory: {}", dir.display()))?;

        let path = dir.join(LEDGER_FILE);

        tokio::task::spawn_blocking(move || -> Result<Attestation> {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open ledger: {}", path.display()))?;

            file.lock_exclusive()
                .with_context(|| format!("Failed to lock ledger: {}", path.display()))?;

            let appended = read_lines(&file).and_then(|contents| {
                if let Some((line, error)) = contents.corrupt_at {
                    anyhow::bail!(
                        "Ledger for change {} is corrupt at line {}: {}",
                        change_id,
                        line,
                        error
                    );
                }

                let tail = LedgerTail {
                    length: contents.links.len() as u64,
                    head: contents.links.last().map(|a| a.hash.clone()),
                };
                let attestation = seal(&tail)?;
                let line =
                    serde_json::to_string(&attestation).context("Failed to serialize attestation")?;

                writeln!(file, "{}", line)
                    .and_then(|_| file.flush())
                    .and_then(|_| file.sync_data())
                    .context("Failed to write attestation")?;
                Ok(attestation)
            });
            let _ = file.unlock();

            appended
        })
        .await
        .context("Ledger writer task failed")?
    }

    /// Read every decodable line, noting where decoding first fails
    pub async fn read(&self, change_id: Uuid) -> Result<LedgerContents> {
        let path = self.ledger_path(change_id);

        tokio::task::spawn_blocking(move || -> Result<LedgerContents> {
            if !path.exists() {
                return Ok(LedgerContents::default());
            }

            let file = std::fs::File::open(&path)
                .with_context(|| format!("Failed to open ledger: {}", path.display()))?;
            file.lock_shared()
                .with_context(|| format!("Failed to lock ledger: {}", path.display()))?;
            let contents = read_lines(&file);
            let _ = file.unlock();
            contents
        })
        .await
        .context("Ledger reader task failed")?
    }

    /// Serialize operations on one Change across processes.
    ///
    /// Fails if the Change has no ledger.
    pub async fn lock_change(&self, change_id: Uuid) -> Result<ChangeLock> {
        let dir = self.change_dir(change_id);

        tokio::task::spawn_blocking(move || -> Result<ChangeLock> {
            if !dir.join(LEDGER_FILE).exists() {
                anyhow::bail!("No ledger for change {}", change_id);
            }
            let path = dir.join(OPERATIONS_LOCK);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("Failed to open lock file: {}", path.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("Failed to lock change {}", change_id))?;
            Ok(ChangeLock { file })
        })
        .await
        .context("Change lock task failed")?
    }

    /// Replay all attestations in order; any undecodable line is an error
    pub async fn replay(&self, change_id: Uuid) -> Result<Vec<Attestation>> {
        let contents = self.read(change_id).await?;

        if let Some((line, error)) = contents.corrupt_at {
            anyhow::bail!(
                "Ledger for change {} is corrupt at line {}: {}",
                change_id,
                line,
                error
            );
        }

        Ok(contents.links)
    }

    /// List all Change IDs with a ledger directory
    pub async fn list_changes(&self) -> Result<Vec<Uuid>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut changes = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(id) = Uuid::parse_str(name) {
                        changes.push(id);
                    }
                }
            }
        }

        Ok(changes)
    }
}

/// Decode JSONL links from the start of an open ledger
fn read_lines(file: &std::fs::File) -> Result<LedgerContents> {
    let mut contents = LedgerContents::default();
    let mut index = 0u64;

    for line in BufReader::new(file).lines() {
        let line = line.context("Failed to read ledger")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Attestation>(&line) {
            Ok(attestation) => contents.links.push(attestation),
            Err(e) => {
                contents.corrupt_at = Some((index, e.to_string()));
                break;
            }
        }
        index += 1;
    }

    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::GENESIS_HASH;
    use crate::domain::{AttestationPayload, ChangeState};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn link(change_id: Uuid, tail: &LedgerTail) -> Attestation {
        let payload = AttestationPayload::Lifecycle {
            state: ChangeState::AwaitingApproval,
            reason: Some(format!("link {}", tail.length)),
        };
        Attestation {
            index: tail.length,
            change_id,
            subject: payload.subject(),
            payload,
            signer_key_id: "0123456789abcdef".to_string(),
            recorded_at: Utc::now(),
            previous_hash: tail.head.clone().unwrap_or_else(|| GENESIS_HASH.to_string()),
            hash: format!("{:064x}", tail.length + 1),
            signature: String::new(),
        }
    }

    async fn push(ledger: &Ledger, change_id: Uuid) -> Attestation {
        ledger
            .append_next(change_id, move |tail| Ok(link(change_id, tail)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());
        let change_id = Uuid::new_v4();

        for _ in 0..5 {
            push(&ledger, change_id).await;
        }

        let links = ledger.replay(change_id).await.unwrap();
        assert_eq!(links.len(), 5);
        assert_eq!(links[0].previous_hash, GENESIS_HASH);
        for (i, attestation) in links.iter().enumerate() {
            assert_eq!(attestation.index, i as u64);
        }
    }

    #[tokio::test]
    async fn test_tail_includes_links_written_elsewhere() {
        let temp = TempDir::new().unwrap();
        let first = Ledger::new(temp.path());
        let second = Ledger::new(temp.path());
        let change_id = Uuid::new_v4();

        let a = push(&first, change_id).await;
        let b = push(&second, change_id).await;
        let c = push(&first, change_id).await;

        assert_eq!(b.index, 1);
        assert_eq!(b.previous_hash, a.hash);
        assert_eq!(c.index, 2);
        assert_eq!(c.previous_hash, b.hash);
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_linear() {
        let temp = TempDir::new().unwrap();
        let change_id = Uuid::new_v4();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let ledger = Ledger::new(temp.path());
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    push(&ledger, change_id).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let links = Ledger::new(temp.path()).replay(change_id).await.unwrap();
        assert_eq!(links.len(), 20);
        for pair in links.windows(2) {
            assert_eq!(pair[1].index, pair[0].index + 1);
            assert_eq!(pair[1].previous_hash, pair[0].hash);
        }
    }

    #[tokio::test]
    async fn test_missing_ledger_replays_empty() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());
        let change_id = Uuid::new_v4();

        assert!(!ledger.exists(change_id));
        assert!(ledger.replay(change_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_line_reported_with_index() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());
        let change_id = Uuid::new_v4();

        push(&ledger, change_id).await;
        let path = ledger.ledger_path(change_id);
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();

        let contents = ledger.read(change_id).await.unwrap();
        assert_eq!(contents.links.len(), 1);
        assert_eq!(contents.corrupt_at.map(|(i, _)| i), Some(1));
        assert!(ledger.replay(change_id).await.is_err());

        let refused = ledger
            .append_next(change_id, move |tail| Ok(link(change_id, tail)))
            .await;
        assert!(refused.unwrap_err().to_string().contains("corrupt at line 1"));
    }

    #[tokio::test]
    async fn test_change_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());
        let change_id = Uuid::new_v4();

        assert!(ledger.lock_change(change_id).await.is_err());
        push(&ledger, change_id).await;

        let held = ledger.lock_change(change_id).await.unwrap();
        let other = Ledger::new(temp.path());
        let waiting = tokio::spawn(async move { other.lock_change(change_id).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        drop(held);
        let acquired = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .expect("lock released")
            .unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_list_changes_ignores_stray_entries() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::new(temp.path());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        push(&ledger, a).await;
        push(&ledger, b).await;
        std::fs::create_dir_all(temp.path().join("not-a-change")).unwrap();

        let mut changes = ledger.list_changes().await.unwrap();
        changes.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(changes, expected);
    }
}
