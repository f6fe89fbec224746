//! Directory-backed session activity.
//!
//! Every `*.txt`, `*.md` or `*.log` file directly under the sessions
//! directory is one session transcript; its file stem is the session id.
//! Processed ids are appended to a `.processed` ledger in the same
//! directory, so a transcript is mined once even across restarts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mnemo_engine::{ActivitySource, SessionActivity};
use mnemo_types::MnemoError;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

const LEDGER: &str = ".processed";
const EXTENSIONS: [&str; 3] = ["txt", "md", "log"];

pub struct DirectorySource {
    dir: PathBuf,
    /// Serialises ledger appends.
    ledger_lock: Mutex<()>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ledger_lock: Mutex::new(()),
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.dir.join(LEDGER)
    }

    async fn processed_ids(&self) -> Result<HashSet<String>, MnemoError> {
        match tokio::fs::read_to_string(self.ledger_path()).await {
            Ok(raw) => Ok(raw.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(io_error("read session ledger", e)),
        }
    }
}

fn io_error(what: &str, e: std::io::Error) -> MnemoError {
    MnemoError::DaemonExtractionFailure(format!("{what}: {e}"))
}

fn session_id(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    path.file_stem()?.to_str().map(String::from)
}

#[async_trait]
impl ActivitySource for DirectorySource {
    async fn pending_sessions(&self, workspace_id: &str) -> Result<Vec<SessionActivity>, MnemoError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list sessions", e)),
        };
        let processed = self.processed_ids().await?;

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error("list sessions", e))? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(id) = session_id(&path)
                && !processed.contains(&id)
            {
                candidates.push((id, path));
            }
        }
        candidates.sort();

        let mut sessions = Vec::with_capacity(candidates.len());
        for (session_id, path) in candidates {
            let transcript = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| io_error("read transcript", e))?;
            if transcript.trim().is_empty() {
                debug!(session = %session_id, "skipping empty transcript");
                continue;
            }
            sessions.push(SessionActivity {
                session_id,
                workspace_id: workspace_id.to_string(),
                transcript,
            });
        }
        Ok(sessions)
    }

    async fn mark_processed(&self, session_id: &str) -> Result<(), MnemoError> {
        let _guard = self.ledger_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("create sessions directory", e))?;
        let mut ledger = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ledger_path())
            .await
            .map_err(|e| io_error("open session ledger", e))?;
        ledger
            .write_all(format!("{session_id}\n").as_bytes())
            .await
            .map_err(|e| io_error("append session ledger", e))?;
        ledger.flush().await.map_err(|e| io_error("flush session ledger", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_transcripts_sorted_by_session_id() {
        let dir = tempfile::tempdir().expect("tmp dir");
        std::fs::write(dir.path().join("b-session.md"), "cut size after gap").unwrap();
        std::fs::write(dir.path().join("a-session.txt"), "stopped out twice").unwrap();
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();
        std::fs::write(dir.path().join("empty.log"), "   \n").unwrap();

        let source = DirectorySource::new(dir.path());
        let sessions = source.pending_sessions("ws").await.unwrap();

        let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a-session", "b-session"]);
        assert!(sessions.iter().all(|s| s.workspace_id == "ws"));
        assert_eq!(sessions[0].transcript, "stopped out twice");
    }

    #[tokio::test]
    async fn processed_sessions_are_not_listed_again() {
        let dir = tempfile::tempdir().expect("tmp dir");
        std::fs::write(dir.path().join("s1.txt"), "one").unwrap();
        std::fs::write(dir.path().join("s2.txt"), "two").unwrap();
        let source = DirectorySource::new(dir.path());

        source.mark_processed("s1").await.unwrap();
        let pending = source.pending_sessions("ws").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_id, "s2");

        // A fresh source reads the same ledger.
        let reopened = DirectorySource::new(dir.path());
        reopened.mark_processed("s2").await.unwrap();
        assert!(reopened.pending_sessions("ws").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_has_no_sessions() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let source = DirectorySource::new(dir.path().join("not-created-yet"));
        assert!(source.pending_sessions("ws").await.unwrap().is_empty());
    }
}
