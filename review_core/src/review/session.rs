//! Resumable, per-run persistence: conversation, workflow events, diff
//! units, and static-scan linkage, one JSON document per session id (spec
//! §3, §3.1, §6 "Persisted session file"). Atomic writes follow the
//! teacher's `Session::atomic_file_operation` pattern (write to `<path>.tmp`,
//! `sync_all`, rename over the target) rather than `tempfile`, since this
//! path is exercised from async code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::error::SessionError;
use super::model::ReviewUnit;
use super::static_scan::StaticScanLinked;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    System,
    Assistant,
    Tool,
}

/// One turn of the conversation driving a pipeline run (spec §3.1). The
/// assistant-only and tool-only fields are `None` on every other role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            reasoning: None,
            tool_call_id: None,
            name: None,
            error: None,
        }
    }

    pub fn assistant(content: impl Into<String>, reasoning: Option<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            reasoning,
            tool_call_id: None,
            name: None,
            error: None,
        }
    }
}

/// A pipeline-stage event (spec §3.1). Adjacent `thought`/`chunk` events
/// sharing a `stage` are coalesced into one entry rather than appended
/// (spec §8: "stored list length grows by exactly 1").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_type: String,
    pub stage: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

fn is_coalescible(event_type: &str) -> bool {
    event_type == "thought" || event_type == "chunk"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub project_root: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SessionMetadata {
    fn new(name: Option<String>, project_root: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            name,
            project_root,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub workflow_events: Vec<WorkflowEvent>,
    #[serde(default)]
    pub diff_files: Vec<String>,
    #[serde(default)]
    pub diff_units: Vec<ReviewUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_scan_linked: Option<StaticScanLinked>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, name: Option<String>, project_root: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            metadata: SessionMetadata::new(name, project_root),
            messages: Vec::new(),
            workflow_events: Vec::new(),
            diff_files: Vec::new(),
            diff_units: Vec::new(),
            static_scan_linked: None,
        }
    }

    pub fn push_message(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        self.metadata.updated_at = Utc::now();
    }

    /// Appends `event`, coalescing into the last stored event when both are
    /// `thought`/`chunk` and share `stage` (spec §3.1, §8).
    pub fn push_workflow_event(&mut self, event: WorkflowEvent) {
        if is_coalescible(&event.event_type) {
            if let Some(last) = self.workflow_events.last_mut() {
                if last.event_type == event.event_type && last.stage == event.stage {
                    last.content.push_str(&event.content);
                    last.timestamp = event.timestamp;
                    self.metadata.updated_at = Utc::now();
                    return;
                }
            }
        }
        self.workflow_events.push(event);
        self.metadata.updated_at = Utc::now();
    }

    pub fn set_diff_units(&mut self, files: Vec<String>, units: Vec<ReviewUnit>) {
        self.diff_files = files;
        self.diff_units = units;
        self.metadata.updated_at = Utc::now();
    }

    pub fn set_static_scan_linked(&mut self, linked: StaticScanLinked) {
        self.static_scan_linked = Some(linked);
        self.metadata.updated_at = Utc::now();
    }

    pub fn archive(&mut self) {
        self.metadata.status = SessionStatus::Archived;
        self.metadata.updated_at = Utc::now();
    }

    pub fn complete(&mut self) {
        self.metadata.status = SessionStatus::Completed;
        self.metadata.updated_at = Utc::now();
    }
}

/// Owns the `<agent_root>/data/sessions/` directory and an in-memory cache
/// of loaded sessions (spec §2.1: one `SessionStore` handle per `Pipeline`,
/// behind an `Arc`, replacing the original's module-level session manager).
pub struct SessionStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<RwLock<Session>>>>,
}

impl SessionStore {
    pub fn new(agent_root: impl Into<PathBuf>) -> Self {
        Self {
            root: agent_root.into().join("data").join("sessions"),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    /// Atomic write following the teacher's `Session::atomic_file_operation`:
    /// write to `<path>.tmp`, `sync_all`, then rename over the target.
    async fn write_atomic(path: &Path, body: &str) -> Result<(), SessionError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(body.trim_end().as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    pub async fn create(&self, session_id: impl Into<String>, name: Option<String>, project_root: Option<String>) -> Arc<RwLock<Session>> {
        let session_id = session_id.into();
        let session = Arc::new(RwLock::new(Session::new(session_id.clone(), name, project_root)));
        self.cache.write().await.insert(session_id, session.clone());
        session
    }

    /// Loads from the in-memory cache if present, else from disk, else
    /// returns `SessionError::NotFound`.
    pub async fn load(&self, session_id: &str) -> Result<Arc<RwLock<Session>>, SessionError> {
        if let Some(cached) = self.cache.read().await.get(session_id).cloned() {
            return Ok(cached);
        }

        let path = self.path_for(session_id);
        if !path.exists() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let raw = fs::read_to_string(&path).await?;
        let session: Session = serde_json::from_str(raw.trim())?;
        let handle = Arc::new(RwLock::new(session));
        self.cache.write().await.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Loads if present, otherwise creates a fresh session under `session_id`.
    pub async fn load_or_create(
        &self,
        session_id: &str,
        name: Option<String>,
        project_root: Option<String>,
    ) -> Arc<RwLock<Session>> {
        match self.load(session_id).await {
            Ok(handle) => handle,
            Err(_) => self.create(session_id, name, project_root).await,
        }
    }

    /// Serializes and atomically writes the current state of `session_id`.
    /// Falls back to a temp-directory copy on a write failure rather than
    /// ever propagating it as fatal (spec §7 "PersistenceError ... fall back
    /// to a temp-directory copy and log; never crash the pipeline").
    pub async fn save(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self.load(session_id).await?;
        let body = {
            let guard = handle.read().await;
            serde_json::to_string_pretty(&*guard)?
        };

        let path = self.path_for(session_id);
        if let Err(primary_err) = Self::write_atomic(&path, &body).await {
            let fallback = std::env::temp_dir().join(format!("{session_id}.session.json"));
            if Self::write_atomic(&fallback, &body).await.is_ok() {
                tracing::warn!(
                    session_id,
                    error = %primary_err,
                    fallback = %fallback.display(),
                    "session save degraded to temp-directory fallback"
                );
                return Ok(());
            }
            return Err(primary_err);
        }
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        self.cache.write().await.remove(session_id);
        let path = self.path_for(session_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    pub async fn archive(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self.load(session_id).await?;
        handle.write().await.archive();
        self.save(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_adjacent_thought_events_sharing_stage() {
        let mut session = Session::new("s1", None, None);
        for i in 0..3 {
            session.push_workflow_event(WorkflowEvent {
                event_type: "thought".to_string(),
                stage: "rule_engine".to_string(),
                content: format!("part{i}"),
                timestamp: Utc::now(),
            });
        }
        assert_eq!(session.workflow_events.len(), 1);
        assert_eq!(session.workflow_events[0].content, "part0part1part2");
    }

    #[test]
    fn does_not_coalesce_across_different_stages() {
        let mut session = Session::new("s1", None, None);
        session.push_workflow_event(WorkflowEvent {
            event_type: "thought".to_string(),
            stage: "rule_engine".to_string(),
            content: "a".to_string(),
            timestamp: Utc::now(),
        });
        session.push_workflow_event(WorkflowEvent {
            event_type: "thought".to_string(),
            stage: "fusion".to_string(),
            content: "b".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(session.workflow_events.len(), 2);
    }

    #[test]
    fn does_not_coalesce_non_thought_chunk_events() {
        let mut session = Session::new("s1", None, None);
        session.push_workflow_event(WorkflowEvent {
            event_type: "tool_call".to_string(),
            stage: "rule_engine".to_string(),
            content: "a".to_string(),
            timestamp: Utc::now(),
        });
        session.push_workflow_event(WorkflowEvent {
            event_type: "tool_call".to_string(),
            stage: "rule_engine".to_string(),
            content: "b".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(session.workflow_events.len(), 2);
    }

    #[tokio::test]
    async fn save_and_load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let handle = store.create("s1", Some("demo".to_string()), None).await;
        handle.write().await.push_message(ConversationMessage::user("hello"));
        store.save("s1").await.unwrap();

        let store2 = SessionStore::new(dir.path());
        let reloaded = store2.load("s1").await.unwrap();
        let guard = reloaded.read().await;
        assert_eq!(guard.messages.len(), 1);
        assert_eq!(guard.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn load_missing_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let err = store.load("nope").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn load_or_create_creates_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let handle = store.load_or_create("fresh", None, None).await;
        assert_eq!(handle.read().await.session_id, "fresh");
    }

    #[tokio::test]
    async fn archive_flips_status_without_deleting_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.create("s1", None, None).await;
        store.save("s1").await.unwrap();
        store.archive("s1").await.unwrap();

        let handle = store.load("s1").await.unwrap();
        assert_eq!(handle.read().await.metadata.status, SessionStatus::Archived);
        assert!(store.path_for("s1").exists());
    }
}
