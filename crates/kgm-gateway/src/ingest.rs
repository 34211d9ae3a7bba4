//! Debounced session-transcript ingestion
//!
//! Each transcript update upserts the session node, the latest message node
//! (with a short preview), and the `HAS_MESSAGE` edge inside the agent's
//! scope. The scheduler debounces per file: only the latest update within a
//! window is ingested.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use kgm_state::{normalize_agent_id, resolve_agent_scope, Actor, GraphProvider, JsonObject, Result};

use crate::sessions::{find_session_for_file, load_session_store, resolve_store_path};
use crate::transcript::{
    coerce_timestamp, extract_text, read_first_json_line, read_last_message_line, resolve_entry_id,
};

const PREVIEW_MAX_CHARS: usize = 200;
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Agent id from a transcript path shaped `.../agents/<id>/sessions/...`.
pub fn extract_agent_id_from_session_file(session_file: &str) -> Option<String> {
    let pattern = regex::RegexBuilder::new(r"[\\/]agents[\\/]([^\\/]+)[\\/]sessions[\\/]")
        .case_insensitive(true)
        .build()
        .ok()?;
    let captured = pattern.captures(session_file)?.get(1)?.as_str();
    Some(normalize_agent_id(captured))
}

/// Ingest the latest message of one transcript file. Returns `Ok(false)`
/// when the file cannot be attributed (no agent id, no header, no routed
/// session, or no message yet).
#[instrument(skip(provider, state_dir))]
pub async fn ingest_session_transcript_file(
    provider: &dyn GraphProvider,
    state_dir: &Path,
    session_file: &str,
) -> Result<bool> {
    let Some(agent_id) = extract_agent_id_from_session_file(session_file) else {
        return Ok(false);
    };
    let header = read_first_json_line(Path::new(session_file));
    let session_id = header
        .and_then(|line| line.id)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    let Some(session_id) = session_id else {
        return Ok(false);
    };
    let store = load_session_store(&resolve_store_path(state_dir, &agent_id));
    let Some((session_key, _entry)) =
        find_session_for_file(&store, session_file, Some(&session_id))
    else {
        debug!(session_file, "no routed session for transcript");
        return Ok(false);
    };
    let Some(line) = read_last_message_line(Path::new(session_file)) else {
        return Ok(false);
    };
    let Some(message) = &line.message else {
        return Ok(false);
    };

    let text = extract_text(message.content.as_ref()).unwrap_or_else(|| "message".to_string());
    let timestamp = coerce_timestamp(message.timestamp.as_ref())
        .or_else(|| coerce_timestamp(line.timestamp.as_ref()))
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let entry_id = resolve_entry_id(&session_id, &line, timestamp);
    let scope = resolve_agent_scope(&agent_id);
    let actor = Actor::System {
        agent_id: Some(agent_id.clone()),
        session_key: Some(session_key.clone()),
    };

    let mut props = JsonObject::new();
    props.insert("sessionId".into(), json!(session_id));
    props.insert("agentId".into(), json!(agent_id));
    props.insert("sessionKey".into(), json!(session_key));
    props.insert("updatedAt".into(), json!(timestamp));
    let session_node = provider
        .upsert_node(&actor, &scope, "Session", session_key, props)
        .await?;

    let preview: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
    let mut props = JsonObject::new();
    props.insert("entryId".into(), json!(entry_id));
    props.insert("sessionId".into(), json!(session_id));
    props.insert("sessionKey".into(), json!(session_key));
    props.insert(
        "role".into(),
        json!(message.role.as_deref().unwrap_or("unknown")),
    );
    props.insert("ts".into(), json!(timestamp));
    props.insert("preview".into(), json!(preview));
    let message_node = provider
        .upsert_node(&actor, &scope, "Message", &entry_id, props)
        .await?;

    provider
        .upsert_edge(
            &actor,
            &scope,
            "HAS_MESSAGE",
            &session_node,
            &message_node,
            JsonObject::new(),
        )
        .await?;
    Ok(true)
}

struct PendingIngest {
    generation: u64,
    handle: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<PathBuf, PendingIngest>>>;

fn lock_pending(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<PathBuf, PendingIngest>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Per-file debounce over [`ingest_session_transcript_file`].
pub struct IngestScheduler {
    provider: Arc<dyn GraphProvider>,
    state_dir: PathBuf,
    delay: Duration,
    pending: PendingMap,
    generation: AtomicU64,
}

impl IngestScheduler {
    pub fn new(provider: Arc<dyn GraphProvider>, state_dir: impl Into<PathBuf>) -> Self {
        Self::with_delay(provider, state_dir, DEFAULT_DEBOUNCE)
    }

    pub fn with_delay(
        provider: Arc<dyn GraphProvider>,
        state_dir: impl Into<PathBuf>,
        delay: Duration,
    ) -> Self {
        Self {
            provider,
            state_dir: state_dir.into(),
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Schedule an ingest for the file, superseding any pending one. The
    /// fired task removes its own map entry so the map tracks only live
    /// timers.
    pub fn schedule(&self, session_file: impl Into<PathBuf>) {
        let session_file = session_file.into();
        let provider = self.provider.clone();
        let state_dir = self.state_dir.clone();
        let delay = self.delay;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let file = session_file.clone();
        let pending = self.pending.clone();
        // Hold the lock across spawn+insert so the task cannot observe the
        // map before its own entry lands.
        let mut guard = lock_pending(&self.pending);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let path = file.to_string_lossy();
            if let Err(err) =
                ingest_session_transcript_file(provider.as_ref(), &state_dir, &path).await
            {
                warn!(session_file = %path, error = %err, "transcript ingest failed");
            }
            let mut guard = lock_pending(&pending);
            // A newer schedule for the same file may have replaced the entry.
            if guard.get(&file).map(|p| p.generation) == Some(generation) {
                guard.remove(&file);
            }
        });
        if let Some(previous) = guard.insert(session_file, PendingIngest { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Files with a timer still armed.
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Abort everything still pending.
    pub fn shutdown(&self) {
        let mut pending = lock_pending(&self.pending);
        for (_, entry) in pending.drain() {
            entry.handle.abort();
        }
    }
}

impl Drop for IngestScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_extraction() {
        assert_eq!(
            extract_agent_id_from_session_file("/state/agents/Alpha/sessions/s1.jsonl"),
            Some("alpha".to_string())
        );
        assert_eq!(
            extract_agent_id_from_session_file(r"C:\state\AGENTS\beta\SESSIONS\s1.jsonl"),
            Some("beta".to_string())
        );
        assert_eq!(
            extract_agent_id_from_session_file("/state/other/alpha/s1.jsonl"),
            None
        );
    }
}
