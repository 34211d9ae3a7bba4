//! Session store access and session-key helpers
//!
//! The session store is a JSON map file keyed by session key. Loads always
//! read fresh from disk; ingestion and materialization must see the latest
//! routing state, not a cached view.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use kgm_state::normalize_agent_id;

/// One routed session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionEntry {
    pub session_id: Option<String>,
    pub session_file: Option<String>,
    pub label: Option<String>,
    pub kind: Option<String>,
    pub updated_at: Option<i64>,
}

pub type SessionStore = HashMap<String, SessionEntry>;

/// Agent id embedded in a session key (`agent:<id>:...`), else `main`.
pub fn resolve_agent_id_from_session_key(session_key: &str) -> String {
    let mut parts = session_key.splitn(3, ':');
    if parts.next() == Some("agent") {
        if let Some(id) = parts.next() {
            if !id.trim().is_empty() {
                return normalize_agent_id(id);
            }
        }
    }
    "main".to_string()
}

/// Group sessions come from the entry kind or a `group` key segment.
pub fn classify_session_key(session_key: &str, entry: Option<&SessionEntry>) -> &'static str {
    if let Some(entry) = entry {
        if entry.kind.as_deref() == Some("group") {
            return "group";
        }
    }
    if session_key.split(':').any(|segment| segment == "group") {
        return "group";
    }
    "direct"
}

/// Default store path: `<state_dir>/agents/<id>/sessions/sessions.json`.
pub fn resolve_store_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir
        .join("agents")
        .join(normalize_agent_id(agent_id))
        .join("sessions")
        .join("sessions.json")
}

/// Read the store file fresh. A missing or unparseable file is an empty map.
pub fn load_session_store(store_path: &Path) -> SessionStore {
    let raw = match std::fs::read_to_string(store_path) {
        Ok(raw) => raw,
        Err(_) => return SessionStore::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(store) => store,
        Err(err) => {
            debug!(path = %store_path.display(), error = %err, "unreadable session store");
            SessionStore::new()
        }
    }
}

/// Entry matching a transcript file, by file path first and session id as a
/// fallback.
pub fn find_session_for_file<'a>(
    store: &'a SessionStore,
    session_file: &str,
    session_id: Option<&str>,
) -> Option<(&'a String, &'a SessionEntry)> {
    store
        .iter()
        .find(|(_, entry)| entry.session_file.as_deref() == Some(session_file))
        .or_else(|| {
            session_id.and_then(|id| {
                store
                    .iter()
                    .find(|(_, entry)| entry.session_id.as_deref() == Some(id))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_from_session_key() {
        assert_eq!(resolve_agent_id_from_session_key("agent:Alpha:main"), "alpha");
        assert_eq!(resolve_agent_id_from_session_key("agent:beta:group:xyz"), "beta");
        assert_eq!(resolve_agent_id_from_session_key("whatsapp:12345"), "main");
        assert_eq!(resolve_agent_id_from_session_key("agent::main"), "main");
    }

    #[test]
    fn group_classification() {
        assert_eq!(classify_session_key("agent:alpha:group:xyz", None), "group");
        assert_eq!(classify_session_key("agent:alpha:main", None), "direct");
        let entry = SessionEntry {
            kind: Some("group".into()),
            ..SessionEntry::default()
        };
        assert_eq!(classify_session_key("agent:alpha:main", Some(&entry)), "group");
    }

    #[test]
    fn store_lookup_prefers_file_match() {
        let mut store = SessionStore::new();
        store.insert(
            "agent:alpha:main".into(),
            SessionEntry {
                session_id: Some("sid-1".into()),
                session_file: Some("/tmp/a.jsonl".into()),
                ..SessionEntry::default()
            },
        );
        store.insert(
            "agent:alpha:other".into(),
            SessionEntry {
                session_id: Some("sid-2".into()),
                session_file: Some("/tmp/b.jsonl".into()),
                ..SessionEntry::default()
            },
        );
        let (key, _) = find_session_for_file(&store, "/tmp/b.jsonl", Some("sid-1")).unwrap();
        assert_eq!(key, "agent:alpha:other");
        let (key, _) = find_session_for_file(&store, "/tmp/missing.jsonl", Some("sid-1")).unwrap();
        assert_eq!(key, "agent:alpha:main");
        assert!(find_session_for_file(&store, "/tmp/missing.jsonl", None).is_none());
    }

    #[test]
    fn missing_store_file_is_empty() {
        assert!(load_session_store(Path::new("/nonexistent/sessions.json")).is_empty());
    }
}
