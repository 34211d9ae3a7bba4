//! Context-set manager
//!
//! A scope's working set is a `ContextSet` node plus `ContextItem` members
//! joined by `INCLUDES` edges. Item keys are deterministic
//! (`ctxitem:<kind>:<refKey>`), so add and remove are idempotent.
//! Materialization renders the set as markdown, rehydrating message text from
//! transcripts and appending the agent's workspace docs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use kgm_state::{Actor, GraphProvider, JsonObject, Result};

use crate::sessions::{
    classify_session_key, load_session_store, resolve_agent_id_from_session_key,
    resolve_store_path, SessionStore,
};
use crate::transcript::{extract_text, read_message_by_entry_id};
use crate::workspace::{
    build_bootstrap_context_docs, filter_bootstrap_files_for_group,
    load_workspace_bootstrap_files, resolve_agent_workspace_dir, DEFAULT_BOOTSTRAP_MAX_CHARS,
};

const MAX_MATERIALIZED_MESSAGE_CHARS: usize = 1200;

/// One member of a context set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    pub key: String,
    pub kind: Option<String>,
    pub ref_type: Option<String>,
    pub ref_key: Option<String>,
    pub created_at: Option<i64>,
}

/// Membership changes to apply in one patch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextPatch {
    pub add_nodes: Vec<String>,
    pub add_messages: Vec<String>,
    pub remove_nodes: Vec<String>,
    pub remove_messages: Vec<String>,
}

/// Rendering bounds and session identity for materialization.
#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    pub max_nodes: Option<f64>,
    pub max_messages: Option<f64>,
    pub session_key: Option<String>,
}

fn resolve_context_set_key(scope: &str) -> String {
    format!("context:{scope}")
}

fn build_context_item_keys(kind: &str, keys: &[String]) -> Vec<(String, String)> {
    keys.iter()
        .filter(|key| !key.trim().is_empty())
        .map(|key| (format!("ctxitem:{kind}:{key}"), key.clone()))
        .collect()
}

fn clamp_limit(value: Option<f64>, default: i64) -> i64 {
    match value {
        Some(v) if v.is_finite() => (v.floor() as i64).max(1),
        _ => default,
    }
}

#[derive(Debug, Default)]
struct MessageDetail {
    preview: Option<String>,
    role: Option<String>,
    session_key: Option<String>,
    session_id: Option<String>,
    entry_id: Option<String>,
    text: Option<String>,
}

pub struct ContextManager {
    provider: Arc<dyn GraphProvider>,
    state_dir: PathBuf,
    max_doc_chars: usize,
}

impl ContextManager {
    pub fn new(provider: Arc<dyn GraphProvider>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            state_dir: state_dir.into(),
            max_doc_chars: DEFAULT_BOOTSTRAP_MAX_CHARS,
        }
    }

    pub fn with_max_doc_chars(mut self, max_doc_chars: usize) -> Self {
        self.max_doc_chars = max_doc_chars;
        self
    }

    /// Current members, most recent first.
    pub async fn get(&self, actor: &Actor, scope: &str) -> Result<Vec<ContextItem>> {
        let context_key = resolve_context_set_key(scope);
        let mut params = JsonObject::new();
        params.insert("scope".into(), json!(scope));
        params.insert("contextKey".into(), json!(context_key));
        let result = self
            .provider
            .query(
                actor,
                scope,
                "MATCH (cs:ContextSet { key: $contextKey, scope: $scope })-[:INCLUDES]->(ci:ContextItem) \
                 RETURN ci.key AS key, ci.kind AS kind, ci.refType AS refType, ci.refKey AS refKey, \
                 ci.createdAt AS createdAt ORDER BY ci.createdAt DESC",
                params,
                None,
            )
            .await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(Value::Object(row)).ok())
            .collect())
    }

    /// Apply adds then removes, creating the set node on first use.
    #[instrument(skip(self, patch), fields(scope = %scope))]
    pub async fn patch(&self, actor: &Actor, scope: &str, patch: &ContextPatch) -> Result<()> {
        let context_key = resolve_context_set_key(scope);
        let now = chrono::Utc::now().timestamp_millis();

        let mut params = JsonObject::new();
        params.insert("scope".into(), json!(scope));
        params.insert("contextKey".into(), json!(context_key));
        params.insert("now".into(), json!(now));
        params.insert("agentId".into(), json!(actor.agent_id()));
        self.provider
            .query(
                actor,
                scope,
                "MERGE (cs:ContextSet { key: $contextKey, scope: $scope }) \
                 SET cs.updatedAt = $now, cs.agentId = $agentId",
                params,
                None,
            )
            .await?;

        for (kind, keys) in [("node", &patch.add_nodes), ("message", &patch.add_messages)] {
            let items = build_context_item_keys(kind, keys);
            if items.is_empty() {
                continue;
            }
            let items_json: Vec<Value> = items
                .iter()
                .map(|(key, ref_key)| json!({ "key": key, "refKey": ref_key }))
                .collect();
            let mut params = JsonObject::new();
            params.insert("scope".into(), json!(scope));
            params.insert("contextKey".into(), json!(context_key));
            params.insert("items".into(), json!(items_json));
            params.insert("now".into(), json!(now));
            let statement = format!(
                "UNWIND $items AS item \
                 MERGE (ci:ContextItem {{ key: item.key, scope: $scope }}) \
                 SET ci.kind = '{kind}', ci.refType = '{kind}', ci.refKey = item.refKey, \
                 ci.createdAt = coalesce(ci.createdAt, $now), ci.updatedAt = $now \
                 WITH ci \
                 MATCH (cs:ContextSet {{ key: $contextKey, scope: $scope }}) \
                 MERGE (cs)-[:INCLUDES {{ scope: $scope }}]->(ci)"
            );
            self.provider.query(actor, scope, &statement, params, None).await?;
        }

        for (kind, keys) in [
            ("node", &patch.remove_nodes),
            ("message", &patch.remove_messages),
        ] {
            let items: Vec<String> = build_context_item_keys(kind, keys)
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            if items.is_empty() {
                continue;
            }
            let mut params = JsonObject::new();
            params.insert("scope".into(), json!(scope));
            params.insert("keys".into(), json!(items));
            self.provider
                .query(
                    actor,
                    scope,
                    "UNWIND $keys AS key \
                     MATCH (ci:ContextItem { key: key, scope: $scope }) DETACH DELETE ci",
                    params,
                    None,
                )
                .await?;
        }
        Ok(())
    }

    async fn list_ref_keys(
        &self,
        actor: &Actor,
        scope: &str,
        kind: &str,
        limit: i64,
    ) -> Result<Vec<String>> {
        let context_key = resolve_context_set_key(scope);
        let mut params = JsonObject::new();
        params.insert("scope".into(), json!(scope));
        params.insert("contextKey".into(), json!(context_key));
        params.insert("limit".into(), json!(limit));
        let statement = format!(
            "MATCH (cs:ContextSet {{ key: $contextKey, scope: $scope }})-[:INCLUDES]->\
             (ci:ContextItem {{ kind: '{kind}' }}) \
             RETURN ci.key AS key, ci.kind AS kind, ci.refType AS refType, ci.refKey AS refKey, \
             ci.createdAt AS createdAt \
             ORDER BY ci.createdAt DESC LIMIT $limit"
        );
        let result = self.provider.query(actor, scope, &statement, params, None).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| {
                row.get("refKey")
                    .and_then(Value::as_str)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
            })
            .collect())
    }

    async fn load_message_details(
        &self,
        actor: &Actor,
        scope: &str,
        message_keys: &[String],
    ) -> Result<HashMap<String, MessageDetail>> {
        if message_keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut params = JsonObject::new();
        params.insert("scope".into(), json!(scope));
        params.insert("keys".into(), json!(message_keys));
        let result = self
            .provider
            .query(
                actor,
                scope,
                "MATCH (m:Message { scope: $scope }) WHERE m.key IN $keys \
                 RETURN m.key AS key, m.preview AS preview, m.role AS role, \
                 m.sessionKey AS sessionKey, m.sessionId AS sessionId, m.entryId AS entryId",
                params,
                None,
            )
            .await?;

        let mut store_cache: HashMap<PathBuf, SessionStore> = HashMap::new();
        let mut details = HashMap::new();
        for row in result.rows {
            let Some(key) = row.get("key").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            let get = |field: &str| {
                row.get(field)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let mut detail = MessageDetail {
                preview: get("preview"),
                role: get("role"),
                session_key: get("sessionKey"),
                session_id: get("sessionId"),
                entry_id: get("entryId"),
                text: None,
            };
            if let (Some(session_key), Some(session_id)) =
                (detail.session_key.clone(), detail.session_id.clone())
            {
                detail.text = self.rehydrate_message_text(
                    &mut store_cache,
                    &session_key,
                    &session_id,
                    detail.entry_id.as_deref().unwrap_or(&key),
                );
            }
            details.insert(key, detail);
        }
        Ok(details)
    }

    /// Full text from the transcript line the message node points at. The
    /// session store is read once per store path within a materialize call.
    fn rehydrate_message_text(
        &self,
        store_cache: &mut HashMap<PathBuf, SessionStore>,
        session_key: &str,
        _session_id: &str,
        entry_id: &str,
    ) -> Option<String> {
        let agent_id = resolve_agent_id_from_session_key(session_key);
        let store_path = resolve_store_path(&self.state_dir, &agent_id);
        let store = store_cache
            .entry(store_path.clone())
            .or_insert_with(|| load_session_store(&store_path));
        let entry = store.get(session_key)?;
        let session_file = entry.session_file.as_deref()?;
        let line = read_message_by_entry_id(Path::new(session_file), entry_id)?;
        extract_text(line.message?.content.as_ref())
    }

    /// Markdown document for the scope's working set, or an empty string when
    /// there is nothing to show.
    #[instrument(skip(self, opts), fields(scope = %scope))]
    pub async fn materialize(
        &self,
        actor: &Actor,
        scope: &str,
        opts: &MaterializeOptions,
    ) -> Result<String> {
        let max_nodes = clamp_limit(opts.max_nodes, 20);
        let max_messages = clamp_limit(opts.max_messages, 10);

        let node_keys = self.list_ref_keys(actor, scope, "node", max_nodes).await?;
        let message_keys = self
            .list_ref_keys(actor, scope, "message", max_messages)
            .await?;
        let details = self
            .load_message_details(actor, scope, &message_keys)
            .await?;

        let mut lines = vec!["## KGM Context".to_string()];
        if !node_keys.is_empty() {
            lines.push(String::new());
            lines.push("### Nodes".to_string());
            lines.extend(node_keys.iter().map(|key| format!("- {key}")));
        }
        if !message_keys.is_empty() {
            lines.push(String::new());
            lines.push("### Messages".to_string());
            for key in &message_keys {
                lines.push(render_message_line(key, details.get(key)));
            }
        }

        let session_key = opts
            .session_key
            .clone()
            .or_else(|| actor.session_key().map(str::to_string));
        let agent_id = scope
            .split(':')
            .nth(1)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| actor.agent_id().map(str::to_string));
        let mut docs_included = false;
        if let Some(agent_id) = agent_id {
            match self
                .append_agent_docs(actor, scope, &agent_id, session_key.as_deref(), &mut lines)
                .await
            {
                Ok(included) => docs_included = included,
                Err(err) => debug!(error = %err, "agent docs ingestion skipped"),
            }
        }

        if node_keys.is_empty() && message_keys.is_empty() && !docs_included {
            return Ok(String::new());
        }
        Ok(lines.join("\n"))
    }

    async fn append_agent_docs(
        &self,
        actor: &Actor,
        scope: &str,
        agent_id: &str,
        session_key: Option<&str>,
        lines: &mut Vec<String>,
    ) -> Result<bool> {
        let workspace_dir = resolve_agent_workspace_dir(&self.state_dir, agent_id);
        let mut files = load_workspace_bootstrap_files(&workspace_dir);
        if let Some(session_key) = session_key {
            let agent_store =
                load_session_store(&resolve_store_path(&self.state_dir, agent_id));
            let entry = agent_store.get(session_key);
            if classify_session_key(session_key, entry) == "group" {
                files = filter_bootstrap_files_for_group(files);
            }
        }
        let docs = build_bootstrap_context_docs(&files, self.max_doc_chars);

        let included = !docs.is_empty();
        if included {
            lines.push(String::new());
            lines.push("### Agent Docs".to_string());
            for doc in &docs {
                lines.push(format!("#### {}", doc.path));
                lines.push(doc.content.clone());
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        for file in &files {
            let Some(content) = file.content.as_deref() else {
                continue;
            };
            if content.is_empty() {
                continue;
            }
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            let hash = hex::encode(hasher.finalize());
            let raw = docs
                .iter()
                .find(|doc| doc.path == file.name)
                .map(|doc| doc.content.clone())
                .unwrap_or_else(|| content.trim().to_string());
            let mut props = JsonObject::new();
            props.insert("agentId".into(), json!(agent_id));
            props.insert("docType".into(), json!(file.name));
            props.insert("hash".into(), json!(hash));
            props.insert("updatedAt".into(), json!(now));
            props.insert("sourcePath".into(), json!(file.path.display().to_string()));
            props.insert("size".into(), json!(content.len()));
            props.insert("raw".into(), json!(raw));
            self.provider
                .upsert_node(
                    actor,
                    scope,
                    "AgentDoc",
                    &format!("agentdoc:{}", file.name),
                    props,
                )
                .await?;
        }
        Ok(included)
    }
}

fn render_message_line(key: &str, detail: Option<&MessageDetail>) -> String {
    let Some(detail) = detail else {
        return format!("- {key}");
    };
    let raw = detail.text.as_deref().or(detail.preview.as_deref());
    let Some(raw) = raw else {
        return format!("- {key}");
    };
    let text = if raw.chars().count() > MAX_MATERIALIZED_MESSAGE_CHARS {
        let clipped: String = raw.chars().take(MAX_MATERIALIZED_MESSAGE_CHARS - 3).collect();
        format!("{clipped}...")
    } else {
        raw.to_string()
    };
    let role = detail
        .role
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default();
    let session = detail
        .session_key
        .as_deref()
        .map(|k| format!(" [{k}]"))
        .unwrap_or_default();
    format!("- {key}{role}{session}: {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_keys_are_deterministic_and_skip_blanks() {
        let items = build_context_item_keys(
            "node",
            &["node:a".to_string(), " ".to_string(), "node:b".to_string()],
        );
        assert_eq!(
            items,
            vec![
                ("ctxitem:node:node:a".to_string(), "node:a".to_string()),
                ("ctxitem:node:node:b".to_string(), "node:b".to_string()),
            ]
        );
    }

    #[test]
    fn limits_clamp_like_search() {
        assert_eq!(clamp_limit(Some(5.9), 20), 5);
        assert_eq!(clamp_limit(Some(0.0), 20), 1);
        assert_eq!(clamp_limit(Some(f64::NAN), 20), 20);
        assert_eq!(clamp_limit(None, 10), 10);
    }

    #[test]
    fn long_messages_are_truncated_with_ellipsis() {
        let detail = MessageDetail {
            text: Some("x".repeat(2000)),
            role: Some("user".into()),
            session_key: Some("agent:alpha:main".into()),
            ..MessageDetail::default()
        };
        let line = render_message_line("m1", Some(&detail));
        assert!(line.starts_with("- m1 (user) [agent:alpha:main]: "));
        assert!(line.ends_with("..."));
        let prefix = "- m1 (user) [agent:alpha:main]: ".len();
        assert_eq!(line.len() - prefix, MAX_MATERIALIZED_MESSAGE_CHARS);
    }

    #[test]
    fn preview_is_the_fallback_text() {
        let detail = MessageDetail {
            preview: Some("short preview".into()),
            ..MessageDetail::default()
        };
        assert_eq!(
            render_message_line("m1", Some(&detail)),
            "- m1: short preview"
        );
        assert_eq!(render_message_line("m2", None), "- m2");
    }
}
