//! In-memory graph executor for testing
//!
//! `MemoryGraphExecutor` interprets the finite statement set the crate emits
//! against a `Mutex`-guarded node/edge table, so provider and gateway flows
//! can run end to end without a live engine. Unknown statements error rather
//! than silently no-op.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::executor::{GraphExecutor, JsonObject};
use crate::{KgmError, Result};

#[derive(Debug, Clone)]
struct FakeNode {
    label: String,
    key: String,
    scope: String,
    props: JsonObject,
}

impl FakeNode {
    /// Property map as the engine would return it for `n AS node`.
    fn as_map(&self) -> JsonObject {
        let mut map = self.props.clone();
        map.insert("key".into(), json!(self.key));
        map.insert("scope".into(), json!(self.scope));
        map
    }
}

#[derive(Debug, Clone)]
struct FakeEdge {
    edge_type: String,
    from_key: String,
    to_key: String,
    scope: String,
    props: JsonObject,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: Vec<FakeNode>,
    edges: Vec<FakeEdge>,
    applied_ddl: HashSet<String>,
    fail_next: VecDeque<String>,
    schema_info_error: Option<String>,
    statements: Vec<String>,
}

/// Identifier token immediately following `marker` in the statement.
fn token_after(statement: &str, marker: &str) -> Option<String> {
    let rest = &statement[statement.find(marker)? + marker.len()..];
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn param_str<'a>(params: &'a JsonObject, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

fn param_i64(params: &JsonObject, name: &str) -> Option<i64> {
    params.get(name).and_then(Value::as_i64)
}

fn param_keys(params: &JsonObject, name: &str) -> Vec<String> {
    params
        .get(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn is_pinned(props: &JsonObject) -> bool {
    match props.get("pinnedAt") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

fn created_at(props: &JsonObject) -> i64 {
    props.get("createdAt").and_then(Value::as_i64).unwrap_or(0)
}

/// In-memory stand-in for the graph engine.
#[derive(Debug, Default)]
pub struct MemoryGraphExecutor {
    state: Mutex<GraphState>,
}

impl MemoryGraphExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next call; each queued message fails exactly
    /// one statement before execution.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_next.push_back(message.into());
    }

    /// Make `SHOW SCHEMA INFO` fail with the given message.
    pub fn set_schema_info_error(&self, message: impl Into<String>) {
        self.state.lock().unwrap().schema_info_error = Some(message.into());
    }

    /// Stored node `(label, properties)` if present.
    pub fn node(&self, scope: &str, key: &str) -> Option<(String, JsonObject)> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|n| n.scope == scope && n.key == key)
            .map(|n| (n.label.clone(), n.as_map()))
    }

    pub fn node_count(&self, scope: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.nodes.iter().filter(|n| n.scope == scope).count()
    }

    /// Stored edges in a scope as `(type, fromKey, toKey)`.
    pub fn edges(&self, scope: &str) -> Vec<(String, String, String)> {
        let state = self.state.lock().unwrap();
        state
            .edges
            .iter()
            .filter(|e| e.scope == scope)
            .map(|e| (e.edge_type.clone(), e.from_key.clone(), e.to_key.clone()))
            .collect()
    }

    /// Statements run so far, in order.
    pub fn statement_log(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    fn upsert_node(
        state: &mut GraphState,
        label: &str,
        key: &str,
        scope: &str,
        props: JsonObject,
        now: Option<i64>,
    ) {
        let existing = state
            .nodes
            .iter_mut()
            .find(|n| n.label == label && n.key == key && n.scope == scope);
        match existing {
            Some(node) => {
                for (k, v) in props {
                    node.props.insert(k, v);
                }
                if let Some(now) = now {
                    node.props.insert("updatedAt".into(), json!(now));
                }
            }
            None => {
                let mut props = props;
                if let Some(now) = now {
                    props.insert("updatedAt".into(), json!(now));
                }
                state.nodes.push(FakeNode {
                    label: label.to_string(),
                    key: key.to_string(),
                    scope: scope.to_string(),
                    props,
                });
            }
        }
    }

    fn upsert_edge(
        state: &mut GraphState,
        edge_type: &str,
        from_key: &str,
        to_key: &str,
        scope: &str,
        props: JsonObject,
    ) {
        let existing = state.edges.iter_mut().find(|e| {
            e.edge_type == edge_type
                && e.from_key == from_key
                && e.to_key == to_key
                && e.scope == scope
        });
        match existing {
            Some(edge) => {
                for (k, v) in props {
                    edge.props.insert(k, v);
                }
            }
            None => state.edges.push(FakeEdge {
                edge_type: edge_type.to_string(),
                from_key: from_key.to_string(),
                to_key: to_key.to_string(),
                scope: scope.to_string(),
                props,
            }),
        }
    }

    fn run_statement(
        &self,
        statement: &str,
        params: &JsonObject,
    ) -> Result<Vec<JsonObject>> {
        let mut state = self.state.lock().unwrap();
        state.statements.push(statement.to_string());
        if let Some(message) = state.fail_next.pop_front() {
            return Err(KgmError::Store(message));
        }

        if statement.contains("RETURN 1 as ping") {
            let mut row = JsonObject::new();
            row.insert("ping".into(), json!(1));
            return Ok(vec![row]);
        }

        if statement.contains("SHOW SCHEMA INFO") {
            if let Some(message) = &state.schema_info_error {
                return Err(KgmError::Store(message.clone()));
            }
            let mut labels: Vec<&str> = state.nodes.iter().map(|n| n.label.as_str()).collect();
            labels.sort_unstable();
            labels.dedup();
            return Ok(labels
                .into_iter()
                .map(|label| {
                    let mut row = JsonObject::new();
                    row.insert("label".into(), json!(label));
                    row
                })
                .collect());
        }

        if statement.starts_with("CREATE CONSTRAINT") || statement.starts_with("CREATE INDEX") {
            if !state.applied_ddl.insert(statement.to_string()) {
                return Err(KgmError::Store(format!("{statement}: already exists")));
            }
            return Ok(Vec::new());
        }

        // Context-item batches.
        if statement.starts_with("UNWIND $items") {
            let scope = param_str(params, "scope").unwrap_or_default().to_string();
            let context_key = param_str(params, "contextKey").unwrap_or_default().to_string();
            let now = param_i64(params, "now");
            let kind = if statement.contains("ci.kind = 'message'") {
                "message"
            } else {
                "node"
            };
            let set_exists = state
                .nodes
                .iter()
                .any(|n| n.label == "ContextSet" && n.key == context_key && n.scope == scope);
            let items: Vec<(String, String)> = params
                .get("items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| {
                            let key = item.get("key")?.as_str()?.to_string();
                            let ref_key = item.get("refKey")?.as_str()?.to_string();
                            Some((key, ref_key))
                        })
                        .collect()
                })
                .unwrap_or_default();
            for (key, ref_key) in items {
                let already = state
                    .nodes
                    .iter()
                    .any(|n| n.label == "ContextItem" && n.key == key && n.scope == scope);
                let mut props = JsonObject::new();
                props.insert("kind".into(), json!(kind));
                props.insert("refType".into(), json!(kind));
                props.insert("refKey".into(), json!(ref_key));
                if !already {
                    props.insert("createdAt".into(), json!(now));
                }
                Self::upsert_node(&mut state, "ContextItem", &key, &scope, props, now);
                if set_exists {
                    Self::upsert_edge(
                        &mut state,
                        "INCLUDES",
                        &context_key,
                        &key,
                        &scope,
                        JsonObject::new(),
                    );
                }
            }
            return Ok(Vec::new());
        }

        if statement.starts_with("UNWIND $keys") && statement.contains("DETACH DELETE ci") {
            let scope = param_str(params, "scope").unwrap_or_default().to_string();
            let keys: HashSet<String> = param_keys(params, "keys").into_iter().collect();
            state.nodes.retain(|n| {
                !(n.label == "ContextItem" && n.scope == scope && keys.contains(&n.key))
            });
            state
                .edges
                .retain(|e| !(e.scope == scope && keys.contains(&e.to_key)));
            return Ok(Vec::new());
        }

        if statement.starts_with("MERGE (cs:ContextSet") {
            let scope = param_str(params, "scope").unwrap_or_default().to_string();
            let key = param_str(params, "contextKey").unwrap_or_default().to_string();
            let now = param_i64(params, "now");
            let mut props = JsonObject::new();
            if let Some(agent_id) = params.get("agentId") {
                props.insert("agentId".into(), agent_id.clone());
            }
            Self::upsert_node(&mut state, "ContextSet", &key, &scope, props, now);
            return Ok(Vec::new());
        }

        // Generic node MERGE.
        if statement.starts_with("MERGE (n:") {
            let label = token_after(statement, "MERGE (n:")
                .ok_or_else(|| KgmError::Store(format!("bad merge statement: {statement}")))?;
            let scope = param_str(params, "scope").unwrap_or_default().to_string();
            let key = param_str(params, "key").unwrap_or_default().to_string();
            let now = param_i64(params, "now");
            let props = match params.get("props") {
                Some(Value::Object(map)) => map.clone(),
                _ => JsonObject::new(),
            };
            Self::upsert_node(&mut state, &label, &key, &scope, props, now);
            let mut row = JsonObject::new();
            row.insert("key".into(), json!(key));
            return Ok(vec![row]);
        }

        // Edge MERGE between two matched nodes.
        if statement.starts_with("MATCH (a:") && statement.contains("MERGE (a)-[r:") {
            let from_label = token_after(statement, "MATCH (a:")
                .ok_or_else(|| KgmError::Store(format!("bad edge statement: {statement}")))?;
            let to_label = token_after(statement, "MATCH (b:")
                .ok_or_else(|| KgmError::Store(format!("bad edge statement: {statement}")))?;
            let edge_type = token_after(statement, "MERGE (a)-[r:")
                .ok_or_else(|| KgmError::Store(format!("bad edge statement: {statement}")))?;
            let scope = param_str(params, "scope").unwrap_or_default().to_string();
            let from_key = param_str(params, "fromKey").unwrap_or_default().to_string();
            let to_key = param_str(params, "toKey").unwrap_or_default().to_string();
            let from_exists = state
                .nodes
                .iter()
                .any(|n| n.label == from_label && n.key == from_key && n.scope == scope);
            let to_exists = state
                .nodes
                .iter()
                .any(|n| n.label == to_label && n.key == to_key && n.scope == scope);
            if !from_exists || !to_exists {
                return Ok(Vec::new());
            }
            let mut props = match params.get("props") {
                Some(Value::Object(map)) => map.clone(),
                _ => JsonObject::new(),
            };
            if let Some(now) = param_i64(params, "now") {
                props.insert("updatedAt".into(), json!(now));
            }
            Self::upsert_edge(&mut state, &edge_type, &from_key, &to_key, &scope, props);
            let mut row = JsonObject::new();
            row.insert("type".into(), json!(edge_type));
            return Ok(vec![row]);
        }

        // Context-set membership listing.
        if statement.contains("-[:INCLUDES]->") && statement.contains("RETURN ci.key") {
            let scope = param_str(params, "scope").unwrap_or_default();
            let context_key = param_str(params, "contextKey").unwrap_or_default();
            let kind_filter = if statement.contains("{ kind: 'node' }") {
                Some("node")
            } else if statement.contains("{ kind: 'message' }") {
                Some("message")
            } else {
                None
            };
            let member_keys: HashSet<&str> = state
                .edges
                .iter()
                .filter(|e| {
                    e.edge_type == "INCLUDES" && e.scope == scope && e.from_key == context_key
                })
                .map(|e| e.to_key.as_str())
                .collect();
            let mut items: Vec<&FakeNode> = state
                .nodes
                .iter()
                .filter(|n| {
                    n.label == "ContextItem"
                        && n.scope == scope
                        && member_keys.contains(n.key.as_str())
                        && kind_filter
                            .map(|kind| n.props.get("kind") == Some(&json!(kind)))
                            .unwrap_or(true)
                })
                .collect();
            items.sort_by_key(|n| std::cmp::Reverse(created_at(&n.props)));
            if statement.contains("LIMIT $limit") {
                if let Some(limit) = param_i64(params, "limit") {
                    items.truncate(limit.max(0) as usize);
                }
            }
            return Ok(items
                .into_iter()
                .map(|n| {
                    let mut row = JsonObject::new();
                    row.insert("key".into(), json!(n.key));
                    row.insert("kind".into(), n.props.get("kind").cloned().unwrap_or(Value::Null));
                    row.insert(
                        "refType".into(),
                        n.props.get("refType").cloned().unwrap_or(Value::Null),
                    );
                    row.insert(
                        "refKey".into(),
                        n.props.get("refKey").cloned().unwrap_or(Value::Null),
                    );
                    row.insert(
                        "createdAt".into(),
                        n.props.get("createdAt").cloned().unwrap_or(Value::Null),
                    );
                    row
                })
                .collect());
        }

        // Message detail lookup.
        if statement.starts_with("MATCH (m:Message") {
            let scope = param_str(params, "scope").unwrap_or_default();
            let keys: HashSet<String> = param_keys(params, "keys").into_iter().collect();
            return Ok(state
                .nodes
                .iter()
                .filter(|n| n.label == "Message" && n.scope == scope && keys.contains(&n.key))
                .map(|n| {
                    let mut row = JsonObject::new();
                    row.insert("key".into(), json!(n.key));
                    for field in ["preview", "role", "sessionKey", "sessionId", "entryId"] {
                        row.insert(
                            field.into(),
                            n.props.get(field).cloned().unwrap_or(Value::Null),
                        );
                    }
                    row
                })
                .collect());
        }

        // Schema registry join.
        if statement.starts_with("MATCH (g:GraphSchema") {
            let admin_scope = param_str(params, "adminScope").unwrap_or_default();
            let scope_id = param_str(params, "scopeId").unwrap_or_default();
            let scope_node_key = state
                .nodes
                .iter()
                .find(|n| {
                    n.label == "Scope"
                        && n.scope == admin_scope
                        && n.props.get("id") == Some(&json!(scope_id))
                })
                .map(|n| n.key.clone());
            let Some(scope_node_key) = scope_node_key else {
                return Ok(Vec::new());
            };
            let schema_keys: HashSet<&str> = state
                .edges
                .iter()
                .filter(|e| {
                    e.edge_type == "APPLIES_TO"
                        && e.scope == admin_scope
                        && e.to_key == scope_node_key
                })
                .map(|e| e.from_key.as_str())
                .collect();
            return Ok(state
                .nodes
                .iter()
                .filter(|n| {
                    n.label == "GraphSchema"
                        && n.scope == admin_scope
                        && schema_keys.contains(n.key.as_str())
                })
                .map(|n| {
                    let mut row = JsonObject::new();
                    for field in ["name", "version", "hash", "appliesToKind", "path"] {
                        row.insert(
                            field.into(),
                            n.props.get(field).cloned().unwrap_or(Value::Null),
                        );
                    }
                    row
                })
                .collect());
        }

        // Agent mirror read.
        if statement.starts_with("MATCH (a:Agent") {
            let scope = param_str(params, "scope").unwrap_or_default();
            let mut rows: Vec<JsonObject> = state
                .nodes
                .iter()
                .filter(|n| n.label == "Agent" && n.scope == scope)
                .map(|n| {
                    let mut row = JsonObject::new();
                    for field in ["id", "name", "identity"] {
                        row.insert(
                            field.into(),
                            n.props.get(field).cloned().unwrap_or(Value::Null),
                        );
                    }
                    row
                })
                .collect();
            rows.sort_by_key(|row| {
                row.get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            });
            return Ok(rows);
        }

        // Node mirror read.
        if statement.starts_with("MATCH (n:Node") {
            let scope = param_str(params, "scope").unwrap_or_default();
            return Ok(state
                .nodes
                .iter()
                .filter(|n| n.label == "Node" && n.scope == scope)
                .map(|n| {
                    let mut row = JsonObject::new();
                    row.insert("node".into(), Value::Object(n.as_map()));
                    row
                })
                .collect());
        }

        // Pin / unpin.
        if statement.contains("SET n.pinnedAt = $pinnedAt") {
            let scope = param_str(params, "scope").unwrap_or_default().to_string();
            let key = param_str(params, "key").unwrap_or_default().to_string();
            let pinned_at = params.get("pinnedAt").cloned().unwrap_or(Value::Null);
            let node = state
                .nodes
                .iter_mut()
                .find(|n| n.scope == scope && n.key == key);
            return Ok(match node {
                Some(node) => {
                    if pinned_at.is_null() {
                        node.props.remove("pinnedAt");
                    } else {
                        node.props.insert("pinnedAt".into(), pinned_at);
                    }
                    let mut row = JsonObject::new();
                    row.insert("key".into(), json!(node.key));
                    vec![row]
                }
                None => Vec::new(),
            });
        }

        // Single-node lookup.
        if statement.contains("scope: $scope, key: $key") {
            let scope = param_str(params, "scope").unwrap_or_default();
            let key = param_str(params, "key").unwrap_or_default();
            return Ok(state
                .nodes
                .iter()
                .filter(|n| n.scope == scope && n.key == key)
                .take(1)
                .map(|n| {
                    let mut row = JsonObject::new();
                    row.insert("label".into(), json!(n.label));
                    row.insert("node".into(), Value::Object(n.as_map()));
                    row
                })
                .collect());
        }

        // Access touch.
        if statement.contains("SET n.lastAccessAt = $now") {
            let scope = param_str(params, "scope").unwrap_or_default().to_string();
            let keys: HashSet<String> = param_keys(params, "keys").into_iter().collect();
            let now = param_i64(params, "now");
            for node in state
                .nodes
                .iter_mut()
                .filter(|n| n.scope == scope && keys.contains(&n.key))
            {
                node.props.insert("lastAccessAt".into(), json!(now));
                let count = node
                    .props
                    .get("accessCount")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                node.props.insert("accessCount".into(), json!(count + 1));
            }
            return Ok(Vec::new());
        }

        // Weight-floor GC.
        if statement.contains("DETACH DELETE n RETURN count(*) AS removed") {
            let scope = param_str(params, "scope").unwrap_or_default().to_string();
            let min_weight = params
                .get("minWeight")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let limit = param_i64(params, "limit").unwrap_or(i64::MAX).max(0) as usize;
            let doomed: Vec<String> = state
                .nodes
                .iter()
                .filter(|n| {
                    n.scope == scope
                        && n.props
                            .get("weight")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0)
                            < min_weight
                        && !is_pinned(&n.props)
                })
                .take(limit)
                .map(|n| n.key.clone())
                .collect();
            let removed = doomed.len() as i64;
            let doomed: HashSet<String> = doomed.into_iter().collect();
            state
                .nodes
                .retain(|n| !(n.scope == scope && doomed.contains(&n.key)));
            state.edges.retain(|e| {
                !(e.scope == scope && (doomed.contains(&e.from_key) || doomed.contains(&e.to_key)))
            });
            let mut row = JsonObject::new();
            row.insert("removed".into(), json!(removed));
            return Ok(vec![row]);
        }

        // Substring search with a literal LIMIT.
        if statement.contains("CONTAINS $query") {
            let scope = param_str(params, "scope").unwrap_or_default();
            let query = param_str(params, "query").unwrap_or_default();
            let limit = statement
                .rsplit("LIMIT ")
                .next()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(usize::MAX);
            return Ok(state
                .nodes
                .iter()
                .filter(|n| {
                    n.scope == scope
                        && (n.key.contains(query)
                            || n.props
                                .get("label")
                                .and_then(Value::as_str)
                                .map(|l| l.contains(query))
                                .unwrap_or(false))
                })
                .take(limit)
                .map(|n| {
                    let mut row = JsonObject::new();
                    row.insert("key".into(), json!(n.key));
                    row.insert("label".into(), json!(n.label));
                    row.insert("properties".into(), Value::Object(n.as_map()));
                    row
                })
                .collect());
        }

        Err(KgmError::Store(format!(
            "unsupported statement: {statement}"
        )))
    }
}

#[async_trait]
impl GraphExecutor for MemoryGraphExecutor {
    async fn run(
        &self,
        statement: &str,
        params: &JsonObject,
        _database: Option<&str>,
    ) -> Result<Vec<JsonObject>> {
        self.run_statement(statement, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_is_idempotent() {
        let executor = MemoryGraphExecutor::new();
        let statement =
            "MERGE (n:Node { key: $key, scope: $scope }) SET n += $props, n.updatedAt = $now RETURN n.key AS key";
        let mut params = JsonObject::new();
        params.insert("key".into(), json!("node:a"));
        params.insert("scope".into(), json!("agent:alpha"));
        params.insert("props".into(), json!({ "label": "Alpha" }));
        params.insert("now".into(), json!(1));
        executor.run(statement, &params, None).await.unwrap();
        executor.run(statement, &params, None).await.unwrap();
        assert_eq!(executor.node_count("agent:alpha"), 1);
    }

    #[tokio::test]
    async fn edge_merge_requires_both_endpoints() {
        let executor = MemoryGraphExecutor::new();
        let statement = "MATCH (a:Node { key: $fromKey, scope: $scope }) \
                         MATCH (b:Node { key: $toKey, scope: $scope }) \
                         MERGE (a)-[r:RELATES { scope: $scope }]->(b) \
                         SET r += $props, r.updatedAt = $now RETURN type(r) AS type";
        let mut params = JsonObject::new();
        params.insert("fromKey".into(), json!("node:a"));
        params.insert("toKey".into(), json!("node:b"));
        params.insert("scope".into(), json!("agent:alpha"));
        params.insert("props".into(), json!({}));
        params.insert("now".into(), json!(1));
        let rows = executor.run(statement, &params, None).await.unwrap();
        assert!(rows.is_empty());
        assert!(executor.edges("agent:alpha").is_empty());
    }

    #[tokio::test]
    async fn repeated_ddl_reports_already_exists() {
        let executor = MemoryGraphExecutor::new();
        let params = JsonObject::new();
        let ddl = "CREATE INDEX ON :Node(key)";
        executor.run(ddl, &params, None).await.unwrap();
        let err = executor.run(ddl, &params, None).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn queued_failures_fire_once() {
        let executor = MemoryGraphExecutor::new();
        executor.push_failure("connection reset by peer");
        let params = JsonObject::new();
        assert!(executor.run("RETURN 1 as ping", &params, None).await.is_err());
        assert!(executor.run("RETURN 1 as ping", &params, None).await.is_ok());
    }
}
