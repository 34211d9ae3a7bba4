//! Memgraph-backed provider
//!
//! Wraps a [`GraphExecutor`] with the statement set the store relies on:
//! idempotent MERGE upserts, scoped search, access touches, and weight-based
//! garbage collection. Transient executor failures are retried with a short
//! linear backoff before surfacing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::decay::build_gc_query;
use crate::executor::{is_retryable_error, GraphExecutor, JsonObject};
use crate::provider::{
    EdgeRef, GcOutcome, GraphProvider, NodeRef, QueryResult, SchemaSnapshot, SearchHit,
};
use crate::rbac::Actor;
use crate::{KgmError, Result};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 150;

/// Integers beyond this magnitude lose precision as f64; they are carried as
/// decimal strings instead.
const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

fn normalize_value(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                    return Value::String(i.to_string());
                }
            }
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

pub(crate) fn normalize_rows(rows: Vec<JsonObject>) -> Vec<JsonObject> {
    rows.into_iter()
        .map(|row| match normalize_value(Value::Object(row)) {
            Value::Object(map) => map,
            _ => JsonObject::new(),
        })
        .collect()
}

fn build_search_statement(limit: Option<f64>) -> String {
    // LIMIT must be embedded as an integer literal; the engine rejects it
    // as a bound parameter.
    let limit = limit.unwrap_or(20.0).floor().max(1.0) as i64;
    format!(
        "MATCH (n {{ scope: $scope }}) \
         WHERE (n.key CONTAINS $query) OR (n.label IS NOT NULL AND n.label CONTAINS $query) \
         RETURN n.key AS key, labels(n)[0] AS label, n AS properties \
         LIMIT {limit}"
    )
}

fn string_or_json(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Provider over a live graph engine connection.
pub struct MemgraphProvider {
    executor: Arc<dyn GraphExecutor>,
    database: Option<String>,
}

impl MemgraphProvider {
    pub fn new(executor: Arc<dyn GraphExecutor>) -> Self {
        Self {
            executor,
            database: None,
        }
    }

    pub fn with_database(executor: Arc<dyn GraphExecutor>, database: Option<String>) -> Self {
        let database = database
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        Self { executor, database }
    }

    async fn run(
        &self,
        statement: &str,
        params: &JsonObject,
        database: Option<&str>,
    ) -> Result<Vec<JsonObject>> {
        let database = database.or(self.database.as_deref());
        let mut last_error: Option<KgmError> = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.executor.run(statement, params, database).await {
                Ok(rows) => return Ok(normalize_rows(rows)),
                Err(err) => {
                    let retryable =
                        matches!(&err, KgmError::Store(msg) if is_retryable_error(msg));
                    if !retryable || attempt == RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(attempt, error = %err, "transient graph error, retrying");
                    last_error = Some(err);
                    tokio::time::sleep(Duration::from_millis(
                        RETRY_BASE_DELAY_MS * u64::from(attempt),
                    ))
                    .await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| KgmError::Store("query retries exhausted".into())))
    }
}

#[async_trait::async_trait]
impl GraphProvider for MemgraphProvider {
    fn id(&self) -> &'static str {
        "memgraph"
    }

    #[instrument(skip(self, params), fields(scope = %scope))]
    async fn query(
        &self,
        _actor: &Actor,
        scope: &str,
        statement: &str,
        params: JsonObject,
        database: Option<&str>,
    ) -> Result<QueryResult> {
        let rows = self.run(statement, &params, database).await?;
        Ok(QueryResult { rows })
    }

    async fn ensure_schema(&self, _actor: &Actor, _scope: &str) -> Result<()> {
        // Schema lives in the registry scripts; nothing to do per-provider.
        Ok(())
    }

    #[instrument(skip(self, properties), fields(scope = %scope, label = %label, key = %key))]
    async fn upsert_node(
        &self,
        _actor: &Actor,
        scope: &str,
        label: &str,
        key: &str,
        properties: JsonObject,
    ) -> Result<NodeRef> {
        let now = chrono::Utc::now().timestamp_millis();
        let statement = format!(
            "MERGE (n:{label} {{ key: $key, scope: $scope }}) \
             SET n += $props, n.updatedAt = $now \
             RETURN n.key AS key"
        );
        let mut params = JsonObject::new();
        params.insert("key".into(), json!(key));
        params.insert("scope".into(), json!(scope));
        params.insert("props".into(), Value::Object(properties));
        params.insert("now".into(), json!(now));
        self.run(&statement, &params, None).await?;
        Ok(NodeRef::new(label, key))
    }

    #[instrument(skip(self, properties), fields(scope = %scope, edge_type = %edge_type))]
    async fn upsert_edge(
        &self,
        _actor: &Actor,
        scope: &str,
        edge_type: &str,
        from: &NodeRef,
        to: &NodeRef,
        properties: JsonObject,
    ) -> Result<EdgeRef> {
        let now = chrono::Utc::now().timestamp_millis();
        let statement = format!(
            "MATCH (a:{from_label} {{ key: $fromKey, scope: $scope }}) \
             MATCH (b:{to_label} {{ key: $toKey, scope: $scope }}) \
             MERGE (a)-[r:{edge_type} {{ scope: $scope }}]->(b) \
             SET r += $props, r.updatedAt = $now \
             RETURN type(r) AS type",
            from_label = from.label,
            to_label = to.label,
        );
        let mut params = JsonObject::new();
        params.insert("fromKey".into(), json!(from.key));
        params.insert("toKey".into(), json!(to.key));
        params.insert("scope".into(), json!(scope));
        params.insert("props".into(), Value::Object(properties));
        params.insert("now".into(), json!(now));
        self.run(&statement, &params, None).await?;
        Ok(EdgeRef {
            edge_type: edge_type.to_string(),
        })
    }

    #[instrument(skip(self), fields(scope = %scope))]
    async fn search(
        &self,
        _actor: &Actor,
        scope: &str,
        query: &str,
        limit: Option<f64>,
    ) -> Result<Vec<SearchHit>> {
        let statement = build_search_statement(limit);
        let mut params = JsonObject::new();
        params.insert("scope".into(), json!(scope));
        params.insert("query".into(), json!(query));
        let rows = self.run(&statement, &params, None).await?;
        debug!(hits = rows.len(), "search complete");
        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                key: string_or_json(row.get("key")),
                label: string_or_json(row.get("label")),
                score: None,
                properties: match row.get("properties") {
                    Some(Value::Object(map)) => Some(map.clone()),
                    _ => None,
                },
            })
            .collect())
    }

    #[instrument(skip(self, keys), fields(scope = %scope))]
    async fn touch(
        &self,
        _actor: &Actor,
        scope: &str,
        keys: &[String],
        now: Option<i64>,
    ) -> Result<()> {
        let keys: Vec<&String> = keys.iter().filter(|k| !k.trim().is_empty()).collect();
        if keys.is_empty() {
            return Ok(());
        }
        let now = now.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let statement = "MATCH (n { scope: $scope }) WHERE n.key IN $keys \
                         SET n.lastAccessAt = $now, n.accessCount = coalesce(n.accessCount, 0) + 1";
        let mut params = JsonObject::new();
        params.insert("scope".into(), json!(scope));
        params.insert("keys".into(), json!(keys));
        params.insert("now".into(), json!(now));
        self.run(statement, &params, None).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(scope = %scope))]
    async fn gc(
        &self,
        _actor: &Actor,
        scope: &str,
        min_weight: Option<f64>,
        max_nodes: Option<i64>,
        _now: Option<i64>,
    ) -> Result<GcOutcome> {
        let min_weight = min_weight.unwrap_or(0.01);
        let max_nodes = max_nodes.unwrap_or(5000).max(1);
        let gc = build_gc_query(scope, min_weight, max_nodes);
        let rows = self.run(gc.statement, &gc.params, None).await?;
        let removed = rows
            .first()
            .and_then(|row| row.get("removed"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        debug!(removed, "gc complete");
        Ok(GcOutcome { removed })
    }

    async fn describe_schema(&self, _actor: &Actor, _scope: &str) -> Result<SchemaSnapshot> {
        let params = JsonObject::new();
        match self.run("SHOW SCHEMA INFO", &params, None).await {
            Ok(rows) => Ok(SchemaSnapshot {
                observed: json!({ "rows": rows }),
            }),
            Err(err) => Ok(SchemaSnapshot {
                observed: json!({ "error": err.to_string() }),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_statement_embeds_literal_limit() {
        let statement = build_search_statement(Some(10.7));
        assert!(statement.ends_with("LIMIT 10"));
        assert!(!statement.contains("$limit"));
    }

    #[test]
    fn search_limit_clamps_to_one() {
        assert!(build_search_statement(Some(0.0)).ends_with("LIMIT 1"));
        assert!(build_search_statement(Some(-5.0)).ends_with("LIMIT 1"));
    }

    #[test]
    fn search_limit_defaults_to_twenty() {
        assert!(build_search_statement(None).ends_with("LIMIT 20"));
    }

    #[test]
    fn normalization_stringifies_unsafe_integers() {
        let mut row = JsonObject::new();
        row.insert("big".into(), json!(9_007_199_254_740_993i64));
        row.insert("nested".into(), json!({ "ok": 42, "huge": -9_100_000_000_000_000_000i64 }));
        let rows = normalize_rows(vec![row]);
        assert_eq!(rows[0]["big"], json!("9007199254740993"));
        assert_eq!(rows[0]["nested"]["ok"], json!(42));
        assert_eq!(rows[0]["nested"]["huge"], json!("-9100000000000000000"));
    }

    #[test]
    fn normalization_handles_i64_min() {
        let mut row = JsonObject::new();
        row.insert("min".into(), json!(i64::MIN));
        let rows = normalize_rows(vec![row]);
        assert_eq!(rows[0]["min"], json!(i64::MIN.to_string()));
    }
}
