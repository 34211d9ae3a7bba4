//! Graph provider trait and result types
//!
//! Every method takes the acting identity and the target scope; scope
//! enforcement is layered on by [`crate::ScopedProvider`]. Implementations
//! must keep upserts idempotent: repeated calls with the same identity leave
//! exactly one node/edge with the latest properties.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::executor::JsonObject;
use crate::rbac::Actor;
use crate::Result;

/// Reference to a stored node, `(label, key)` within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub key: String,
    pub label: String,
}

impl NodeRef {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
        }
    }
}

/// Reference to a stored edge by relationship type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRef {
    #[serde(rename = "type")]
    pub edge_type: String,
}

/// Rows returned from a raw statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<JsonObject>,
}

/// One search match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<JsonObject>,
}

/// Outcome of one bounded GC run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcOutcome {
    pub removed: i64,
}

/// Best-effort view of the engine's live schema metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub observed: serde_json::Value,
}

/// The abstraction over the backing graph store.
#[async_trait]
pub trait GraphProvider: Send + Sync {
    /// Stable provider identifier (e.g. `"memgraph"`).
    fn id(&self) -> &'static str;

    /// Run a raw statement with bound parameters.
    async fn query(
        &self,
        actor: &Actor,
        scope: &str,
        statement: &str,
        params: JsonObject,
        database: Option<&str>,
    ) -> Result<QueryResult>;

    /// Provider-level schema hook; registry-driven setups make this a no-op.
    async fn ensure_schema(&self, actor: &Actor, scope: &str) -> Result<()>;

    /// Merge a node on `(label, key, scope)` and overwrite its properties.
    async fn upsert_node(
        &self,
        actor: &Actor,
        scope: &str,
        label: &str,
        key: &str,
        properties: JsonObject,
    ) -> Result<NodeRef>;

    /// Merge an edge on `(type, from, to, scope)` and overwrite its properties.
    async fn upsert_edge(
        &self,
        actor: &Actor,
        scope: &str,
        edge_type: &str,
        from: &NodeRef,
        to: &NodeRef,
        properties: JsonObject,
    ) -> Result<EdgeRef>;

    /// Case-sensitive substring search over key and label within the scope.
    async fn search(
        &self,
        actor: &Actor,
        scope: &str,
        query: &str,
        limit: Option<f64>,
    ) -> Result<Vec<SearchHit>>;

    /// Mark nodes as accessed: set `lastAccessAt`, bump `accessCount`.
    async fn touch(&self, actor: &Actor, scope: &str, keys: &[String], now: Option<i64>)
        -> Result<()>;

    /// Remove up to `max_nodes` unpinned nodes below the weight floor.
    async fn gc(
        &self,
        actor: &Actor,
        scope: &str,
        min_weight: Option<f64>,
        max_nodes: Option<i64>,
        now: Option<i64>,
    ) -> Result<GcOutcome>;

    /// Best-effort engine schema introspection; never fails.
    async fn describe_schema(&self, actor: &Actor, scope: &str) -> Result<SchemaSnapshot>;
}

impl std::fmt::Debug for dyn GraphProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphProvider").field("id", &self.id()).finish()
    }
}
