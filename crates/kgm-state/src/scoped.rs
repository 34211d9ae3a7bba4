//! Scope-enforcing provider wrapper
//!
//! Every call checks the actor against the target scope before delegating.
//! Agents may only touch their own `agent:<id>` scope; operators and system
//! actors pass through.

use std::sync::Arc;

use tracing::warn;

use crate::executor::JsonObject;
use crate::provider::{
    EdgeRef, GcOutcome, GraphProvider, NodeRef, QueryResult, SchemaSnapshot, SearchHit,
};
use crate::rbac::{is_scope_allowed, Actor};
use crate::{KgmError, Result};

pub struct ScopedProvider {
    inner: Arc<dyn GraphProvider>,
}

impl ScopedProvider {
    pub fn new(inner: Arc<dyn GraphProvider>) -> Self {
        Self { inner }
    }

    fn check(&self, actor: &Actor, scope: &str) -> Result<()> {
        if is_scope_allowed(actor, scope) {
            return Ok(());
        }
        warn!(scope = %scope, "scope denied");
        Err(KgmError::ScopeNotAllowed(scope.to_string()))
    }
}

#[async_trait::async_trait]
impl GraphProvider for ScopedProvider {
    fn id(&self) -> &'static str {
        self.inner.id()
    }

    async fn query(
        &self,
        actor: &Actor,
        scope: &str,
        statement: &str,
        params: JsonObject,
        database: Option<&str>,
    ) -> Result<QueryResult> {
        self.check(actor, scope)?;
        self.inner.query(actor, scope, statement, params, database).await
    }

    async fn ensure_schema(&self, actor: &Actor, scope: &str) -> Result<()> {
        self.check(actor, scope)?;
        self.inner.ensure_schema(actor, scope).await
    }

    async fn upsert_node(
        &self,
        actor: &Actor,
        scope: &str,
        label: &str,
        key: &str,
        properties: JsonObject,
    ) -> Result<NodeRef> {
        self.check(actor, scope)?;
        self.inner.upsert_node(actor, scope, label, key, properties).await
    }

    async fn upsert_edge(
        &self,
        actor: &Actor,
        scope: &str,
        edge_type: &str,
        from: &NodeRef,
        to: &NodeRef,
        properties: JsonObject,
    ) -> Result<EdgeRef> {
        self.check(actor, scope)?;
        self.inner
            .upsert_edge(actor, scope, edge_type, from, to, properties)
            .await
    }

    async fn search(
        &self,
        actor: &Actor,
        scope: &str,
        query: &str,
        limit: Option<f64>,
    ) -> Result<Vec<SearchHit>> {
        self.check(actor, scope)?;
        self.inner.search(actor, scope, query, limit).await
    }

    async fn touch(
        &self,
        actor: &Actor,
        scope: &str,
        keys: &[String],
        now: Option<i64>,
    ) -> Result<()> {
        self.check(actor, scope)?;
        self.inner.touch(actor, scope, keys, now).await
    }

    async fn gc(
        &self,
        actor: &Actor,
        scope: &str,
        min_weight: Option<f64>,
        max_nodes: Option<i64>,
        now: Option<i64>,
    ) -> Result<GcOutcome> {
        self.check(actor, scope)?;
        self.inner.gc(actor, scope, min_weight, max_nodes, now).await
    }

    async fn describe_schema(&self, actor: &Actor, scope: &str) -> Result<SchemaSnapshot> {
        self.check(actor, scope)?;
        self.inner.describe_schema(actor, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryGraphExecutor;
    use crate::memgraph::MemgraphProvider;

    fn scoped() -> ScopedProvider {
        let executor = Arc::new(MemoryGraphExecutor::new());
        ScopedProvider::new(Arc::new(MemgraphProvider::new(executor)))
    }

    #[tokio::test]
    async fn agent_cannot_write_foreign_scope() {
        let provider = scoped();
        let actor = Actor::agent("alpha");
        let err = provider
            .upsert_node(&actor, "agent:beta", "Node", "node:x", JsonObject::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KgmError::ScopeNotAllowed(_)));
    }

    #[tokio::test]
    async fn agent_writes_own_scope() {
        let provider = scoped();
        let actor = Actor::agent("alpha");
        let node = provider
            .upsert_node(&actor, "agent:alpha", "Node", "node:x", JsonObject::new())
            .await
            .unwrap();
        assert_eq!(node.key, "node:x");
    }

    #[tokio::test]
    async fn operator_reaches_any_scope() {
        let provider = scoped();
        let actor = Actor::Operator;
        assert!(provider
            .search(&actor, "agent:alpha", "anything", None)
            .await
            .is_ok());
        assert!(provider.search(&actor, "admin", "anything", None).await.is_ok());
    }
}
