//! RPC operation surface
//!
//! One async function per method, over typed params. Transport framing and
//! request validation live outside this crate. Every agent-facing operation
//! resolves the actor from the session key, derives the target scope, and
//! rejects missing or foreign scopes before touching the store.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use kgm_state::schema_registry::{
    describe_schema, ensure_admin_schema, ensure_agent_schema, SchemaDescription,
};
use kgm_state::{
    is_scope_allowed, resolve_actor_scope, resolve_admin_scope, resolve_agent_scope, Actor,
    EdgeRef, GraphProvider, JsonObject, KgmError, NodeRef, Result, SearchHit,
};

use crate::config::KgmConfig;
use crate::context::{ContextItem, ContextManager, ContextPatch, MaterializeOptions};
use crate::registry::ProviderRegistry;
use crate::sessions::resolve_agent_id_from_session_key;

/// Caller identity and scope selection shared by agent-facing operations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallerParams {
    pub session_key: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStatus {
    pub ok: bool,
    pub enabled: bool,
    pub mode: String,
    pub provider: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResult {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescribeResult {
    pub expected_schema: ExpectedSchema,
    pub observed_schema: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedSchema {
    pub script: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    pub query: String,
    pub limit: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PutNodeParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    pub label: String,
    pub key: String,
    pub properties: Option<JsonObject>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PutEdgeParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub from_key: String,
    pub from_label: String,
    pub to_key: String,
    pub to_label: String,
    pub properties: Option<JsonObject>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PinParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    pub key: String,
    pub pinned: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TouchParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    pub min_weight: Option<f64>,
    pub max_nodes: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextPatchParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    #[serde(flatten)]
    pub patch: ContextPatch,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaterializeParams {
    #[serde(flatten)]
    pub caller: CallerParams,
    pub max_nodes: Option<f64>,
    pub max_messages: Option<f64>,
}

/// The gateway's KGM service: provider registry plus state-dir wiring.
pub struct KgmService {
    registry: ProviderRegistry,
    state_dir: PathBuf,
}

fn resolve_actor(session_key: Option<&str>) -> Actor {
    match session_key.map(str::trim).filter(|key| !key.is_empty()) {
        Some(key) => Actor::Agent {
            agent_id: resolve_agent_id_from_session_key(key),
            session_key: Some(key.to_string()),
        },
        None => Actor::Operator,
    }
}

fn resolve_checked_scope(actor: &Actor, requested: Option<&str>) -> Result<String> {
    let scope = resolve_actor_scope(actor, requested)
        .ok_or_else(|| KgmError::InvalidRequest("scope required".into()))?;
    if !is_scope_allowed(actor, &scope) {
        return Err(KgmError::ScopeNotAllowed(scope));
    }
    Ok(scope)
}

impl KgmService {
    pub fn new(registry: ProviderRegistry, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            state_dir: state_dir.into(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn context_manager(&self, provider: Arc<dyn GraphProvider>) -> ContextManager {
        ContextManager::new(provider, self.state_dir.clone())
    }

    /// Enabled flag, mode, and a ping-derived connection check.
    pub async fn admin_status(&self, cfg: &KgmConfig) -> Result<AdminStatus> {
        let provider = self.registry.resolve(cfg)?;
        let mode = serde_json::to_value(cfg.resolve_mode())?
            .as_str()
            .unwrap_or("fs+kgm")
            .to_string();
        let (mut connected, mut error) = (false, None);
        if let Some(provider) = &provider {
            match provider
                .query(
                    &Actor::Operator,
                    &resolve_admin_scope(),
                    "RETURN 1 as ping",
                    JsonObject::new(),
                    None,
                )
                .await
            {
                Ok(_) => connected = true,
                Err(err) => error = Some(err.to_string()),
            }
        }
        Ok(AdminStatus {
            ok: true,
            enabled: cfg.enabled,
            mode,
            provider: provider
                .as_ref()
                .map(|p| p.id().to_string())
                .unwrap_or_else(|| "none".to_string()),
            connected,
            error,
        })
    }

    /// Apply admin schema scripts and registry records.
    pub async fn admin_init(&self, cfg: &KgmConfig) -> Result<()> {
        let provider = self.registry.require(cfg)?;
        ensure_admin_schema(provider.as_ref(), &Actor::Operator).await
    }

    /// Prepare one agent's partition. Returns its scope.
    pub async fn admin_ensure_agent(&self, cfg: &KgmConfig, agent_id: &str) -> Result<String> {
        let provider = self.registry.require(cfg)?;
        let agent_id = agent_id.trim();
        ensure_agent_schema(provider.as_ref(), &Actor::Operator, agent_id).await?;
        Ok(resolve_agent_scope(agent_id))
    }

    /// Expected-vs-observed schema for the caller's scope.
    pub async fn schema_describe(
        &self,
        cfg: &KgmConfig,
        params: &CallerParams,
    ) -> Result<SchemaDescribeResult> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.scope.as_deref())?;
        let description: SchemaDescription =
            describe_schema(provider.as_ref(), &actor, &scope).await?;
        Ok(SchemaDescribeResult {
            expected_schema: ExpectedSchema {
                script: description.expected_script,
                registry: description
                    .registry
                    .map(serde_json::to_value)
                    .transpose()?,
            },
            observed_schema: description.observed,
        })
    }

    pub async fn agent_search(
        &self,
        cfg: &KgmConfig,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        provider
            .search(&actor, &scope, &params.query, params.limit)
            .await
    }

    pub async fn agent_get(&self, cfg: &KgmConfig, params: &GetParams) -> Result<GetResult> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        let mut query_params = JsonObject::new();
        query_params.insert("scope".into(), json!(scope));
        query_params.insert("key".into(), json!(params.key));
        let result = provider
            .query(
                &actor,
                &scope,
                "MATCH (n { scope: $scope, key: $key }) \
                 RETURN labels(n)[0] AS label, n AS node LIMIT 1",
                query_params,
                None,
            )
            .await?;
        Ok(match result.rows.into_iter().next() {
            Some(row) => GetResult {
                found: true,
                label: row
                    .get("label")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                node: row.get("node").cloned(),
            },
            None => GetResult {
                found: false,
                label: None,
                node: None,
            },
        })
    }

    pub async fn agent_put_node(
        &self,
        cfg: &KgmConfig,
        params: &PutNodeParams,
    ) -> Result<NodeRef> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        provider
            .upsert_node(
                &actor,
                &scope,
                &params.label,
                &params.key,
                params.properties.clone().unwrap_or_default(),
            )
            .await
    }

    pub async fn agent_put_edge(
        &self,
        cfg: &KgmConfig,
        params: &PutEdgeParams,
    ) -> Result<EdgeRef> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        provider
            .upsert_edge(
                &actor,
                &scope,
                &params.edge_type,
                &NodeRef::new(&params.from_label, &params.from_key),
                &NodeRef::new(&params.to_label, &params.to_key),
                params.properties.clone().unwrap_or_default(),
            )
            .await
    }

    /// Same write as [`agent_put_edge`](Self::agent_put_edge); kept as its
    /// own method to mirror the RPC surface.
    pub async fn agent_link(&self, cfg: &KgmConfig, params: &PutEdgeParams) -> Result<EdgeRef> {
        self.agent_put_edge(cfg, params).await
    }

    /// Set or clear `pinnedAt`. Pinned nodes are exempt from GC.
    #[instrument(skip(self, cfg, params))]
    pub async fn agent_pin(&self, cfg: &KgmConfig, params: &PinParams) -> Result<()> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        let pinned = params.pinned.unwrap_or(true);
        let pinned_at = if pinned {
            json!(chrono::Utc::now().timestamp_millis())
        } else {
            Value::Null
        };
        let mut query_params = JsonObject::new();
        query_params.insert("scope".into(), json!(scope));
        query_params.insert("key".into(), json!(params.key));
        query_params.insert("pinnedAt".into(), pinned_at);
        provider
            .query(
                &actor,
                &scope,
                "MATCH (n { scope: $scope, key: $key }) \
                 SET n.pinnedAt = $pinnedAt RETURN n.key AS key",
                query_params,
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn agent_touch(&self, cfg: &KgmConfig, params: &TouchParams) -> Result<()> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        provider.touch(&actor, &scope, &params.keys, None).await
    }

    /// GC with config-derived decay bounds when params leave them out.
    pub async fn agent_gc(&self, cfg: &KgmConfig, params: &GcParams) -> Result<i64> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        let settings = cfg.decay_settings();
        let outcome = provider
            .gc(
                &actor,
                &scope,
                Some(params.min_weight.unwrap_or(settings.min_weight)),
                Some(params.max_nodes.unwrap_or(settings.max_nodes_per_scope)),
                None,
            )
            .await?;
        Ok(outcome.removed)
    }

    /// Apply the agent schema script inside the caller's agent scope.
    pub async fn agent_ensure_schema(
        &self,
        cfg: &KgmConfig,
        params: &CallerParams,
    ) -> Result<String> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.session_key.as_deref());
        let scope = resolve_actor_scope(&actor, params.scope.as_deref())
            .filter(|scope| scope.starts_with("agent:"))
            .ok_or_else(|| KgmError::InvalidRequest("agent scope required".into()))?;
        if !is_scope_allowed(&actor, &scope) {
            return Err(KgmError::ScopeNotAllowed(scope));
        }
        let agent_id = scope.split(':').nth(1).unwrap_or_default();
        ensure_agent_schema(provider.as_ref(), &Actor::Operator, agent_id).await?;
        Ok(scope)
    }

    pub async fn context_get(
        &self,
        cfg: &KgmConfig,
        params: &CallerParams,
    ) -> Result<Vec<ContextItem>> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.scope.as_deref())?;
        self.context_manager(provider).get(&actor, &scope).await
    }

    pub async fn context_patch(
        &self,
        cfg: &KgmConfig,
        params: &ContextPatchParams,
    ) -> Result<()> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        self.context_manager(provider)
            .patch(&actor, &scope, &params.patch)
            .await
    }

    pub async fn context_materialize(
        &self,
        cfg: &KgmConfig,
        params: &MaterializeParams,
    ) -> Result<String> {
        let provider = self.registry.require(cfg)?;
        let actor = resolve_actor(params.caller.session_key.as_deref());
        let scope = resolve_checked_scope(&actor, params.caller.scope.as_deref())?;
        let opts = MaterializeOptions {
            max_nodes: params.max_nodes,
            max_messages: params.max_messages,
            session_key: params.caller.session_key.clone(),
        };
        self.context_manager(provider)
            .materialize(&actor, &scope, &opts)
            .await
    }
}
