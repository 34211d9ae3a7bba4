//! Schema scripts and their registry records
//!
//! DDL ships as `.cypherl` assets compiled into the binary. Applying a script
//! runs its statements one at a time; "already exists" style errors from
//! re-runs are tolerated so init stays re-entrant. The admin pass also records
//! what was applied as `GraphSchema`/`Scope` nodes joined by `APPLIES_TO`
//! edges, so a live deployment can be compared against the shipped scripts.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::executor::JsonObject;
use crate::provider::{GraphProvider, NodeRef};
use crate::rbac::{resolve_admin_scope, resolve_agent_scope, Actor};
use crate::Result;

pub const SCHEMA_VERSION: &str = "v1";
pub const ADMIN_SCHEMA_PATH: &str = "assets/schema-admin.cypherl";
pub const AGENT_SCHEMA_PATH: &str = "assets/schema-agent.cypherl";

const ADMIN_SCHEMA: &str = include_str!("../assets/schema-admin.cypherl");
const AGENT_SCHEMA: &str = include_str!("../assets/schema-agent.cypherl");

/// Registry record for one applied schema script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub name: String,
    pub version: String,
    pub hash: String,
    pub applies_to_kind: String,
    pub path: String,
}

/// Expected-vs-observed schema view for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescription {
    pub expected_script: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryEntry>,
    pub observed: serde_json::Value,
}

fn hash_script(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn split_statements(script: &str) -> Vec<&str> {
    script
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_already_applied_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("already exists")
        || lowered.contains("unique violation")
        || lowered.contains("constraint violation")
}

async fn exec_script(
    provider: &dyn GraphProvider,
    actor: &Actor,
    scope: &str,
    script: &str,
) -> Result<()> {
    for statement in split_statements(script) {
        match provider
            .query(actor, scope, statement, JsonObject::new(), None)
            .await
        {
            Ok(_) => {}
            Err(err) if is_already_applied_error(&err.to_string()) => {
                debug!(scope = %scope, "schema statement already applied");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Apply both schema scripts at the admin scope and record them in the
/// registry.
#[instrument(skip(provider, actor))]
pub async fn ensure_admin_schema(provider: &dyn GraphProvider, actor: &Actor) -> Result<()> {
    let admin_scope = resolve_admin_scope();
    exec_script(provider, actor, &admin_scope, ADMIN_SCHEMA).await?;
    exec_script(provider, actor, &admin_scope, AGENT_SCHEMA).await?;

    let now = chrono::Utc::now().timestamp_millis();

    let mut props = JsonObject::new();
    props.insert("id".into(), json!("admin"));
    props.insert("kind".into(), json!("admin"));
    props.insert("updatedAt".into(), json!(now));
    provider
        .upsert_node(actor, &admin_scope, "Scope", "scope:admin", props)
        .await?;

    let mut props = JsonObject::new();
    props.insert("id".into(), json!("agent"));
    props.insert("kind".into(), json!("agent"));
    props.insert("updatedAt".into(), json!(now));
    provider
        .upsert_node(actor, &admin_scope, "Scope", "scope:agent", props)
        .await?;

    let mut props = JsonObject::new();
    props.insert("name".into(), json!("kgm-admin"));
    props.insert("version".into(), json!(SCHEMA_VERSION));
    props.insert("appliesToKind".into(), json!("admin"));
    props.insert("hash".into(), json!(hash_script(ADMIN_SCHEMA)));
    props.insert("path".into(), json!(ADMIN_SCHEMA_PATH));
    props.insert("updatedAt".into(), json!(now));
    provider
        .upsert_node(actor, &admin_scope, "GraphSchema", "schema:admin", props)
        .await?;

    let mut props = JsonObject::new();
    props.insert("name".into(), json!("kgm-agent"));
    props.insert("version".into(), json!(SCHEMA_VERSION));
    props.insert("appliesToKind".into(), json!("agent"));
    props.insert("hash".into(), json!(hash_script(AGENT_SCHEMA)));
    props.insert("path".into(), json!(AGENT_SCHEMA_PATH));
    props.insert("updatedAt".into(), json!(now));
    provider
        .upsert_node(actor, &admin_scope, "GraphSchema", "schema:agent", props)
        .await?;

    provider
        .upsert_edge(
            actor,
            &admin_scope,
            "APPLIES_TO",
            &NodeRef::new("GraphSchema", "schema:admin"),
            &NodeRef::new("Scope", "scope:admin"),
            JsonObject::new(),
        )
        .await?;
    provider
        .upsert_edge(
            actor,
            &admin_scope,
            "APPLIES_TO",
            &NodeRef::new("GraphSchema", "schema:agent"),
            &NodeRef::new("Scope", "scope:agent"),
            JsonObject::new(),
        )
        .await?;

    info!("admin schema ensured");
    Ok(())
}

/// Apply the agent script inside one agent's scope.
#[instrument(skip(provider, actor), fields(agent_id = %agent_id))]
pub async fn ensure_agent_schema(
    provider: &dyn GraphProvider,
    actor: &Actor,
    agent_id: &str,
) -> Result<()> {
    let scope = resolve_agent_scope(agent_id);
    exec_script(provider, actor, &scope, AGENT_SCHEMA).await
}

/// Compare the scope's expected script against the registry record and the
/// engine's live view. Registry lookup is best-effort.
pub async fn describe_schema(
    provider: &dyn GraphProvider,
    actor: &Actor,
    scope: &str,
) -> Result<SchemaDescription> {
    let observed = provider.describe_schema(actor, scope).await?;
    let is_agent = scope.starts_with("agent:");
    let expected_script = if is_agent {
        AGENT_SCHEMA_PATH
    } else {
        ADMIN_SCHEMA_PATH
    };

    let admin_scope = resolve_admin_scope();
    let mut params = JsonObject::new();
    params.insert("adminScope".into(), json!(admin_scope));
    params.insert(
        "scopeId".into(),
        json!(if is_agent { "agent" } else { "admin" }),
    );
    let registry = match provider
        .query(
            &Actor::Operator,
            &admin_scope,
            "MATCH (g:GraphSchema { scope: $adminScope })-[:APPLIES_TO { scope: $adminScope }]->\
             (s:Scope { id: $scopeId, scope: $adminScope }) \
             RETURN g.name AS name, g.version AS version, g.hash AS hash, \
             g.appliesToKind AS appliesToKind, g.path AS path",
            params,
            None,
        )
        .await
    {
        Ok(result) => result
            .rows
            .first()
            .and_then(|row| serde_json::from_value(json!(row)).ok()),
        Err(_) => None,
    };

    Ok(SchemaDescription {
        expected_script: expected_script.to_string(),
        registry,
        observed: observed.observed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_split_on_semicolons() {
        let statements = split_statements("CREATE INDEX ON :A(key);\nCREATE INDEX ON :B(key);\n");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "CREATE INDEX ON :A(key)");
    }

    #[test]
    fn blank_fragments_are_dropped() {
        assert!(split_statements(" ; ;\n;").is_empty());
    }

    #[test]
    fn already_applied_detection() {
        assert!(is_already_applied_error("Constraint already exists"));
        assert!(is_already_applied_error("UNIQUE VIOLATION on :Scope"));
        assert!(!is_already_applied_error("connection reset"));
    }

    #[test]
    fn script_hashes_are_stable() {
        assert_eq!(hash_script(ADMIN_SCHEMA), hash_script(ADMIN_SCHEMA));
        assert_ne!(hash_script(ADMIN_SCHEMA), hash_script(AGENT_SCHEMA));
    }
}
