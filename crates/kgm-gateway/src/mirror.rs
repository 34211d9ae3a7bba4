//! Admin-scope mirrors and primary-mode read-backs
//!
//! Mirrors copy platform inventory (agents, skills, device nodes) into the
//! admin scope whenever the graph participates in writes. Read-backs are the
//! inverse and only apply in kgm-primary mode; `Ok(None)` tells the caller
//! to fall back to its own source of truth.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{instrument, warn};

use kgm_state::{resolve_admin_scope, Actor, GraphProvider, JsonObject, Result};

use crate::config::KgmConfig;

/// One platform agent, as mirrored and read back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
}

/// One skill binding for an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillSummary {
    pub name: String,
    pub skill_key: String,
    pub source: Option<String>,
    pub primary_env: Option<String>,
    pub emoji: Option<String>,
    pub homepage: Option<String>,
    pub disabled: Option<bool>,
    pub eligible: Option<bool>,
}

/// One connected device node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSummary {
    pub node_id: String,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
    pub device_family: Option<String>,
    pub remote_ip: Option<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub connected_at_ms: Option<i64>,
    pub paired: Option<bool>,
    pub connected: Option<bool>,
}

fn sort_nodes(nodes: &mut [NodeSummary]) {
    nodes.sort_by(|a, b| {
        let connected = |n: &NodeSummary| n.connected.unwrap_or(false);
        let name = |n: &NodeSummary| {
            n.display_name
                .clone()
                .unwrap_or_else(|| n.node_id.clone())
                .to_lowercase()
        };
        connected(b)
            .cmp(&connected(a))
            .then_with(|| name(a).cmp(&name(b)))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
}

fn serialize_props<T: Serialize>(value: &T) -> Result<JsonObject> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Ok(JsonObject::new()),
    }
}

/// Mirror the agent roster. `Ok(false)` when the mode keeps writes on the
/// filesystem only.
#[instrument(skip(cfg, provider, agents))]
pub async fn mirror_agents(
    cfg: &KgmConfig,
    provider: &dyn GraphProvider,
    agents: &[AgentSummary],
) -> Result<bool> {
    if !cfg.should_mirror() {
        return Ok(false);
    }
    let scope = resolve_admin_scope();
    let actor = Actor::system();
    let now = chrono::Utc::now().timestamp_millis();
    for agent in agents {
        let id = agent.id.trim();
        if id.is_empty() {
            continue;
        }
        let mut props = serialize_props(agent)?;
        props.insert("updatedAt".into(), json!(now));
        provider
            .upsert_node(&actor, &scope, "Agent", &format!("agent:{id}"), props)
            .await?;
    }
    Ok(true)
}

/// Mirror one agent's skill set.
#[instrument(skip(cfg, provider, skills), fields(agent_id = %agent_id))]
pub async fn mirror_skills(
    cfg: &KgmConfig,
    provider: &dyn GraphProvider,
    agent_id: &str,
    skills: &[SkillSummary],
) -> Result<bool> {
    if !cfg.should_mirror() {
        return Ok(false);
    }
    let scope = resolve_admin_scope();
    let actor = Actor::system();
    let now = chrono::Utc::now().timestamp_millis();
    for skill in skills {
        let key = if skill.skill_key.trim().is_empty() {
            skill.name.trim()
        } else {
            skill.skill_key.trim()
        };
        if key.is_empty() {
            continue;
        }
        let mut props = serialize_props(skill)?;
        props.insert("id".into(), json!(key));
        props.insert("agentId".into(), json!(agent_id));
        props.insert("updatedAt".into(), json!(now));
        provider
            .upsert_node(&actor, &scope, "Skill", &format!("skill:{key}"), props)
            .await?;
    }
    Ok(true)
}

/// Mirror the device-node inventory.
#[instrument(skip(cfg, provider, nodes))]
pub async fn mirror_nodes(
    cfg: &KgmConfig,
    provider: &dyn GraphProvider,
    nodes: &[NodeSummary],
) -> Result<bool> {
    if !cfg.should_mirror() {
        return Ok(false);
    }
    let scope = resolve_admin_scope();
    let actor = Actor::system();
    let now = chrono::Utc::now().timestamp_millis();
    for node in nodes {
        let node_id = node.node_id.trim();
        if node_id.is_empty() {
            continue;
        }
        let mut props = serialize_props(node)?;
        props.insert("id".into(), json!(node_id));
        props.insert("lastSeenAt".into(), json!(now));
        props.insert("updatedAt".into(), json!(now));
        provider
            .upsert_node(&actor, &scope, "Node", &format!("node:{node_id}"), props)
            .await?;
    }
    Ok(true)
}

/// Agent roster read-back, kgm-primary mode only. `Ok(None)` on out-of-mode,
/// empty results, or store failure.
pub async fn read_agents(
    cfg: &KgmConfig,
    provider: &dyn GraphProvider,
) -> Result<Option<Vec<AgentSummary>>> {
    if !cfg.should_read_primary() {
        return Ok(None);
    }
    let scope = resolve_admin_scope();
    let actor = Actor::system();
    let mut params = JsonObject::new();
    params.insert("scope".into(), json!(scope));
    let result = match provider
        .query(
            &actor,
            &scope,
            "MATCH (a:Agent { scope: $scope }) \
             RETURN a.id AS id, a.name AS name, a.identity AS identity ORDER BY a.id",
            params,
            None,
        )
        .await
    {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, "agent read-back failed");
            return Ok(None);
        }
    };
    let agents: Vec<AgentSummary> = result
        .rows
        .into_iter()
        .filter_map(|row| {
            let id = row.get("id").and_then(Value::as_str)?.trim().to_string();
            if id.is_empty() {
                return None;
            }
            Some(AgentSummary {
                id,
                name: row
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                identity: row.get("identity").filter(|v| v.is_object()).cloned(),
            })
        })
        .collect();
    Ok((!agents.is_empty()).then_some(agents))
}

/// Device-node read-back sorted connected-first, then display name, then id.
pub async fn read_nodes(
    cfg: &KgmConfig,
    provider: &dyn GraphProvider,
) -> Result<Option<Vec<NodeSummary>>> {
    if !cfg.should_read_primary() {
        return Ok(None);
    }
    let scope = resolve_admin_scope();
    let actor = Actor::system();
    let mut params = JsonObject::new();
    params.insert("scope".into(), json!(scope));
    let result = match provider
        .query(
            &actor,
            &scope,
            "MATCH (n:Node { scope: $scope }) RETURN n AS node",
            params,
            None,
        )
        .await
    {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, "node read-back failed");
            return Ok(None);
        }
    };
    let mut nodes: Vec<NodeSummary> = result
        .rows
        .into_iter()
        .filter_map(|row| {
            let node = row.get("node")?.as_object()?;
            let mut summary: NodeSummary =
                serde_json::from_value(Value::Object(node.clone())).ok()?;
            if summary.node_id.is_empty() {
                summary.node_id = node.get("key").and_then(Value::as_str)?.to_string();
            }
            (!summary.node_id.is_empty()).then_some(summary)
        })
        .collect();
    if nodes.is_empty() {
        return Ok(None);
    }
    sort_nodes(&mut nodes);
    Ok(Some(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_sort_order() {
        let mut nodes = vec![
            NodeSummary {
                node_id: "c".into(),
                display_name: Some("Zeta".into()),
                connected: Some(true),
                ..NodeSummary::default()
            },
            NodeSummary {
                node_id: "a".into(),
                display_name: Some("alpha".into()),
                connected: Some(false),
                ..NodeSummary::default()
            },
            NodeSummary {
                node_id: "b".into(),
                display_name: Some("Beta".into()),
                connected: Some(true),
                ..NodeSummary::default()
            },
        ];
        sort_nodes(&mut nodes);
        let order: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }
}
