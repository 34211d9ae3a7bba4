//! Config snapshot and audit recording

use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::instrument;

use kgm_state::{resolve_admin_scope, Actor, GraphProvider, JsonObject, Result};

use crate::config::KgmConfig;

/// What triggered a snapshot, as written to the audit trail.
#[derive(Debug, Clone)]
pub struct SnapshotContext<'a> {
    pub reason: &'a str,
    pub session_key: Option<&'a str>,
    pub note: Option<&'a str>,
}

fn snapshot_hash(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Record one `ConfigSnapshot` node plus a paired `AuditEvent` under the
/// admin scope. Skipped (returning `Ok(false)`) when the store is disabled
/// or running fs-only; callers treat failures as best-effort and log them.
#[instrument(skip(cfg, provider, raw), fields(reason = %ctx.reason))]
pub async fn record_config_snapshot(
    cfg: &KgmConfig,
    provider: &dyn GraphProvider,
    raw: &str,
    ctx: &SnapshotContext<'_>,
) -> Result<bool> {
    if !cfg.enabled || !cfg.should_mirror() {
        return Ok(false);
    }
    let hash = snapshot_hash(raw);
    let ts = chrono::Utc::now().timestamp_millis();
    let key = format!("config:{hash}");
    let audit_key = format!("audit:config:{ts}");
    let scope = resolve_admin_scope();
    let actor = Actor::system();

    let mut props = JsonObject::new();
    props.insert("id".into(), json!(key));
    props.insert("ts".into(), json!(ts));
    props.insert("hash".into(), json!(hash));
    props.insert("source".into(), json!(ctx.reason));
    props.insert("author".into(), json!(ctx.session_key));
    props.insert("note".into(), json!(ctx.note));
    props.insert("size".into(), json!(raw.len()));
    provider
        .upsert_node(&actor, &scope, "ConfigSnapshot", &key, props)
        .await?;

    let mut props = JsonObject::new();
    props.insert("id".into(), json!(audit_key));
    props.insert("ts".into(), json!(ts));
    props.insert(
        "actor".into(),
        json!(ctx.session_key.unwrap_or("system")),
    );
    props.insert("action".into(), json!(ctx.reason));
    props.insert("target".into(), json!("config"));
    props.insert("ok".into(), json!(true));
    props.insert(
        "meta".into(),
        json!({ "hash": hash, "note": ctx.note }),
    );
    provider
        .upsert_node(&actor, &scope, "AuditEvent", &audit_key, props)
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_sha256() {
        let hash = snapshot_hash("raw config");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, snapshot_hash("raw config"));
    }
}
