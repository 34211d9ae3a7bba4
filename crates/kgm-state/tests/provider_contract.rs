//! End-to-end provider behavior over the in-memory executor.

use std::sync::Arc;

use serde_json::json;

use kgm_state::fakes::MemoryGraphExecutor;
use kgm_state::{
    Actor, GraphProvider, JsonObject, KgmError, MemgraphProvider, NodeRef, ScopedProvider,
};

fn setup() -> (Arc<MemoryGraphExecutor>, MemgraphProvider) {
    let executor = Arc::new(MemoryGraphExecutor::new());
    let provider = MemgraphProvider::new(executor.clone());
    (executor, provider)
}

fn props(pairs: &[(&str, serde_json::Value)]) -> JsonObject {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn upsert_node_is_idempotent() {
    let (executor, provider) = setup();
    let actor = Actor::agent("alpha");
    for _ in 0..3 {
        provider
            .upsert_node(
                &actor,
                "agent:alpha",
                "Node",
                "node:project",
                props(&[("label", json!("Project"))]),
            )
            .await
            .unwrap();
    }
    assert_eq!(executor.node_count("agent:alpha"), 1);
    let (label, stored) = executor.node("agent:alpha", "node:project").unwrap();
    assert_eq!(label, "Node");
    assert_eq!(stored["label"], json!("Project"));
    assert!(stored.contains_key("updatedAt"));
}

#[tokio::test]
async fn upsert_edge_joins_existing_nodes() {
    let (executor, provider) = setup();
    let actor = Actor::agent("alpha");
    let scope = "agent:alpha";
    let from = provider
        .upsert_node(&actor, scope, "Node", "node:a", JsonObject::new())
        .await
        .unwrap();
    let to = provider
        .upsert_node(&actor, scope, "Node", "node:b", JsonObject::new())
        .await
        .unwrap();
    let edge = provider
        .upsert_edge(&actor, scope, "RELATES", &from, &to, JsonObject::new())
        .await
        .unwrap();
    assert_eq!(edge.edge_type, "RELATES");
    assert_eq!(
        executor.edges(scope),
        vec![("RELATES".to_string(), "node:a".to_string(), "node:b".to_string())]
    );
}

#[tokio::test]
async fn search_matches_key_and_label_within_scope() {
    let (_executor, provider) = setup();
    let actor = Actor::Operator;
    provider
        .upsert_node(
            &actor,
            "agent:alpha",
            "Node",
            "node:rust-work",
            props(&[("label", json!("Compiler"))]),
        )
        .await
        .unwrap();
    provider
        .upsert_node(
            &actor,
            "agent:alpha",
            "Node",
            "node:other",
            props(&[("label", json!("rust toolchain"))]),
        )
        .await
        .unwrap();
    provider
        .upsert_node(
            &actor,
            "agent:beta",
            "Node",
            "node:rust-beta",
            JsonObject::new(),
        )
        .await
        .unwrap();

    let hits = provider
        .search(&actor, "agent:alpha", "rust", None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.key.contains("rust")
        || h.properties
            .as_ref()
            .and_then(|p| p.get("label"))
            .and_then(|l| l.as_str())
            .map(|l| l.contains("rust"))
            .unwrap_or(false)));
}

#[tokio::test]
async fn search_limit_is_embedded_not_bound() {
    let (executor, provider) = setup();
    let actor = Actor::Operator;
    for i in 0..5 {
        provider
            .upsert_node(
                &actor,
                "agent:alpha",
                "Node",
                &format!("node:item-{i}"),
                JsonObject::new(),
            )
            .await
            .unwrap();
    }
    let hits = provider
        .search(&actor, "agent:alpha", "item", Some(2.9))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    let search_statement = executor
        .statement_log()
        .into_iter()
        .find(|s| s.contains("CONTAINS $query"))
        .unwrap();
    assert!(search_statement.ends_with("LIMIT 2"));
    assert!(!search_statement.contains("$limit"));
}

#[tokio::test]
async fn touch_bumps_access_count_and_skips_blank_keys() {
    let (executor, provider) = setup();
    let actor = Actor::agent("alpha");
    let scope = "agent:alpha";
    provider
        .upsert_node(&actor, scope, "Node", "node:a", JsonObject::new())
        .await
        .unwrap();

    provider
        .touch(
            &actor,
            scope,
            &["node:a".to_string(), "  ".to_string()],
            Some(42),
        )
        .await
        .unwrap();
    provider
        .touch(&actor, scope, &["node:a".to_string()], Some(43))
        .await
        .unwrap();
    let (_, stored) = executor.node(scope, "node:a").unwrap();
    assert_eq!(stored["accessCount"], json!(2));
    assert_eq!(stored["lastAccessAt"], json!(43));

    // All-blank key lists never reach the store.
    let before = executor.statement_log().len();
    provider
        .touch(&actor, scope, &["".to_string()], None)
        .await
        .unwrap();
    assert_eq!(executor.statement_log().len(), before);
}

#[tokio::test]
async fn gc_spares_pinned_and_weighted_nodes() {
    let (executor, provider) = setup();
    let actor = Actor::Operator;
    let scope = "agent:alpha";
    provider
        .upsert_node(&actor, scope, "Node", "node:stale", JsonObject::new())
        .await
        .unwrap();
    provider
        .upsert_node(
            &actor,
            scope,
            "Node",
            "node:pinned",
            props(&[("pinnedAt", json!(1_700_000_000_000i64))]),
        )
        .await
        .unwrap();
    provider
        .upsert_node(
            &actor,
            scope,
            "Node",
            "node:heavy",
            props(&[("weight", json!(3.5))]),
        )
        .await
        .unwrap();

    let outcome = provider.gc(&actor, scope, None, None, None).await.unwrap();
    assert_eq!(outcome.removed, 1);
    assert!(executor.node(scope, "node:stale").is_none());
    assert!(executor.node(scope, "node:pinned").is_some());
    assert!(executor.node(scope, "node:heavy").is_some());
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried() {
    let (executor, provider) = setup();
    executor.push_failure("connection reset by peer");
    executor.push_failure("Service Unavailable");
    let actor = Actor::agent("alpha");
    let node = provider
        .upsert_node(&actor, "agent:alpha", "Node", "node:a", JsonObject::new())
        .await
        .unwrap();
    assert_eq!(node, NodeRef::new("Node", "node:a"));
    assert_eq!(executor.statement_log().len(), 3);
}

#[tokio::test]
async fn retries_exhaust_after_three_attempts() {
    let (executor, provider) = setup();
    executor.push_failure("connection reset by peer");
    executor.push_failure("connection reset by peer");
    executor.push_failure("connection reset by peer");
    let actor = Actor::agent("alpha");
    let err = provider
        .upsert_node(&actor, "agent:alpha", "Node", "node:a", JsonObject::new())
        .await
        .unwrap_err();
    assert!(matches!(&err, KgmError::Store(msg) if msg.contains("connection reset")));
    assert_eq!(executor.statement_log().len(), 3);
    assert!(executor.node("agent:alpha", "node:a").is_none());
}

#[tokio::test]
async fn non_retryable_errors_surface_immediately() {
    let (executor, provider) = setup();
    executor.push_failure("syntax error near MERGE");
    let actor = Actor::agent("alpha");
    let err = provider
        .upsert_node(&actor, "agent:alpha", "Node", "node:a", JsonObject::new())
        .await
        .unwrap_err();
    assert!(matches!(err, KgmError::Store(_)));
    assert_eq!(executor.statement_log().len(), 1);
}

#[tokio::test]
async fn scoped_provider_blocks_cross_tenant_reads() {
    let executor = Arc::new(MemoryGraphExecutor::new());
    let provider = ScopedProvider::new(Arc::new(MemgraphProvider::new(executor)));
    let alpha = Actor::agent("alpha");
    provider
        .upsert_node(&alpha, "agent:alpha", "Node", "node:secret", JsonObject::new())
        .await
        .unwrap();
    let beta = Actor::agent("beta");
    let err = provider
        .search(&beta, "agent:alpha", "secret", None)
        .await
        .unwrap_err();
    assert!(matches!(err, KgmError::ScopeNotAllowed(_)));
}
