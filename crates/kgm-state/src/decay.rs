//! Decay weighting and garbage-collection query construction
//!
//! A node's weight rewards access frequency logarithmically and decays
//! exponentially with staleness. GC removes unpinned nodes whose weight has
//! fallen below a floor, bounded per run.

use serde_json::json;

use crate::executor::JsonObject;

/// Default half-life: 14 days in milliseconds.
pub const DEFAULT_HALF_LIFE_MS: i64 = 14 * 24 * 60 * 60 * 1000;

/// Decay configuration for a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct DecaySettings {
    pub half_life_ms: i64,
    pub min_weight: f64,
    pub max_nodes_per_scope: i64,
}

impl Default for DecaySettings {
    fn default() -> Self {
        Self {
            half_life_ms: DEFAULT_HALF_LIFE_MS,
            min_weight: 0.01,
            max_nodes_per_scope: 50_000,
        }
    }
}

/// Inputs to [`compute_weight`]. All times are epoch milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct WeightInput {
    pub access_count: i64,
    pub last_access_at: i64,
    pub now: i64,
    pub half_life_ms: i64,
}

/// Recency-and-frequency score used to decide GC eligibility.
///
/// Returns `0` when the node has never been accessed or no half-life is
/// configured. At `age == 0` the weight is exactly `ln(1 + accessCount)`.
pub fn compute_weight(input: WeightInput) -> f64 {
    let access_count = input.access_count.max(0);
    let last_access_at = input.last_access_at.max(0);
    if last_access_at == 0 || input.half_life_ms <= 0 {
        return 0.0;
    }
    let age = (input.now - last_access_at).max(0);
    let freq = (1.0 + access_count as f64).ln();
    let decay = (-(age as f64) / input.half_life_ms as f64).exp();
    freq * decay
}

/// A prepared GC statement with its bound parameters.
#[derive(Debug, Clone)]
pub struct GcQuery {
    pub statement: &'static str,
    pub params: JsonObject,
}

/// Bounded, pin-respecting delete for one scope.
///
/// Nodes with `pinnedAt` set are never eligible regardless of weight.
pub fn build_gc_query(scope: &str, min_weight: f64, max_nodes: i64) -> GcQuery {
    let mut params = JsonObject::new();
    params.insert("scope".to_string(), json!(scope));
    params.insert("minWeight".to_string(), json!(min_weight));
    params.insert("limit".to_string(), json!(max_nodes));
    GcQuery {
        statement: "MATCH (n { scope: $scope }) \
             WHERE coalesce(n.weight, 0) < $minWeight AND coalesce(n.pinnedAt, 0) = 0 \
             WITH n LIMIT $limit DETACH DELETE n RETURN count(*) AS removed",
        params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(access_count: i64, last_access_at: i64, now: i64, half_life_ms: i64) -> WeightInput {
        WeightInput {
            access_count,
            last_access_at,
            now,
            half_life_ms,
        }
    }

    #[test]
    fn weight_is_zero_without_last_access() {
        for count in [0, 1, 100] {
            assert_eq!(compute_weight(input(count, 0, 1_000_000, 1_000)), 0.0);
        }
    }

    #[test]
    fn weight_is_zero_without_half_life() {
        assert_eq!(compute_weight(input(10, 500, 1_000, 0)), 0.0);
    }

    #[test]
    fn weight_at_zero_age_is_log_of_count() {
        for count in [0i64, 1, 5, 1000] {
            let got = compute_weight(input(count, 5_000, 5_000, DEFAULT_HALF_LIFE_MS));
            let want = (1.0 + count as f64).ln();
            assert_eq!(got, want, "count={count}");
        }
    }

    #[test]
    fn weight_decays_with_age() {
        let fresh = compute_weight(input(10, 1_000, 1_000, 10_000));
        let stale = compute_weight(input(10, 1_000, 21_000, 10_000));
        assert!(stale < fresh);
        assert!(stale > 0.0);
    }

    #[test]
    fn negative_access_count_is_clamped() {
        assert_eq!(
            compute_weight(input(-5, 5_000, 5_000, 10_000)),
            compute_weight(input(0, 5_000, 5_000, 10_000))
        );
    }

    #[test]
    fn gc_query_binds_scope_and_bounds() {
        let query = build_gc_query("agent:main", 0.01, 500);
        assert!(query.statement.contains("coalesce(n.pinnedAt, 0) = 0"));
        assert_eq!(query.params["scope"], "agent:main");
        assert_eq!(query.params["minWeight"], 0.01);
        assert_eq!(query.params["limit"], 500);
    }
}
