//! KGM-State: Graph Persistence Layer for KGM
//!
//! This crate provides the scoped persistence layer for the knowledge-graph
//! memory subsystem. It handles all interaction with the backing graph engine
//! through an opaque query-executor seam, layering access control, retry,
//! decay, and schema versioning on top.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: tenant isolation, idempotent writes, and safe re-runnable schema.
//!
//! ## Key Components
//!
//! - `Actor` / scope helpers: the RBAC model (`admin` vs `agent:<id>`)
//! - `GraphExecutor`: run a statement with parameters, get rows back
//! - `MemgraphProvider`: retrying provider with merge-based upserts
//! - `ScopedProvider`: enforces the scope check on every call
//! - `schema_registry`: versioned script application and drift introspection

mod decay;
mod error;
mod executor;
pub mod fakes;
mod memgraph;
mod provider;
pub mod rbac;
pub mod schema_registry;
mod scoped;

pub use decay::{
    build_gc_query, compute_weight, DecaySettings, GcQuery, WeightInput, DEFAULT_HALF_LIFE_MS,
};
pub use error::KgmError;
pub use executor::{is_retryable_error, GraphExecutor, JsonObject};
pub use memgraph::MemgraphProvider;
pub use provider::{
    EdgeRef, GcOutcome, GraphProvider, NodeRef, QueryResult, SchemaSnapshot, SearchHit,
};
pub use rbac::{
    is_scope_allowed, normalize_agent_id, resolve_actor_scope, resolve_admin_scope,
    resolve_agent_scope, Actor,
};
pub use scoped::ScopedProvider;

/// Result type for kgm-state operations
pub type Result<T> = std::result::Result<T, KgmError>;
