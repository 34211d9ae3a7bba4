//! KGM-Gateway: Service Glue for KGM
//!
//! Sits between the platform's RPC surface and the `kgm-state` persistence
//! layer. Owns configuration, the cached provider registry, the context-set
//! manager, session-transcript ingestion, config snapshots, and the
//! admin-scope mirrors.
//!
//! ## Layer 1 - Service/Glue
//!
//! Transport and request validation stay outside this crate; the `ops`
//! module exposes one async function per RPC method over typed params.

pub mod config;
pub mod context;
pub mod ingest;
pub mod mirror;
pub mod ops;
pub mod registry;
pub mod sessions;
pub mod snapshots;
pub mod transcript;
pub mod workspace;

pub use config::{DecayConfig, KgmConfig, KgmMode, MemgraphConfig, ProviderKind};
pub use context::{ContextManager, ContextPatch};
pub use ingest::{ingest_session_transcript_file, IngestScheduler};
pub use ops::KgmService;
pub use registry::ProviderRegistry;
pub use snapshots::record_config_snapshot;
