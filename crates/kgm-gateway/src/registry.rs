//! Cached provider construction keyed by a config fingerprint
//!
//! The registry is an explicit component owned by the composition root. It
//! caches one scope-enforcing provider and rebuilds it only when the parts of
//! the config that affect the connection change.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::info;

use kgm_state::fakes::MemoryGraphExecutor;
use kgm_state::{GraphExecutor, GraphProvider, KgmError, MemgraphProvider, ScopedProvider};

use crate::config::{KgmConfig, MemgraphConfig, ProviderKind};

type ExecutorFactory =
    Arc<dyn Fn(&MemgraphConfig) -> kgm_state::Result<Arc<dyn GraphExecutor>> + Send + Sync>;

struct CachedProvider {
    fingerprint: String,
    provider: Arc<dyn GraphProvider>,
}

pub struct ProviderRegistry {
    factory: ExecutorFactory,
    state: Mutex<Option<CachedProvider>>,
}

fn fingerprint(cfg: &KgmConfig) -> String {
    json!({
        "enabled": cfg.enabled,
        "provider": cfg.provider,
        "url": cfg.memgraph.url,
        "user": cfg.memgraph.user,
        "database": cfg.memgraph.database,
    })
    .to_string()
}

impl ProviderRegistry {
    pub fn new(factory: ExecutorFactory) -> Self {
        Self {
            factory,
            state: Mutex::new(None),
        }
    }

    /// Registry over a single shared in-memory executor.
    pub fn with_memory_executor() -> (Self, Arc<MemoryGraphExecutor>) {
        let executor = Arc::new(MemoryGraphExecutor::new());
        let shared = executor.clone();
        let registry = Self::new(Arc::new(move |_cfg| {
            Ok(shared.clone() as Arc<dyn GraphExecutor>)
        }));
        (registry, executor)
    }

    /// The provider for this config, or `None` when the store is disabled or
    /// a foreign provider kind is configured. Cached across calls while the
    /// connection fingerprint is unchanged.
    pub fn resolve(&self, cfg: &KgmConfig) -> kgm_state::Result<Option<Arc<dyn GraphProvider>>> {
        if !cfg.enabled || cfg.provider != ProviderKind::Memgraph {
            return Ok(None);
        }
        let wanted = fingerprint(cfg);
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cached) = state.as_ref() {
            if cached.fingerprint == wanted {
                return Ok(Some(cached.provider.clone()));
            }
        }
        let executor = (self.factory)(&cfg.memgraph)?;
        let database = cfg.memgraph.database.clone();
        let provider: Arc<dyn GraphProvider> = Arc::new(ScopedProvider::new(Arc::new(
            MemgraphProvider::with_database(executor, database),
        )));
        info!("graph provider (re)built");
        *state = Some(CachedProvider {
            fingerprint: wanted,
            provider: provider.clone(),
        });
        Ok(Some(provider))
    }

    /// Like [`resolve`](Self::resolve) but absence is an error.
    pub fn require(&self, cfg: &KgmConfig) -> kgm_state::Result<Arc<dyn GraphProvider>> {
        self.resolve(cfg)?.ok_or(KgmError::ProviderUnavailable)
    }
}
