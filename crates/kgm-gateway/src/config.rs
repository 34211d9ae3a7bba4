//! KGM configuration section and mode resolution

use serde::{Deserialize, Serialize};

use kgm_state::{DecaySettings, DEFAULT_HALF_LIFE_MS};

/// Which backing provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Memgraph,
    None,
}

/// How the graph participates relative to the filesystem source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KgmMode {
    #[serde(rename = "fs-only")]
    FsOnly,
    #[default]
    #[serde(rename = "fs+kgm")]
    FsPlusKgm,
    #[serde(rename = "kgm-primary")]
    KgmPrimary,
}

/// Connection settings for the graph engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemgraphConfig {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_pool_size: Option<u32>,
}

/// Decay tuning overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecayConfig {
    pub half_life_ms: Option<i64>,
    pub min_weight: Option<f64>,
    pub max_nodes_per_scope: Option<i64>,
}

/// The `kgm` configuration section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KgmConfig {
    pub enabled: bool,
    pub provider: ProviderKind,
    pub mode: Option<KgmMode>,
    pub memgraph: MemgraphConfig,
    pub decay: DecayConfig,
}

impl KgmConfig {
    /// Effective mode. A disabled store is always fs-only.
    pub fn resolve_mode(&self) -> KgmMode {
        if !self.enabled {
            return KgmMode::FsOnly;
        }
        self.mode.unwrap_or_default()
    }

    /// Writes flow to the graph in any non-fs-only mode.
    pub fn should_mirror(&self) -> bool {
        self.resolve_mode() != KgmMode::FsOnly
    }

    /// Reads prefer the graph only in kgm-primary mode.
    pub fn should_read_primary(&self) -> bool {
        self.resolve_mode() == KgmMode::KgmPrimary
    }

    /// Decay settings with config overrides applied over the defaults.
    pub fn decay_settings(&self) -> DecaySettings {
        let defaults = DecaySettings::default();
        DecaySettings {
            half_life_ms: self
                .decay
                .half_life_ms
                .unwrap_or(DEFAULT_HALF_LIFE_MS),
            min_weight: self.decay.min_weight.unwrap_or(defaults.min_weight),
            max_nodes_per_scope: self
                .decay
                .max_nodes_per_scope
                .unwrap_or(defaults.max_nodes_per_scope),
        }
    }
}
