//! Agent workspace bootstrap documents
//!
//! Each agent workspace carries a small set of named markdown files that seed
//! its context. Group sessions never see the per-user files.

use std::path::{Path, PathBuf};

use kgm_state::normalize_agent_id;

pub const DEFAULT_USER_FILENAME: &str = "USER.md";
pub const DEFAULT_MEMORY_FILENAME: &str = "MEMORY.md";
pub const DEFAULT_MEMORY_ALT_FILENAME: &str = "memory.md";

const BOOTSTRAP_FILENAMES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "TOOLS.md",
    "IDENTITY.md",
    DEFAULT_USER_FILENAME,
    "HEARTBEAT.md",
];

pub const DEFAULT_BOOTSTRAP_MAX_CHARS: usize = 20_000;

/// One bootstrap document slot, present or not.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceBootstrapFile {
    pub name: String,
    pub path: PathBuf,
    pub content: Option<String>,
    pub missing: bool,
}

/// A document selected for the assembled context, possibly truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapContextDoc {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

/// Workspace dir: `<state_dir>/agents/<id>/workspace`.
pub fn resolve_agent_workspace_dir(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir
        .join("agents")
        .join(normalize_agent_id(agent_id))
        .join("workspace")
}

fn load_file(dir: &Path, name: &str) -> WorkspaceBootstrapFile {
    let path = dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(content) => WorkspaceBootstrapFile {
            name: name.to_string(),
            path,
            content: Some(content),
            missing: false,
        },
        Err(_) => WorkspaceBootstrapFile {
            name: name.to_string(),
            path,
            content: None,
            missing: true,
        },
    }
}

/// Read the fixed bootstrap set from a workspace dir. `MEMORY.md` falls back
/// to `memory.md` when only the lowercase variant exists.
pub fn load_workspace_bootstrap_files(dir: &Path) -> Vec<WorkspaceBootstrapFile> {
    let mut files: Vec<WorkspaceBootstrapFile> = BOOTSTRAP_FILENAMES
        .iter()
        .map(|name| load_file(dir, name))
        .collect();
    let mut memory = load_file(dir, DEFAULT_MEMORY_FILENAME);
    if memory.missing {
        let alt = load_file(dir, DEFAULT_MEMORY_ALT_FILENAME);
        if !alt.missing {
            memory = alt;
        }
    }
    files.push(memory);
    files
}

/// Drop per-user documents for group sessions.
pub fn filter_bootstrap_files_for_group(
    files: Vec<WorkspaceBootstrapFile>,
) -> Vec<WorkspaceBootstrapFile> {
    files
        .into_iter()
        .filter(|file| {
            !matches!(
                file.name.as_str(),
                DEFAULT_USER_FILENAME | DEFAULT_MEMORY_FILENAME | DEFAULT_MEMORY_ALT_FILENAME
            )
        })
        .collect()
}

/// Non-missing files rendered into docs under a shared character budget.
/// Files past the budget are skipped; the file that crosses it is truncated.
pub fn build_bootstrap_context_docs(
    files: &[WorkspaceBootstrapFile],
    max_chars: usize,
) -> Vec<BootstrapContextDoc> {
    let mut docs = Vec::new();
    let mut used = 0usize;
    for file in files {
        let Some(content) = file.content.as_deref() else {
            continue;
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        if used >= max_chars {
            break;
        }
        let remaining = max_chars - used;
        let (content, truncated) = if content.chars().count() > remaining {
            let clipped: String = content.chars().take(remaining).collect();
            (format!("{clipped}\n[truncated]"), true)
        } else {
            (content.to_string(), false)
        };
        used += content.chars().count();
        docs.push(BootstrapContextDoc {
            path: file.name.clone(),
            content,
            truncated,
        });
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_with(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn loads_fixed_set_with_memory_fallback() {
        let dir = workspace_with(&[("AGENTS.md", "# Agents"), ("memory.md", "remember")]);
        let files = load_workspace_bootstrap_files(dir.path());
        let agents = files.iter().find(|f| f.name == "AGENTS.md").unwrap();
        assert!(!agents.missing);
        let memory = files.iter().find(|f| f.name == "memory.md").unwrap();
        assert_eq!(memory.content.as_deref(), Some("remember"));
        assert!(files.iter().find(|f| f.name == "SOUL.md").unwrap().missing);
    }

    #[test]
    fn uppercase_memory_wins_over_alt() {
        let dir = workspace_with(&[("MEMORY.md", "upper"), ("memory.md", "lower")]);
        let files = load_workspace_bootstrap_files(dir.path());
        let memory = files.iter().find(|f| f.name == "MEMORY.md").unwrap();
        assert_eq!(memory.content.as_deref(), Some("upper"));
    }

    #[test]
    fn group_filter_drops_user_docs() {
        let dir = workspace_with(&[
            ("AGENTS.md", "a"),
            ("USER.md", "u"),
            ("MEMORY.md", "m"),
        ]);
        let files = filter_bootstrap_files_for_group(load_workspace_bootstrap_files(dir.path()));
        assert!(files.iter().any(|f| f.name == "AGENTS.md"));
        assert!(!files.iter().any(|f| f.name == "USER.md"));
        assert!(!files.iter().any(|f| f.name == "MEMORY.md"));
    }

    #[test]
    fn docs_respect_the_char_budget() {
        let dir = workspace_with(&[("AGENTS.md", "aaaaaaaaaa"), ("SOUL.md", "bbbbbbbbbb")]);
        let files = load_workspace_bootstrap_files(dir.path());
        let docs = build_bootstrap_context_docs(&files, 14);
        assert_eq!(docs.len(), 2);
        assert!(!docs[0].truncated);
        assert!(docs[1].truncated);
        assert!(docs[1].content.starts_with("bbbb"));
        assert!(docs[1].content.ends_with("[truncated]"));
    }
}
