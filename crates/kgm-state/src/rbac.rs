//! Actor and scope model
//!
//! Every stored entity carries its owning scope as a property; scope is the
//! sole isolation mechanism. `admin` holds platform-wide data, `agent:<id>`
//! holds one agent's partition. An `Agent` actor may only touch its own
//! partition; `Operator` and `System` actors are unrestricted.

/// Identity on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Platform operator, unrestricted.
    Operator,
    /// A single agent, restricted to its own scope.
    Agent {
        agent_id: String,
        session_key: Option<String>,
    },
    /// Internal subsystem (mirrors, ingestion, audit), unrestricted.
    System {
        agent_id: Option<String>,
        session_key: Option<String>,
    },
}

impl Actor {
    /// Agent actor for the given id.
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Actor::Agent {
            agent_id: agent_id.into(),
            session_key: None,
        }
    }

    /// System actor with no agent association.
    pub fn system() -> Self {
        Actor::System {
            agent_id: None,
            session_key: None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Actor::Operator => None,
            Actor::Agent { agent_id, .. } => Some(agent_id),
            Actor::System { agent_id, .. } => agent_id.as_deref(),
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        match self {
            Actor::Operator => None,
            Actor::Agent { session_key, .. } | Actor::System { session_key, .. } => {
                session_key.as_deref()
            }
        }
    }
}

/// Canonical form of an agent id as used in scope strings.
pub fn normalize_agent_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Scope string owning one agent's partition.
pub fn resolve_agent_scope(agent_id: &str) -> String {
    format!("agent:{}", normalize_agent_id(agent_id))
}

/// Scope string owning platform-wide data.
pub fn resolve_admin_scope() -> String {
    "admin".to_string()
}

/// Derive the effective scope for a request.
///
/// An explicitly supplied non-blank scope wins verbatim (trimmed). Otherwise
/// operators land in the admin scope and actors with an agent id land in
/// their own agent scope. `None` means the caller must reject the request.
pub fn resolve_actor_scope(actor: &Actor, requested: Option<&str>) -> Option<String> {
    if let Some(scope) = requested {
        let trimmed = scope.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    match actor {
        Actor::Operator => Some(resolve_admin_scope()),
        Actor::Agent { agent_id, .. } => Some(resolve_agent_scope(agent_id)),
        Actor::System { agent_id, .. } => {
            agent_id.as_deref().map(resolve_agent_scope)
        }
    }
}

/// Whether the actor may operate on the given scope.
pub fn is_scope_allowed(actor: &Actor, scope: &str) -> bool {
    match actor {
        Actor::Operator => true,
        Actor::System { .. } => true,
        Actor::Agent { agent_id, .. } => scope == resolve_agent_scope(agent_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_scope_is_normalized() {
        assert_eq!(resolve_agent_scope("  Main "), "agent:main");
    }

    #[test]
    fn explicit_scope_wins_verbatim() {
        let actor = Actor::agent("main");
        assert_eq!(
            resolve_actor_scope(&actor, Some("  admin ")),
            Some("admin".to_string())
        );
    }

    #[test]
    fn blank_requested_scope_falls_back() {
        let actor = Actor::agent("main");
        assert_eq!(
            resolve_actor_scope(&actor, Some("   ")),
            Some("agent:main".to_string())
        );
    }

    #[test]
    fn operator_defaults_to_admin() {
        assert_eq!(
            resolve_actor_scope(&Actor::Operator, None),
            Some("admin".to_string())
        );
    }

    #[test]
    fn system_without_agent_has_no_scope() {
        assert_eq!(resolve_actor_scope(&Actor::system(), None), None);
    }

    #[test]
    fn system_with_agent_gets_agent_scope() {
        let actor = Actor::System {
            agent_id: Some("main".to_string()),
            session_key: None,
        };
        assert_eq!(
            resolve_actor_scope(&actor, None),
            Some("agent:main".to_string())
        );
    }

    #[test]
    fn agent_is_allowed_only_on_own_scope() {
        let actor = Actor::agent("main");
        assert!(is_scope_allowed(&actor, "agent:main"));
        assert!(!is_scope_allowed(&actor, "agent:other"));
        assert!(!is_scope_allowed(&actor, "admin"));
    }

    #[test]
    fn operator_and_system_are_allowed_everywhere() {
        for scope in ["admin", "agent:main", "agent:other"] {
            assert!(is_scope_allowed(&Actor::Operator, scope));
            assert!(is_scope_allowed(&Actor::system(), scope));
        }
    }
}
