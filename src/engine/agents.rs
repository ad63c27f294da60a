//! Agent records and the builtin agent registry.
//!
//! A small table of built-in C-suite personas plus a builder that accepts
//! either builtin keys or fully custom records. The store-backed "custom, mutable" half of an
//! agent's lifecycle (HTTP CRUD, prompt-assembly framework/template/style
//! blocks) stays behind the [`crate::engine::store::Store`] boundary; this
//! module only covers constructing an in-memory roster, which every
//! protocol and every test needs regardless of where the record came from.

use std::collections::HashMap;

/// A role-scoped actor participating in a run.
///
/// Immutable for the duration of a single run: stages read `Agent` fields
/// but never mutate them mid-protocol.
#[derive(Debug, Clone)]
pub struct Agent {
    /// Stable key used to look the agent up (e.g. `"cfo"`).
    pub key: String,
    /// Display name surfaced in blackboard entries and events (e.g. `"CFO"`).
    pub name: String,
    /// The agent's system prompt.
    pub system_prompt: String,
    /// Overrides the fallback model when set; routes the call through the
    /// generic multi-provider path in the gateway.
    pub model_id: Option<String>,
    /// Overrides the gateway's default max-output-tokens cap.
    pub max_output_tokens: Option<usize>,
    /// Overrides the gateway's default sampling temperature.
    pub temperature: Option<f32>,
    /// Tool names this agent is allowed to invoke; resolved against an
    /// externally supplied schema registry by the gateway.
    pub tool_names: Vec<String>,
    /// Declared read scopes. `None` means "sees everything" (backward
    /// compatible default).
    pub context_scope: Option<Vec<String>>,
    /// Category tags consumed by a stage's `@category` agent filter.
    pub categories: Vec<String>,
}

impl Agent {
    /// Minimal constructor for a builtin or ad hoc agent; builder methods
    /// below customize optional fields.
    pub fn new(key: impl Into<String>, name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            model_id: None,
            max_output_tokens: None,
            temperature: None,
            tool_names: Vec::new(),
            context_scope: None,
            categories: Vec::new(),
        }
    }

    /// Attach a declared read scope set.
    pub fn with_context_scope(mut self, scopes: Vec<String>) -> Self {
        self.context_scope = Some(scopes);
        self
    }

    /// Attach category tags for `@category` stage filters.
    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    /// Attach a caller-owned model id, routing this agent through the
    /// generic multi-provider gateway path.
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Attach the set of tool names this agent may invoke.
    pub fn with_tools(mut self, tool_names: Vec<String>) -> Self {
        self.tool_names = tool_names;
        self
    }

    /// This agent's primary scope tag, used to tag its own blackboard
    /// writes. Falls back to name-based inference when no explicit scope
    /// is declared.
    pub fn primary_scope(&self) -> String {
        match &self.context_scope {
            Some(scopes) if !scopes.is_empty() => scopes[0].clone(),
            _ => super::scoping::infer_scope_from_name(&self.name).to_string(),
        }
    }
}

/// Build the seven built-in C-suite personas, keyed by lowercase role.
pub fn builtin_agents() -> HashMap<String, Agent> {
    let roster = [
        (
            "ceo",
            "CEO",
            "You are a CEO focused on strategy, vision, competitive positioning, and stakeholder management.",
        ),
        (
            "cfo",
            "CFO",
            "You are a CFO focused on financial risk, cash flow, unit economics, margins, and capital allocation.",
        ),
        (
            "cto",
            "CTO",
            "You are a CTO focused on technical architecture, scalability, security, tech debt, and engineering execution.",
        ),
        (
            "cmo",
            "CMO",
            "You are a CMO focused on market positioning, brand risk, customer acquisition, messaging, and competitive dynamics.",
        ),
        (
            "coo",
            "COO",
            "You are a COO focused on operations, process execution, resource allocation, scaling, and cross-functional coordination.",
        ),
        (
            "cpo",
            "CPO",
            "You are a CPO focused on product-market fit, user needs, roadmap priorities, and competitive differentiation.",
        ),
        (
            "cro",
            "CRO",
            "You are a CRO focused on revenue strategy, pipeline health, sales execution, and go-to-market alignment.",
        ),
    ];

    roster
        .into_iter()
        .map(|(key, name, prompt)| (key.to_string(), Agent::new(key, name, prompt)))
        .collect()
}

/// Build an agent roster from a list of keys, resolving each against the
/// builtin registry. Returns an error listing the first unknown key rather
/// than building a partial roster.
pub fn build_agents(keys: &[String]) -> Result<Vec<Agent>, String> {
    let builtin = builtin_agents();
    let mut agents = Vec::with_capacity(keys.len());
    for key in keys {
        let lower = key.to_lowercase();
        match builtin.get(&lower) {
            Some(agent) => agents.push(agent.clone()),
            None => {
                return Err(format!(
                    "unknown agent: {}. available: {}",
                    key,
                    builtin.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
            }
        }
    }
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_roster_has_seven_roles() {
        assert_eq!(builtin_agents().len(), 7);
    }

    #[test]
    fn build_agents_resolves_known_keys() {
        let agents = build_agents(&["ceo".to_string(), "CFO".to_string()]).unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[1].name, "CFO");
    }

    #[test]
    fn build_agents_rejects_unknown_key() {
        let err = build_agents(&["not-a-role".to_string()]).unwrap_err();
        assert!(err.contains("not-a-role"));
    }
}
