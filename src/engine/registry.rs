//! Protocol registry — resolves a `protocol_key` to its orchestrator.
//!
//! An explicit registry rather than directory-scanning or reflection: every
//! protocol module contributes one [`ProtocolRecord`] at [`build_registry`]
//! time, keyed by a stable string the run controller looks up directly.

use std::collections::HashMap;

use crate::engine::blackboard::Blackboard;
use crate::engine::orchestrator::{ProtocolDef, ProtocolResult};
use crate::engine::protocols;

/// A manifest entry plus the two functions that build and extract a
/// protocol run, mirroring the `/api/protocols` response shape the HTTP
/// surface exposes.
pub struct ProtocolRecord {
    pub key: &'static str,
    pub protocol_id: &'static str,
    pub name: &'static str,
    pub category: &'static str,
    pub problem_types: &'static [&'static str],
    pub cost_tier: &'static str,
    pub min_agents: usize,
    pub max_agents: usize,
    pub supports_rounds: bool,
    pub description: &'static str,
    pub when_to_use: &'static str,
    pub when_not_to_use: &'static str,
    /// Computed once at registration rather than left to the manifest
    /// generator to enforce. `false` for protocols whose stages never reach
    /// an agent-identity call with tool access — the meta/no-tools families.
    pub tools_enabled: bool,
    pub build: fn() -> ProtocolDef,
    pub extract: fn(&Blackboard) -> ProtocolResult,
}

/// Build the registry once at startup. Keyed by `key`; lookups are O(1).
pub fn build_registry() -> HashMap<&'static str, ProtocolRecord> {
    let records = vec![
        ProtocolRecord {
            key: "parallel-synthesis",
            protocol_id: "parallel-synthesis",
            name: "Parallel Synthesis",
            category: "baseline",
            problem_types: &["general"],
            cost_tier: "low",
            min_agents: 2,
            max_agents: 12,
            supports_rounds: false,
            description: "Every agent answers independently; a synthesis stage merges the perspectives.",
            when_to_use: "Quick multi-perspective read on a question with no need for agents to react to each other.",
            when_not_to_use: "When positions need to evolve through confrontation — use multi-round-debate instead.",
            tools_enabled: false,
            build: protocols::parallel_synthesis::build,
            extract: protocols::parallel_synthesis::extract,
        },
        ProtocolRecord {
            key: "multi-round-debate",
            protocol_id: "multi-round-debate",
            name: "Multi-Round Debate",
            category: "adversarial",
            problem_types: &["strategy", "risk"],
            cost_tier: "medium",
            min_agents: 2,
            max_agents: 8,
            supports_rounds: false,
            description: "Opening statements, a rebuttal round, final statements, then synthesis.",
            when_to_use: "Questions with genuinely opposed stakeholder interests.",
            when_not_to_use: "When agents mostly agree — the rebuttal round adds cost without signal.",
            tools_enabled: true,
            build: protocols::debate::build,
            extract: protocols::debate::extract,
        },
        ProtocolRecord {
            key: "constraint-negotiation",
            protocol_id: "constraint-negotiation",
            name: "Constraint Negotiation",
            category: "negotiation",
            problem_types: &["resource-allocation", "planning"],
            cost_tier: "medium",
            min_agents: 2,
            max_agents: 8,
            supports_rounds: false,
            description: "Agents state positions, declare constraints, then negotiate a revision round.",
            when_to_use: "Multi-party resource or scope tradeoffs with explicit hard/soft requirements.",
            when_not_to_use: "Single-stakeholder decisions with nothing to negotiate.",
            tools_enabled: true,
            build: protocols::constraint_negotiation::build,
            extract: protocols::constraint_negotiation::extract,
        },
        ProtocolRecord {
            key: "ach",
            protocol_id: "ach",
            name: "Analysis of Competing Hypotheses",
            category: "analytic",
            problem_types: &["diagnosis", "root-cause"],
            cost_tier: "high",
            min_agents: 2,
            max_agents: 8,
            supports_rounds: false,
            description: "Generate hypotheses and evidence, score a matrix, eliminate the least-supported.",
            when_to_use: "Root-cause or threat-assessment questions with several plausible explanations.",
            when_not_to_use: "When only one hypothesis is plausible — the matrix adds cost with no discrimination.",
            tools_enabled: true,
            build: protocols::ach::build,
            extract: protocols::ach::extract,
        },
        ProtocolRecord {
            key: "red-blue-white",
            protocol_id: "red-blue-white",
            name: "Red/Blue/White Team",
            category: "adversarial",
            problem_types: &["security", "risk"],
            cost_tier: "high",
            min_agents: 3,
            max_agents: 12,
            supports_rounds: false,
            description: "Red attacks a plan, Blue defends, White adjudicates each pair and renders a verdict.",
            when_to_use: "Stress-testing a concrete plan for exploitable weaknesses.",
            when_not_to_use: "Open-ended strategy questions with no concrete plan to attack yet.",
            tools_enabled: true,
            build: protocols::red_blue_white::build,
            extract: protocols::red_blue_white::extract,
        },
        ProtocolRecord {
            key: "premortem",
            protocol_id: "premortem",
            name: "Klein Pre-Mortem",
            category: "analytic",
            problem_types: &["risk", "planning"],
            cost_tier: "medium",
            min_agents: 2,
            max_agents: 8,
            supports_rounds: false,
            description: "Imagine the plan has already failed; extract convergent vs. unique failure modes.",
            when_to_use: "Before committing to a plan, to surface blind spots across roles.",
            when_not_to_use: "Post-mortems on something that already happened — use a retrospective instead.",
            tools_enabled: true,
            build: protocols::premortem::build,
            extract: protocols::premortem::extract,
        },
        ProtocolRecord {
            key: "causal-loop-mapping",
            protocol_id: "causal-loop-mapping",
            name: "Causal Loop Mapping",
            category: "systems",
            problem_types: &["systemic", "root-cause"],
            cost_tier: "high",
            min_agents: 2,
            max_agents: 8,
            supports_rounds: false,
            description: "Extract variables and causal links, trace feedback loops, find leverage points.",
            when_to_use: "Questions driven by feedback dynamics rather than a single linear cause.",
            when_not_to_use: "Simple questions with an obvious, non-cyclical cause.",
            tools_enabled: true,
            build: protocols::causal_loop::build,
            extract: protocols::causal_loop::extract,
        },
        ProtocolRecord {
            key: "cynefin-probe",
            protocol_id: "cynefin-probe",
            name: "Cynefin Probe",
            category: "framework",
            problem_types: &["sense-making"],
            cost_tier: "medium",
            min_agents: 2,
            max_agents: 8,
            supports_rounds: false,
            description: "Classify the question's Cynefin domain, then respond with the domain-appropriate move.",
            when_to_use: "Ambiguous problems where the right approach depends on how well-understood the system is.",
            when_not_to_use: "Clearly simple/obvious problems that don't need a domain classification step.",
            tools_enabled: true,
            build: protocols::cynefin::build,
            extract: protocols::cynefin::extract,
        },
        ProtocolRecord {
            key: "delphi-method",
            protocol_id: "delphi-method",
            name: "Delphi Estimation",
            category: "estimation",
            problem_types: &["forecasting", "estimation"],
            cost_tier: "high",
            min_agents: 3,
            max_agents: 12,
            supports_rounds: true,
            description: "Rounds of anonymized point+range estimates, converging once spread/median < 0.15.",
            when_to_use: "Quantitative forecasts where anchoring on named positions would bias convergence.",
            when_not_to_use: "Qualitative questions with no single number to converge on.",
            tools_enabled: true,
            build: protocols::delphi::build,
            extract: protocols::delphi::extract,
        },
        ProtocolRecord {
            key: "vickrey-auction",
            protocol_id: "vickrey-auction",
            name: "Vickrey Auction",
            category: "voting",
            problem_types: &["prioritization"],
            cost_tier: "medium",
            min_agents: 2,
            max_agents: 12,
            supports_rounds: false,
            description: "Sealed confidence bids; the winner pays the second-highest price and re-justifies.",
            when_to_use: "Choosing among discrete options where agents should reveal true confidence.",
            when_not_to_use: "When ranking (not picking one winner) is what's actually needed — use Borda.",
            tools_enabled: false,
            build: protocols::voting::build_vickrey,
            extract: protocols::voting::extract_vickrey,
        },
        ProtocolRecord {
            key: "borda-count",
            protocol_id: "borda-count",
            name: "Borda Count",
            category: "voting",
            problem_types: &["prioritization"],
            cost_tier: "low",
            min_agents: 2,
            max_agents: 12,
            supports_rounds: false,
            description: "Sealed ranked-choice ballots tallied by Borda points, synthesis over the full ranking.",
            when_to_use: "Ranking several options where every agent should weigh in on the full order.",
            when_not_to_use: "Binary choices — a simple majority vote is cheaper and equally informative.",
            tools_enabled: false,
            build: protocols::voting::build_borda,
            extract: protocols::voting::extract_borda,
        },
        ProtocolRecord {
            key: "condorcet-method",
            protocol_id: "condorcet-method",
            name: "Condorcet Method",
            category: "voting",
            problem_types: &["prioritization"],
            cost_tier: "low",
            min_agents: 2,
            max_agents: 12,
            supports_rounds: false,
            description: "Sealed ranked-choice ballots tallied by pairwise head-to-head wins.",
            when_to_use: "Ranking options where pairwise preference, not aggregate points, should decide.",
            when_not_to_use: "Large option sets where a Condorcet cycle is likely and a clear winner is needed fast.",
            tools_enabled: false,
            build: protocols::voting::build_condorcet,
            extract: protocols::voting::extract_condorcet,
        },
        ProtocolRecord {
            key: "boyd-ooda",
            protocol_id: "boyd-ooda",
            name: "OODA Loop",
            category: "framework",
            problem_types: &["fast-decision"],
            cost_tier: "medium",
            min_agents: 1,
            max_agents: 8,
            supports_rounds: true,
            description: "Short observe-orient-decide-act cycles, each threading the prior act into the next observe.",
            when_to_use: "Fast-moving situations needing iterated, compressed decision cycles.",
            when_not_to_use: "Slow, high-stakes decisions where one thorough pass beats several quick ones.",
            tools_enabled: true,
            build: protocols::ooda::build,
            extract: protocols::ooda::extract,
        },
        ProtocolRecord {
            key: "six-hats",
            protocol_id: "six-hats",
            name: "Six Thinking Hats",
            category: "framework",
            problem_types: &["ideation", "evaluation"],
            cost_tier: "high",
            min_agents: 1,
            max_agents: 8,
            supports_rounds: false,
            description: "Seven sequential phases wearing the same stance across all agents.",
            when_to_use: "Exploring a question from deliberately distinct thinking modes in sequence.",
            when_not_to_use: "When role-specific perspective (not shared stance) is what matters — use parallel-synthesis.",
            tools_enabled: true,
            build: protocols::six_hats::build,
            extract: protocols::six_hats::extract,
        },
        ProtocolRecord {
            key: "popper-falsification",
            protocol_id: "popper-falsification",
            name: "Falsification Gate",
            category: "analytic",
            problem_types: &["validation"],
            cost_tier: "high",
            min_agents: 2,
            max_agents: 8,
            supports_rounds: false,
            description: "Generate falsification conditions for a recommendation, search evidence, render a verdict.",
            when_to_use: "Stress-testing a specific recommendation against the conditions that would disprove it.",
            when_not_to_use: "Open-ended exploration with no concrete recommendation yet to falsify.",
            tools_enabled: false,
            build: protocols::falsification_gate::build,
            extract: protocols::falsification_gate::extract,
        },
    ];

    records.into_iter().map(|r| (r.key, r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_declared_key() {
        let registry = build_registry();
        assert_eq!(registry.len(), 15);
        assert!(registry.contains_key("parallel-synthesis"));
        assert!(registry.contains_key("condorcet-method"));
    }

    #[test]
    fn meta_protocols_have_tools_disabled() {
        let registry = build_registry();
        assert!(!registry["parallel-synthesis"].tools_enabled);
        assert!(!registry["popper-falsification"].tools_enabled);
        assert!(!registry["vickrey-auction"].tools_enabled);
    }
}
