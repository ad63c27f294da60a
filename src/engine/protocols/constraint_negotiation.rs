//! P05/P21: Constraint Negotiation — agents state positions, a mechanical
//! pass extracts their hard/soft constraints, then a revision round lets
//! each agent negotiate against the full constraint set before synthesis.
//!
//! One extraction call runs per proposal, tagging each declared constraint
//! with its proposal's author and a hard/soft strength; the revision round
//! then shows each agent the full constraint table minus its own entries.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::engine::agents::Agent;
use crate::engine::blackboard::Blackboard;
use crate::engine::gateway::CompletionRequest;
use crate::engine::orchestrator::{NamedResponse, ProtocolDef, ProtocolResult, ProtocolResultVariant, RoundResult, StageDescriptor};
use crate::engine::prompt;
use crate::engine::stage::{parallel_agent_stage, parallel_agent_stage_with_context, synthesis_stage, StageFn};
use crate::engine::trigger;

use super::{json_util, text_of};

const OPENING_PROMPT: &str =
    "State your position and requirements on the following question. Be explicit about what you need.\n\nQuestion: {question}";
const REVISION_PROMPT: &str =
    "Revise your position given the constraints other parties have declared. Try to find common ground\
     without abandoning your non-negotiable (hard) requirements.\n\nQuestion: {question}\n\nPrior positions and declared constraints:\n{prior_arguments}";
const SYNTHESIS_PROMPT: &str =
    "Summarize the negotiated agreement: what was resolved, what hard constraints remain unresolved, and\
     the recommended path forward.\n\nFinal positions:\n{proposals_revision}\n\nDeclared constraints:\n{constraints}";

const CONSTRAINT_EXTRACTION_PROMPT: &str = "\
Extract constraints from the following proposal. A constraint is a specific requirement, limit, or \
condition that the author insists on.

For each constraint, provide:
- \"source_role\": the role name of the author (given below)
- \"constraint_type\": one of budget, timeline, resource, technical, regulatory, strategic, operational
- \"description\": what the constraint requires
- \"value\": the specific threshold, deadline, or metric (or \"N/A\" if qualitative)
- \"strength\": \"hard\" if non-negotiable/must-have, \"soft\" if preferred/flexible

Output as a JSON array. If no constraints found, output [].

AUTHOR ROLE: {role_name}

PROPOSAL TEXT:
{proposal_text}";

pub fn build() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "constraint-negotiation".to_string(),
        stages: vec![
            StageDescriptor::new(
                "proposals_opening",
                trigger::always(),
                parallel_agent_stage("question", "proposals_opening", OPENING_PROMPT),
            ),
            StageDescriptor::new(
                "constraints_opening",
                trigger::after("proposals_opening"),
                constraint_extraction_stage("proposals_opening", "constraints", "constraints_opening"),
            ),
            StageDescriptor::new(
                "proposals_revision",
                trigger::after("constraints_opening"),
                parallel_agent_stage_with_context(
                    vec!["proposals_opening".to_string(), "constraints".to_string()],
                    "proposals_revision",
                    REVISION_PROMPT,
                    vec![],
                ),
            ),
            StageDescriptor::new(
                "constraints_revision",
                trigger::after("proposals_revision"),
                constraint_extraction_stage("proposals_revision", "constraints", "constraints_revision"),
            ),
            StageDescriptor::new(
                "synthesis",
                trigger::after("constraints_revision"),
                synthesis_stage(
                    vec!["proposals_revision".to_string(), "constraints".to_string()],
                    "synthesis",
                    SYNTHESIS_PROMPT,
                ),
            ),
        ],
    }
}

/// One extraction call per entry on `topic_in`, tagged with that entry's
/// author, writing the resulting constraint array to `topic_out` under
/// blackboard-stage `stage_name` (distinct from `topic_out` so two
/// extraction passes over the same topic can be triggered independently).
fn constraint_extraction_stage(topic_in: &'static str, topic_out: &'static str, stage_name: &'static str) -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let entries = bb.read(topic_in, None);
            if entries.is_empty() {
                return;
            }

            let mut handles = Vec::with_capacity(entries.len());
            for entry in entries {
                let bb = bb.clone();
                let config = config.clone();
                handles.push(tokio::spawn(async move {
                    let proposal_text = text_of(&entry.content);
                    let prompt = prompt::expand_owned(
                        CONSTRAINT_EXTRACTION_PROMPT,
                        &[("role_name", entry.author.as_str()), ("proposal_text", proposal_text.as_str())],
                    );
                    let caller = Agent::new("system", "system", "");
                    let outcome = config
                        .gateway
                        .complete(
                            CompletionRequest {
                                agent: &caller,
                                fallback_model: &config.orchestration_model,
                                messages: vec![Message {
                                    role: Role::User,
                                    content: Arc::from(prompt.as_str()),
                                    tool_calls: vec![],
                                }],
                                max_tokens: 2048,
                                system_override: Some(""),
                                tools: None,
                            },
                            &config.ctx,
                        )
                        .await;

                    if let Ok(outcome) = outcome {
                        let constraints = json_util::parse_json_array(&outcome.text);
                        bb.write(
                            topic_out,
                            Value::Array(constraints),
                            entry.author.clone(),
                            stage_name,
                            HashMap::new(),
                        );
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let round_of = |topic: &str, round: usize| RoundResult {
        round,
        responses: bb
            .read(topic, None)
            .into_iter()
            .map(|e| NamedResponse {
                name: e.author,
                response: text_of(&e.content),
            })
            .collect(),
    };
    let rounds = vec![round_of("proposals_opening", 1), round_of("proposals_revision", 2)];
    let synthesis = bb.read_latest("synthesis", None).map(|e| text_of(&e.content));
    ProtocolResult {
        variant: ProtocolResultVariant::Rounds(rounds),
        synthesis,
    }
}

/// Every hard constraint declared across both rounds, deduplicated by
/// (source_role, description). Exposed for a caller that wants to surface
/// unresolved hard requirements directly rather than through the synthesis
/// prose.
pub fn hard_constraints(bb: &Blackboard) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for entry in bb.read("constraints", None) {
        if let Value::Array(items) = &entry.content {
            for item in items {
                if item.get("strength").and_then(Value::as_str) == Some("hard") {
                    let key = format!(
                        "{}|{}",
                        item.get("source_role").and_then(Value::as_str).unwrap_or(""),
                        item.get("description").and_then(Value::as_str).unwrap_or("")
                    );
                    if seen.insert(key) {
                        out.push(item.clone());
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_has_five_stages() {
        let protocol = build();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["proposals_opening", "constraints_opening", "proposals_revision", "constraints_revision", "synthesis"]
        );
    }

    #[test]
    fn hard_constraints_are_deduplicated() {
        let bb = Blackboard::new("constraint-negotiation");
        let item = serde_json::json!([{"source_role": "CFO", "description": "budget cap", "strength": "hard"}]);
        bb.write("constraints", item.clone(), "CFO", "constraints_opening", Default::default());
        bb.write("constraints", item, "CFO", "constraints_revision", Default::default());
        assert_eq!(hard_constraints(&bb).len(), 1);
    }
}
