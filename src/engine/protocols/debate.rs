//! P04: Multi-Round Debate — opening statements, a rebuttal round, final
//! statements, then a synthesis of the evolved positions.
//!
//! Later rounds build on every prior round's arguments, filtered through
//! each reader's declared scope via `Blackboard::read`'s existing scope
//! filter, since every agent's own perspective output is already tagged
//! with its `primary_scope()` by the stage executor.

use crate::engine::blackboard::Blackboard;
use crate::engine::orchestrator::{NamedResponse, ProtocolDef, ProtocolResult, ProtocolResultVariant, RoundResult, StageDescriptor};
use crate::engine::stage::{parallel_agent_stage_with_context, synthesis_stage};
use crate::engine::trigger;

use super::text_of;

const OPENING_PROMPT: &str = "Give your opening statement on the following question.\n\nQuestion: {question}";
const REBUTTAL_PROMPT: &str =
    "Respond to the opening statements below. Identify where you agree, disagree, and why.\n\nQuestion: {question}\n\nOpening statements:\n{prior_arguments}";
const FINAL_PROMPT: &str =
    "Give your final statement, taking the debate so far into account.\n\nQuestion: {question}\n\nDebate so far:\n{prior_arguments}";
const SYNTHESIS_PROMPT: &str =
    "Synthesize this multi-round debate into a final, actionable conclusion.\n\nQuestion: {question}\n\nFull transcript:\n{opening}\n\n{rebuttal}\n\n{final_round}";

const ROUND_TOPICS: [&str; 3] = ["opening", "rebuttal", "final_round"];

pub fn build() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "multi-round-debate".to_string(),
        stages: vec![
            StageDescriptor::new(
                "opening",
                trigger::always(),
                parallel_agent_stage_with_context(vec![], "opening", OPENING_PROMPT, vec![]),
            ),
            StageDescriptor::new(
                "rebuttal",
                trigger::after("opening"),
                parallel_agent_stage_with_context(vec!["opening".to_string()], "rebuttal", REBUTTAL_PROMPT, vec![]),
            ),
            StageDescriptor::new(
                "final_round",
                trigger::after("rebuttal"),
                parallel_agent_stage_with_context(
                    vec!["opening".to_string(), "rebuttal".to_string()],
                    "final_round",
                    FINAL_PROMPT,
                    vec![],
                ),
            ),
            StageDescriptor::new(
                "synthesis",
                trigger::after("final_round"),
                synthesis_stage(
                    vec!["opening".to_string(), "rebuttal".to_string(), "final_round".to_string()],
                    "synthesis",
                    SYNTHESIS_PROMPT,
                ),
            ),
        ],
    }
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let rounds: Vec<RoundResult> = ROUND_TOPICS
        .iter()
        .enumerate()
        .map(|(i, topic)| RoundResult {
            round: i + 1,
            responses: bb
                .read(topic, None)
                .into_iter()
                .map(|e| NamedResponse {
                    name: e.author,
                    response: text_of(&e.content),
                })
                .collect(),
        })
        .collect();
    let synthesis = bb.read_latest("synthesis", None).map(|e| text_of(&e.content));
    ProtocolResult {
        variant: ProtocolResultVariant::Rounds(rounds),
        synthesis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_has_four_stages_in_round_order() {
        let protocol = build();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["opening", "rebuttal", "final_round", "synthesis"]);
    }

    #[test]
    fn extract_yields_three_rounds() {
        let bb = Blackboard::new("multi-round-debate");
        for topic in ROUND_TOPICS {
            bb.write(
                topic,
                serde_json::Value::String("stance".to_string()),
                "A",
                topic,
                Default::default(),
            );
        }
        let result = extract(&bb);
        match result.variant {
            ProtocolResultVariant::Rounds(rounds) => {
                assert_eq!(rounds.len(), 3);
                assert_eq!(rounds[0].round, 1);
                assert_eq!(rounds[2].responses[0].name, "A");
            }
            _ => panic!("expected Rounds variant"),
        }
    }
}
