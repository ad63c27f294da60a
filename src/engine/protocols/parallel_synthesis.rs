//! P03: Parallel Synthesis — the baseline family.
//!
//! Every agent answers independently, in parallel; one synthesis stage
//! merges the perspectives into a single recommendation. No tool use —
//! this family is a structural no-tools meta-protocol.

use crate::engine::blackboard::Blackboard;
use crate::engine::orchestrator::{NamedResponse, ProtocolDef, ProtocolResult, ProtocolResultVariant, StageDescriptor};
use crate::engine::stage::{parallel_agent_stage, synthesis_stage};
use crate::engine::trigger;

use super::text_of;

const PERSPECTIVE_PROMPT: &str =
    "Answer the following question from your role's perspective. Be specific and concrete.\n\nQuestion: {question}";
const SYNTHESIS_PROMPT: &str =
    "Synthesize the perspectives below into one coherent, actionable recommendation.\n\nQuestion: {question}\n\nPerspectives:\n{perspectives}";

pub fn build() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "parallel-synthesis".to_string(),
        stages: vec![
            StageDescriptor::new(
                "perspectives",
                trigger::always(),
                parallel_agent_stage("question", "perspectives", PERSPECTIVE_PROMPT),
            ),
            StageDescriptor::new(
                "final",
                trigger::after("perspectives"),
                synthesis_stage(vec!["perspectives".to_string()], "final", SYNTHESIS_PROMPT),
            ),
        ],
    }
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let items: Vec<NamedResponse> = bb
        .read("perspectives", None)
        .into_iter()
        .map(|e| NamedResponse {
            name: e.author,
            response: text_of(&e.content),
        })
        .collect();
    let synthesis = bb.read_latest("final", None).map(|e| text_of(&e.content));
    ProtocolResult {
        variant: ProtocolResultVariant::Perspectives(items),
        synthesis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_has_two_stages() {
        let protocol = build();
        assert_eq!(protocol.stages.len(), 2);
        assert_eq!(protocol.stages[0].name, "perspectives");
        assert_eq!(protocol.stages[1].name, "final");
    }

    #[test]
    fn extract_yields_perspectives_variant() {
        let bb = Blackboard::new("parallel-synthesis");
        bb.write(
            "perspectives",
            serde_json::Value::String("answer".to_string()),
            "CFO",
            "perspectives",
            Default::default(),
        );
        let result = extract(&bb);
        match result.variant {
            ProtocolResultVariant::Perspectives(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].name, "CFO");
            }
            _ => panic!("expected Perspectives variant"),
        }
    }
}
