//! P40: Boyd OODA Loop — three short observe-orient-decide-act cycles, each
//! agent threading its own prior cycle's act-decision into the next cycle's
//! observe, then a synthesis across all three.
//!
//! The four named sub-phases per cycle collapse into one call per cycle per
//! agent — a compressed thinking budget, not four round-trips — with the
//! prompt itself walking the agent through observe/orient/decide/act in
//! order, reusing the multi-round-debate family's round-context-threading
//! shape (`parallel_agent_stage_with_context`) rather than introducing a new
//! stage primitive for it.

use crate::engine::blackboard::Blackboard;
use crate::engine::orchestrator::{NamedResponse, ProtocolDef, ProtocolResult, ProtocolResultVariant, RoundResult, StageDescriptor};
use crate::engine::stage::{parallel_agent_stage_with_context, synthesis_stage};
use crate::engine::trigger;

use super::text_of;

const CYCLE_COUNT: usize = 3;

const FIRST_CYCLE_PROMPT: &str = "\
Run one short OODA cycle on the question below. OBSERVE what's immediately relevant, ORIENT by stating \
how it affects your read of the situation, DECIDE a course of action, and ACT by naming the concrete \
move you'd make right now. Keep each part to one or two sentences — this is a fast cycle, not a deep \
analysis.

Question: {question}";

const LATER_CYCLE_PROMPT: &str = "\
Run cycle {cycle_number} of {cycle_count} of your OODA loop. Your own prior cycle's act is below —
OBSERVE what's changed since then, ORIENT by updating your read, DECIDE, and ACT. Keep each part to one \
or two sentences.

Question: {question}

YOUR PRIOR CYCLE:
{prior_arguments}";

const SYNTHESIS_PROMPT: &str = "\
Synthesize the OODA cycles below into a single recommended course of action, noting where agents' \
decisions converged or diverged across cycles.

Question: {question}

CYCLE 1:
{cycle_1}

CYCLE 2:
{cycle_2}

CYCLE 3:
{cycle_3}";

fn cycle_topic(n: usize) -> String {
    format!("cycle_{n}")
}

pub fn build() -> ProtocolDef {
    let mut stages = Vec::with_capacity(CYCLE_COUNT + 1);
    for n in 1..=CYCLE_COUNT {
        let topic = cycle_topic(n);
        let stage = if n == 1 {
            StageDescriptor::new(
                topic.clone(),
                trigger::always(),
                parallel_agent_stage_with_context(vec![], topic, FIRST_CYCLE_PROMPT, vec![]),
            )
        } else {
            let prior_topic = cycle_topic(n - 1);
            StageDescriptor::new(
                topic.clone(),
                trigger::after(prior_topic.clone()),
                parallel_agent_stage_with_context(
                    vec![prior_topic],
                    topic,
                    LATER_CYCLE_PROMPT,
                    vec![
                        ("cycle_number".to_string(), n.to_string()),
                        ("cycle_count".to_string(), CYCLE_COUNT.to_string()),
                    ],
                ),
            )
        };
        stages.push(stage);
    }
    stages.push(StageDescriptor::new(
        "synthesis",
        trigger::after(cycle_topic(CYCLE_COUNT)),
        synthesis_stage(
            (1..=CYCLE_COUNT).map(cycle_topic).collect(),
            "synthesis",
            SYNTHESIS_PROMPT,
        ),
    ));

    ProtocolDef {
        protocol_id: "boyd-ooda".to_string(),
        stages,
    }
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let rounds: Vec<RoundResult> = (1..=CYCLE_COUNT)
        .map(|n| RoundResult {
            round: n,
            responses: bb
                .read(&cycle_topic(n), None)
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
    fn build_has_three_cycles_and_a_synthesis_stage() {
        let protocol = build();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cycle_1", "cycle_2", "cycle_3", "synthesis"]);
    }

    #[test]
    fn cycle_topic_numbers_each_cycle() {
        assert_eq!(cycle_topic(1), "cycle_1");
        assert_eq!(cycle_topic(3), "cycle_3");
    }

    #[test]
    fn extract_yields_three_rounds() {
        let bb = Blackboard::new("boyd-ooda");
        for n in 1..=CYCLE_COUNT {
            bb.write(
                cycle_topic(n),
                serde_json::Value::String(format!("act {n}")),
                "A",
                cycle_topic(n),
                Default::default(),
            );
        }
        let result = extract(&bb);
        match result.variant {
            ProtocolResultVariant::Rounds(rounds) => {
                assert_eq!(rounds.len(), 3);
                assert_eq!(rounds[1].round, 2);
                assert_eq!(rounds[2].responses[0].response, "act 3");
            }
            _ => panic!("expected Rounds variant"),
        }
    }
}
