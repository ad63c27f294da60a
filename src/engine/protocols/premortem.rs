//! P38: Klein Pre-Mortem — imagine the plan has already failed, write
//! independent failure narratives, extract and classify failure modes, then
//! synthesize a mitigation map weighted toward the modes multiple agents
//! converged on.
//!
//! Phase 3's narrative-combining step reuses [`mechanical_stage`] verbatim —
//! its `"=== {author} ===\n{content}"` join is exactly the format the
//! extraction prompt expects.

use std::sync::Arc;

use serde_json::Value;

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::engine::agents::Agent;
use crate::engine::blackboard::Blackboard;
use crate::engine::gateway::CompletionRequest;
use crate::engine::orchestrator::{NamedOutput, ProtocolDef, ProtocolResult, ProtocolResultVariant, StageDescriptor};
use crate::engine::prompt;
use crate::engine::stage::{mechanical_stage, parallel_agent_stage, ParseFn, StageFn};
use crate::engine::trigger;

use super::{json_util, text_of};

const TIME_HORIZON: &str = "18 months";

const FAILURE_NARRATIVE_PROMPT: &str = "\
It is 18 months from now and the plan described below has completely failed. Write a narrative, from \
your role's perspective, explaining in vivid and specific detail how and why it failed.

Question: {question}";

const FAILURE_EXTRACTION_PROMPT: &str = "\
Read the independent failure narratives below. Extract the distinct failure modes described, tagging \
each as \"convergent\" (named by more than one narrative) or \"unique\" (named by only one). Also list \
any overlooked signals the narratives mention that were visible in hindsight. Output a JSON object: \
{{\"failure_modes\": [{{\"type\": ..., \"description\": ..., \"sources\": [...]}}], \
\"overlooked_signals\": [...]}}.

NARRATIVES:
{input}";

const MITIGATION_SYNTHESIS_PROMPT: &str = "\
Synthesize a mitigation map for the plan below, addressing convergent failure modes first, then unique \
ones, and proposing an early-warning signal for each overlooked signal.

Question: {question}
Time horizon: {time_horizon}

FAILURE MODES (convergent first):
{failure_modes_json}

OVERLOOKED SIGNALS:
{overlooked_signals}";

pub fn build() -> ProtocolDef {
    let extract_parse: ParseFn = Arc::new(|text| json_util::parse_json_object(text));
    ProtocolDef {
        protocol_id: "premortem".to_string(),
        stages: vec![
            StageDescriptor::new("narratives", trigger::always(), parallel_agent_stage("question", "narratives", FAILURE_NARRATIVE_PROMPT)),
            StageDescriptor::new(
                "failure_modes",
                trigger::after("narratives"),
                mechanical_stage("narratives", "failure_modes", FAILURE_EXTRACTION_PROMPT, Some(extract_parse)),
            ),
            StageDescriptor::new("synthesis", trigger::after("failure_modes"), mitigation_synthesis_stage()),
        ],
    }
}

fn mitigation_synthesis_stage() -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let extraction = match bb.read_latest("failure_modes", None) {
                Some(e) => e.content,
                None => return,
            };
            let empty = vec![];
            let mut modes: Vec<Value> = extraction.get("failure_modes").and_then(Value::as_array).unwrap_or(&empty).clone();
            // Convergent first, stable within each group — mirrors `sorted(..., key=...)`.
            modes.sort_by_key(|m| if m.get("type").and_then(Value::as_str) == Some("convergent") { 0 } else { 1 });
            let failure_modes_json = serde_json::to_string_pretty(&modes).unwrap_or_default();

            let signals: Vec<String> = extraction
                .get("overlooked_signals")
                .and_then(Value::as_array)
                .unwrap_or(&empty)
                .iter()
                .filter_map(|s| s.as_str().map(|s| format!("- {s}")))
                .collect();
            let overlooked_signals = signals.join("\n");

            let agent = Agent::new("system", "system", "");
            let prompt = prompt::expand_owned(
                MITIGATION_SYNTHESIS_PROMPT,
                &[
                    ("question", question.as_str()),
                    ("time_horizon", TIME_HORIZON),
                    ("failure_modes_json", failure_modes_json.as_str()),
                    ("overlooked_signals", overlooked_signals.as_str()),
                ],
            );

            let outcome = config
                .gateway
                .complete(
                    CompletionRequest {
                        agent: &agent,
                        fallback_model: &config.thinking_model,
                        messages: vec![Message {
                            role: Role::User,
                            content: Arc::from(prompt.as_str()),
                            tool_calls: vec![],
                        }],
                        max_tokens: config.max_tokens,
                        system_override: Some(""),
                        tools: None,
                    },
                    &config.ctx,
                )
                .await;

            if let Ok(outcome) = outcome {
                bb.write("synthesis", Value::String(outcome.text), "system", "synthesis", Default::default());
            }
        })
    })
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let mut outputs: Vec<NamedOutput> = bb
        .read("narratives", None)
        .into_iter()
        .map(|e| NamedOutput { name: e.author, output: text_of(&e.content) })
        .collect();
    if let Some(e) = bb.read_latest("failure_modes", None) {
        outputs.push(NamedOutput { name: "failure_modes".to_string(), output: e.content.to_string() });
    }
    let synthesis = bb.read_latest("synthesis", None).map(|e| text_of(&e.content));
    ProtocolResult {
        variant: ProtocolResultVariant::Stages(outputs),
        synthesis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_has_three_stages() {
        let protocol = build();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["narratives", "failure_modes", "synthesis"]);
    }

    #[test]
    fn extract_includes_every_narrative_and_the_failure_mode_extraction() {
        let bb = Blackboard::new("premortem");
        bb.write("narratives", serde_json::Value::String("it failed because...".to_string()), "CFO", "narratives", Default::default());
        bb.write("failure_modes", serde_json::json!({"failure_modes": [], "overlooked_signals": []}), "system", "failure_modes", Default::default());
        let result = extract(&bb);
        match result.variant {
            ProtocolResultVariant::Stages(outputs) => {
                assert_eq!(outputs.len(), 2);
                assert_eq!(outputs[0].name, "CFO");
            }
            _ => panic!("expected Stages variant"),
        }
    }
}
