//! P39: Popper Falsification Gate — given a recommendation, generate
//! falsification conditions independently in parallel, dedupe them
//! mechanically, search evidence for each condition in parallel, then render
//! a mechanical verdict per condition (SURVIVES | WEAKENED | FALSIFIED).
//!
//! A meta protocol: it never reaches an agent-identity call with tool
//! access (the evidence-search stage is identity-free, like
//! [`crate::engine::stage::mechanical_stage`]), so `tools_enabled = false`
//! in the registry.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::engine::agents::Agent;
use crate::engine::blackboard::{Blackboard, BlackboardEntry};
use crate::engine::gateway::CompletionRequest;
use crate::engine::orchestrator::{NamedOutput, ProtocolDef, ProtocolResult, ProtocolResultVariant, StageDescriptor};
use crate::engine::prompt;
use crate::engine::stage::{compute_stage, mechanical_stage, parallel_agent_stage, ParseFn, StageConfig, StageFn};
use crate::engine::trigger;

use super::{json_util, text_of};

const CONDITION_GENERATION_PROMPT: &str = "\
Given the recommendation below, propose specific, observable conditions that — if found true — would \
falsify it. Output a JSON object: {{\"conditions\": [{{\"description\": ..., \"would_falsify_if\": ...}}]}}.

Recommendation: {question}";

const VERDICT_PROMPT: &str = "\
For each falsification condition below, decide whether the gathered evidence confirms it is true \
(FALSIFIED), partially supports it (WEAKENED), or fails to support it (SURVIVES). Output a JSON object: \
{{\"verdicts\": [{{\"condition_id\": ..., \"verdict\": \"SURVIVES\"|\"WEAKENED\"|\"FALSIFIED\", \
\"reasoning\": ...}}], \"overall\": \"SURVIVES\"|\"WEAKENED\"|\"FALSIFIED\"}}.

CONDITIONS AND EVIDENCE:
{input}";

const SYNTHESIS_PROMPT: &str = "\
Render the final falsification verdict for the recommendation below: state the overall verdict, then \
walk through each condition and the evidence that drove its individual verdict.

Recommendation: {question}

VERDICT:
{verdict}";

pub fn build() -> ProtocolDef {
    let verdict_parse: ParseFn = Arc::new(|text| json_util::parse_json_object(text));
    ProtocolDef {
        protocol_id: "popper-falsification".to_string(),
        stages: vec![
            StageDescriptor::new(
                "conditions_raw",
                trigger::always(),
                parallel_agent_stage("question", "conditions_raw", CONDITION_GENERATION_PROMPT),
            ),
            StageDescriptor::new(
                "conditions",
                trigger::after("conditions_raw"),
                compute_stage("conditions_raw", "conditions", dedupe_conditions),
            ),
            StageDescriptor::new("evidence", trigger::after("conditions"), evidence_search_stage()),
            StageDescriptor::new(
                "verdict",
                trigger::after("evidence"),
                mechanical_stage("evidence", "verdict", VERDICT_PROMPT, Some(verdict_parse)),
            ),
            StageDescriptor::new("synthesis", trigger::after("verdict"), verdict_synthesis_stage()),
        ],
    }
}

/// Each free-text `conditions_raw` entry is an agent's own JSON object; the
/// one unfiltered subtlety is that `parallel_agent_stage` writes each
/// agent's raw completion text, so this stage re-parses it before
/// deduplicating by lowercase description, re-indexing `C1..Cn`.
fn dedupe_conditions(entries: &[BlackboardEntry]) -> Option<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    let mut idx = 1usize;
    for entry in entries {
        let parsed = json_util::parse_json_object(&text_of(&entry.content));
        let Some(Value::Array(items)) = parsed.get("conditions").cloned() else { continue };
        for item in items {
            let desc = item.get("description").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
            if desc.is_empty() || !seen.insert(desc) {
                continue;
            }
            out.push(serde_json::json!({
                "id": format!("C{idx}"),
                "description": item.get("description").and_then(Value::as_str).unwrap_or(""),
                "would_falsify_if": item.get("would_falsify_if").and_then(Value::as_str).unwrap_or(""),
            }));
            idx += 1;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Array(out))
    }
}

/// One identity-free search call per deduplicated condition, in parallel.
/// No tool access (meta protocol), so this is a plain orchestration-model
/// call, like [`crate::engine::stage::mechanical_stage`] but run once per
/// condition instead of once over the whole input topic.
fn evidence_search_stage() -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let conditions = match bb.read_latest("conditions", None) {
                Some(e) => match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                },
                None => vec![],
            };
            if conditions.is_empty() {
                return;
            }

            let mut handles = Vec::with_capacity(conditions.len());
            for condition in conditions {
                let bb = bb.clone();
                let config = config.clone();
                handles.push(tokio::spawn(async move {
                    let cond_id = condition.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                    let desc = condition.get("description").and_then(Value::as_str).unwrap_or("");
                    let would_falsify_if = condition.get("would_falsify_if").and_then(Value::as_str).unwrap_or("");
                    let prompt = format!(
                        "Search for evidence bearing on the following falsification condition and summarize what \
you find, noting whether it supports or contradicts the condition.\n\nCondition {cond_id}: {desc}\n\
Would falsify if: {would_falsify_if}"
                    );
                    let agent = Agent::new("system", "system", "");
                    let outcome = config
                        .gateway
                        .complete(
                            CompletionRequest {
                                agent: &agent,
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
                        let mut metadata = HashMap::new();
                        metadata.insert(
                            "token_usage".to_string(),
                            serde_json::json!({
                                "input_tokens": outcome.input_tokens,
                                "output_tokens": outcome.output_tokens,
                            }),
                        );
                        bb.write(
                            "evidence",
                            serde_json::json!({
                                "condition_id": cond_id,
                                "description": desc,
                                "would_falsify_if": would_falsify_if,
                                "findings": outcome.text,
                            }),
                            "system",
                            "evidence",
                            metadata,
                        );
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

fn verdict_synthesis_stage() -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let verdict = match bb.read_latest("verdict", None) {
                Some(e) => e.content,
                None => return,
            };
            let verdict_json = serde_json::to_string_pretty(&verdict).unwrap_or_default();

            let agent = Agent::new("system", "system", "");
            let prompt = prompt::expand_owned(SYNTHESIS_PROMPT, &[("question", question.as_str()), ("verdict", verdict_json.as_str())]);

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
    let mut outputs = Vec::new();
    if let Some(e) = bb.read_latest("conditions", None) {
        outputs.push(NamedOutput { name: "conditions".to_string(), output: e.content.to_string() });
    }
    for e in bb.read("evidence", None) {
        let name = e.content.get("condition_id").and_then(Value::as_str).unwrap_or("evidence").to_string();
        outputs.push(NamedOutput { name, output: e.content.to_string() });
    }
    if let Some(e) = bb.read_latest("verdict", None) {
        outputs.push(NamedOutput { name: "verdict".to_string(), output: e.content.to_string() });
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
    fn build_has_five_stages() {
        let protocol = build();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["conditions_raw", "conditions", "evidence", "verdict", "synthesis"]);
    }

    #[test]
    fn dedupe_conditions_reindexes_and_drops_duplicate_descriptions() {
        let bb = Blackboard::new("popper-falsification");
        bb.write(
            "conditions_raw",
            Value::String(r#"{"conditions": [{"description": "Revenue drops below forecast", "would_falsify_if": "Q3 actuals miss by 20%"}]}"#.to_string()),
            "CFO",
            "conditions_raw",
            Default::default(),
        );
        bb.write(
            "conditions_raw",
            Value::String(r#"{"conditions": [{"description": "revenue drops below forecast", "would_falsify_if": "dup"}]}"#.to_string()),
            "COO",
            "conditions_raw",
            Default::default(),
        );
        let entries = bb.read("conditions_raw", None);
        let deduped = dedupe_conditions(&entries).unwrap();
        let items = deduped.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "C1");
    }

    #[test]
    fn extract_includes_conditions_evidence_and_verdict() {
        let bb = Blackboard::new("popper-falsification");
        bb.write("conditions", serde_json::json!([{"id": "C1", "description": "x"}]), "system", "conditions", Default::default());
        bb.write(
            "evidence",
            serde_json::json!({"condition_id": "C1", "findings": "no support found"}),
            "system",
            "evidence",
            Default::default(),
        );
        bb.write(
            "verdict",
            serde_json::json!({"verdicts": [{"condition_id": "C1", "verdict": "SURVIVES"}], "overall": "SURVIVES"}),
            "system",
            "verdict",
            Default::default(),
        );
        let result = extract(&bb);
        match result.variant {
            ProtocolResultVariant::Stages(outputs) => {
                assert_eq!(outputs.len(), 3);
                assert!(outputs.iter().any(|o| o.name == "C1"));
                assert!(outputs.iter().any(|o| o.name == "verdict"));
            }
            _ => panic!("expected Stages variant"),
        }
    }
}
