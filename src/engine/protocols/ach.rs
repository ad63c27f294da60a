//! P16: Analysis of Competing Hypotheses — generate hypotheses, generate
//! evidence, score every (agent, evidence) pair against every hypothesis,
//! majority-vote aggregate the scores, eliminate the least-supported
//! hypotheses, then synthesize a sensitivity analysis over what survives.
//!
//! Five phases run in shape: generate → evidence → matrix → eliminate →
//! synthesize. The matrix-scoring fan-out is bounded by a
//! [`tokio::sync::Semaphore`] capped at 8 concurrent calls.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::engine::agents::Agent;
use crate::engine::blackboard::{Blackboard, BlackboardEntry};
use crate::engine::gateway::CompletionRequest;
use crate::engine::orchestrator::{NamedOutput, ProtocolDef, ProtocolResult, ProtocolResultVariant, StageDescriptor};
use crate::engine::prompt;
use crate::engine::stage::{compute_stage, StageConfig, StageFn};
use crate::engine::trigger;

use super::{json_util, text_of};

const MATRIX_CONCURRENCY: usize = 8;

const HYPOTHESIS_GENERATION_PROMPT: &str = "\
Propose distinct, mutually exclusive hypotheses that could answer the following question, from your \
role's perspective. Output a JSON object: {{\"hypotheses\": [{{\"label\": ..., \"description\": ...}}]}}.

Question: {question}

ROLE: {agent_name}
PERSPECTIVE: {system_prompt}";

const EVIDENCE_LISTING_PROMPT: &str = "\
List evidence relevant to evaluating the hypotheses below, from your role's perspective. Output a JSON \
object: {{\"evidence\": [{{\"description\": ...}}]}}.

Question: {question}

HYPOTHESES:
{hypotheses_block}

ROLE: {agent_name}
PERSPECTIVE: {system_prompt}";

const MATRIX_SCORING_PROMPT: &str = "\
Score how this evidence relates to each hypothesis below: C (consistent), I (inconsistent), or N \
(not applicable / no bearing). Output a JSON object: {{\"scores\": [{{\"hypothesis_id\": ..., \
\"score\": ..., \"reasoning\": ...}}]}}.

Question: {question}

EVIDENCE: {evidence_description}

HYPOTHESES:
{hypotheses_block}";

const SENSITIVITY_SYNTHESIS_PROMPT: &str = "\
Summarize the outcome of this competing-hypotheses analysis: which hypothesis is best supported, what \
would have to be true for an eliminated hypothesis to be reinstated, and which evidence was most \
diagnostic.

Question: {question}

SURVIVING:
{surviving_block}

ELIMINATED:
{eliminated_block}

MATRIX:
{matrix_block}

MOST DIAGNOSTIC EVIDENCE:
{diagnostic_block}";

pub fn build() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "ach".to_string(),
        stages: vec![
            StageDescriptor::new("hypotheses_raw", trigger::always(), hypothesis_generation_stage()),
            StageDescriptor::new(
                "hypotheses",
                trigger::after("hypotheses_raw"),
                compute_stage("hypotheses_raw", "hypotheses", dedupe_hypotheses),
            ),
            StageDescriptor::new("evidence_raw", trigger::after("hypotheses"), evidence_listing_stage()),
            StageDescriptor::new(
                "evidence",
                trigger::after("evidence_raw"),
                compute_stage("evidence_raw", "evidence", dedupe_evidence),
            ),
            StageDescriptor::new("matrix_cells", trigger::after("evidence"), matrix_scoring_stage()),
            StageDescriptor::new("elimination", trigger::after("matrix_cells"), eliminate_stage()),
            StageDescriptor::new("synthesis", trigger::after("elimination"), synthesis_stage()),
        ],
    }
}

/// Each agent proposes hypotheses independently, in parallel (Phase 1).
fn hypothesis_generation_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb
                .read_latest("question", None)
                .map(|e| text_of(&e.content))
                .unwrap_or_default();

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        HYPOTHESIS_GENERATION_PROMPT,
                        &[
                            ("question", question.as_str()),
                            ("agent_name", agent.name.as_str()),
                            ("system_prompt", agent.system_prompt.as_str()),
                        ],
                    );
                    if let Ok(outcome) = call(&config, &agent, &prompt, 4096).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        let hypotheses = parsed.get("hypotheses").cloned().unwrap_or(Value::Array(vec![]));
                        bb.write("hypotheses_raw", hypotheses, agent.name.clone(), "hypotheses_raw", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

/// Deduplicate raw per-agent hypothesis proposals by lowercase label,
/// re-indexing `H1..Hn`. Grounded on `_deduplicate_hypotheses`.
fn dedupe_hypotheses(entries: &[BlackboardEntry]) -> Option<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    let mut idx = 1usize;
    for entry in entries {
        let Value::Array(items) = &entry.content else { continue };
        for item in items {
            let label = item.get("label").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
            if label.is_empty() || !seen.insert(label) {
                continue;
            }
            out.push(serde_json::json!({
                "id": format!("H{idx}"),
                "label": item.get("label").and_then(Value::as_str).unwrap_or(""),
                "description": item.get("description").and_then(Value::as_str).unwrap_or(""),
                "inconsistency_count": 0,
                "eliminated": false,
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

fn hypotheses_block(hypotheses: &[Value]) -> String {
    hypotheses
        .iter()
        .map(|h| {
            format!(
                "- {}: {} \u{2014} {}",
                h.get("id").and_then(Value::as_str).unwrap_or(""),
                h.get("label").and_then(Value::as_str).unwrap_or(""),
                h.get("description").and_then(Value::as_str).unwrap_or(""),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Each agent lists evidence relevant to the deduplicated hypothesis set,
/// independently, in parallel (Phase 2).
fn evidence_listing_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb
                .read_latest("question", None)
                .map(|e| text_of(&e.content))
                .unwrap_or_default();
            let hypotheses = match bb.read_latest("hypotheses", None) {
                Some(e) => match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                },
                None => vec![],
            };
            if hypotheses.is_empty() {
                return;
            }
            let block = hypotheses_block(&hypotheses);

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                let block = block.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        EVIDENCE_LISTING_PROMPT,
                        &[
                            ("question", question.as_str()),
                            ("hypotheses_block", block.as_str()),
                            ("agent_name", agent.name.as_str()),
                            ("system_prompt", agent.system_prompt.as_str()),
                        ],
                    );
                    if let Ok(outcome) = call(&config, &agent, &prompt, 4096).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        let evidence = parsed.get("evidence").cloned().unwrap_or(Value::Array(vec![]));
                        bb.write("evidence_raw", evidence, agent.name.clone(), "evidence_raw", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

/// Deduplicate raw per-agent evidence by lowercase description, re-indexing
/// `E1..En`. Grounded on `_deduplicate_evidence`.
fn dedupe_evidence(entries: &[BlackboardEntry]) -> Option<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    let mut idx = 1usize;
    for entry in entries {
        let Value::Array(items) = &entry.content else { continue };
        for item in items {
            let desc = item.get("description").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
            if desc.is_empty() || !seen.insert(desc) {
                continue;
            }
            out.push(serde_json::json!({
                "id": format!("E{idx}"),
                "description": item.get("description").and_then(Value::as_str).unwrap_or(""),
                "diagnostic_score": 0.0,
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

/// Score every (agent, evidence) pair against every hypothesis (Phase 3).
/// Fan-out is bounded to [`MATRIX_CONCURRENCY`] in-flight calls at a time,
/// so the matrix never issues more than a handful of calls at once.
fn matrix_scoring_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb
                .read_latest("question", None)
                .map(|e| text_of(&e.content))
                .unwrap_or_default();
            let hypotheses = match bb.read_latest("hypotheses", None) {
                Some(e) => match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                },
                None => vec![],
            };
            let evidence = match bb.read_latest("evidence", None) {
                Some(e) => match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                },
                None => vec![],
            };
            if hypotheses.is_empty() || evidence.is_empty() {
                return;
            }
            let block = hypotheses_block(&hypotheses);
            let semaphore = Arc::new(Semaphore::new(MATRIX_CONCURRENCY));

            let mut handles = Vec::new();
            for agent in &agents {
                for ev in &evidence {
                    let bb = bb.clone();
                    let config = config.clone();
                    let agent = agent.clone();
                    let question = question.clone();
                    let block = block.clone();
                    let ev_id = ev.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                    let ev_desc = ev.get("description").and_then(Value::as_str).unwrap_or("").to_string();
                    let semaphore = semaphore.clone();
                    handles.push(tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                        let evidence_description = format!("{ev_id}: {ev_desc}");
                        let prompt = prompt::expand_owned(
                            MATRIX_SCORING_PROMPT,
                            &[
                                ("question", question.as_str()),
                                ("evidence_description", evidence_description.as_str()),
                                ("hypotheses_block", block.as_str()),
                            ],
                        );
                        let caller = Agent::new("system", "system", "");
                        if let Ok(outcome) = call(&config, &caller, &prompt, 1024).await {
                            let parsed = json_util::parse_json_object(&outcome.text);
                            let scores = parsed.get("scores").cloned().unwrap_or(Value::Array(vec![]));
                            let cells: Vec<Value> = match scores {
                                Value::Array(items) => items
                                    .into_iter()
                                    .map(|s| {
                                        let score = s
                                            .get("score")
                                            .and_then(Value::as_str)
                                            .unwrap_or("N")
                                            .chars()
                                            .next()
                                            .unwrap_or('N')
                                            .to_ascii_uppercase()
                                            .to_string();
                                        serde_json::json!({
                                            "evidence_id": ev_id,
                                            "hypothesis_id": s.get("hypothesis_id").and_then(Value::as_str).unwrap_or(""),
                                            "score": score,
                                            "reasoning": s.get("reasoning").and_then(Value::as_str).unwrap_or(""),
                                        })
                                    })
                                    .collect(),
                                _ => vec![],
                            };
                            bb.write(
                                "matrix_cells",
                                Value::Array(cells),
                                agent.name.clone(),
                                "matrix_cells",
                                HashMap::new(),
                            );
                        }
                    }));
                }
            }
            join_all(handles).await;
        })
    })
}

/// Majority-vote aggregate per `(evidence_id, hypothesis_id)`, folding a
/// flat matrix-cell list down to one score per pair.
fn aggregate_votes(cells: &[Value]) -> HashMap<(String, String), String> {
    let mut buckets: HashMap<(String, String), HashMap<String, usize>> = HashMap::new();
    for cell in cells {
        let key = (
            cell.get("evidence_id").and_then(Value::as_str).unwrap_or("").to_string(),
            cell.get("hypothesis_id").and_then(Value::as_str).unwrap_or("").to_string(),
        );
        let score = cell.get("score").and_then(Value::as_str).unwrap_or("N").to_string();
        *buckets.entry(key).or_default().entry(score).or_insert(0) += 1;
    }
    buckets
        .into_iter()
        .map(|(key, votes)| {
            let winner = votes.into_iter().max_by_key(|(_, count)| *count).map(|(s, _)| s).unwrap_or_else(|| "N".to_string());
            (key, winner)
        })
        .collect()
}

fn all_cells(bb: &Blackboard) -> Vec<Value> {
    bb.read("matrix_cells", None)
        .into_iter()
        .flat_map(|e| match e.content {
            Value::Array(items) => items,
            _ => vec![],
        })
        .collect()
}

/// Phase 4: rank hypotheses by inconsistency count; eliminate those tied at
/// the maximum count when that maximum exceeds the minimum. Direct port of
/// `_eliminate`'s tie-break rule.
fn eliminate_stage() -> StageFn {
    Arc::new(move |bb, _agents, _config| {
        Box::pin(async move {
            let hypotheses = match bb.read_latest("hypotheses", None) {
                Some(e) => match e.content {
                    Value::Array(items) => items,
                    _ => return,
                },
                None => return,
            };
            let cells = all_cells(&bb);
            let aggregated = aggregate_votes(&cells);

            let mut scored: Vec<Value> = hypotheses
                .into_iter()
                .map(|h| {
                    let id = h.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                    let inconsistency_count = aggregated
                        .iter()
                        .filter(|((_, hid), score)| hid == &id && score.as_str() == "I")
                        .count();
                    let mut h = h;
                    h["inconsistency_count"] = Value::from(inconsistency_count);
                    h
                })
                .collect();
            scored.sort_by_key(|h| h.get("inconsistency_count").and_then(Value::as_u64).unwrap_or(0));

            let (eliminated, surviving) = if scored.len() <= 1 {
                (vec![], scored)
            } else {
                let max = scored.last().and_then(|h| h.get("inconsistency_count")).and_then(Value::as_u64).unwrap_or(0);
                let min = scored.first().and_then(|h| h.get("inconsistency_count")).and_then(Value::as_u64).unwrap_or(0);
                let mut eliminated = Vec::new();
                let mut surviving = Vec::new();
                for mut h in scored {
                    let count = h.get("inconsistency_count").and_then(Value::as_u64).unwrap_or(0);
                    if count == max && max > min {
                        h["eliminated"] = Value::from(true);
                        eliminated.push(h);
                    } else {
                        surviving.push(h);
                    }
                }
                (eliminated, surviving)
            };

            bb.write(
                "elimination",
                serde_json::json!({ "eliminated": eliminated, "surviving": surviving }),
                "system",
                "elimination",
                HashMap::new(),
            );
        })
    })
}

/// Evidence diagnosticity: the fraction of distinct aggregated scores it
/// produces across the surviving+eliminated hypothesis set. Grounded on
/// `_compute_diagnosticity`.
fn diagnostic_evidence(bb: &Blackboard, hypothesis_ids: &[String]) -> Vec<(String, String, f64)> {
    let evidence = match bb.read_latest("evidence", None) {
        Some(e) => match e.content {
            Value::Array(items) => items,
            _ => vec![],
        },
        None => vec![],
    };
    let cells = all_cells(bb);
    let aggregated = aggregate_votes(&cells);

    let mut scored: Vec<(String, String, f64)> = evidence
        .iter()
        .map(|ev| {
            let id = ev.get("id").and_then(Value::as_str).unwrap_or("").to_string();
            let desc = ev.get("description").and_then(Value::as_str).unwrap_or("").to_string();
            let scores: std::collections::HashSet<&str> = hypothesis_ids
                .iter()
                .map(|hid| aggregated.get(&(id.clone(), hid.clone())).map(String::as_str).unwrap_or("N"))
                .collect();
            let diagnosticity = if hypothesis_ids.is_empty() {
                0.0
            } else {
                scores.len() as f64 / hypothesis_ids.len() as f64
            };
            (id, desc, diagnosticity)
        })
        .collect();
    scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

fn format_hyp_rows(items: &[Value]) -> String {
    if items.is_empty() {
        return "None".to_string();
    }
    items
        .iter()
        .map(|h| {
            format!(
                "- {}: {} \u{2014} {} (inconsistencies: {})",
                h.get("id").and_then(Value::as_str).unwrap_or(""),
                h.get("label").and_then(Value::as_str).unwrap_or(""),
                h.get("description").and_then(Value::as_str).unwrap_or(""),
                h.get("inconsistency_count").and_then(Value::as_u64).unwrap_or(0),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Phase 5: sensitivity analysis + synthesis over what survived.
fn synthesis_stage() -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let elimination = match bb.read_latest("elimination", None) {
                Some(e) => e.content,
                None => return,
            };
            let question = bb
                .read_latest("question", None)
                .map(|e| text_of(&e.content))
                .unwrap_or_default();

            let empty = vec![];
            let surviving = elimination.get("surviving").and_then(Value::as_array).unwrap_or(&empty);
            let eliminated = elimination.get("eliminated").and_then(Value::as_array).unwrap_or(&empty);

            let hypothesis_ids: Vec<String> = surviving
                .iter()
                .chain(eliminated.iter())
                .filter_map(|h| h.get("id").and_then(Value::as_str).map(str::to_string))
                .collect();
            let diagnostic = diagnostic_evidence(&bb, &hypothesis_ids);
            let diagnostic_block = diagnostic
                .iter()
                .take(5)
                .map(|(id, desc, score)| format!("- {id}: {desc} (diagnosticity: {score:.2})"))
                .collect::<Vec<_>>()
                .join("\n");

            let cells = all_cells(&bb);
            let aggregated = aggregate_votes(&cells);
            let evidence = match bb.read_latest("evidence", None) {
                Some(e) => match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                },
                None => vec![],
            };
            let matrix_block = format_matrix_block(&evidence, surviving, eliminated, &aggregated);

            let prompt = prompt::expand_owned(
                SENSITIVITY_SYNTHESIS_PROMPT,
                &[
                    ("question", question.as_str()),
                    ("surviving_block", format_hyp_rows(surviving).as_str()),
                    ("eliminated_block", format_hyp_rows(eliminated).as_str()),
                    ("matrix_block", matrix_block.as_str()),
                    ("diagnostic_block", diagnostic_block.as_str()),
                ],
            );

            let caller = Agent::new("system", "system", "");
            if let Ok(outcome) = call(&config, &caller, &prompt, config.max_tokens).await {
                bb.write(
                    "synthesis",
                    Value::String(outcome.text),
                    "system",
                    "synthesis",
                    HashMap::new(),
                );
            }
        })
    })
}

fn format_matrix_block(
    evidence: &[Value],
    surviving: &[Value],
    eliminated: &[Value],
    aggregated: &HashMap<(String, String), String>,
) -> String {
    let ids: Vec<&str> = surviving
        .iter()
        .chain(eliminated.iter())
        .filter_map(|h| h.get("id").and_then(Value::as_str))
        .collect();
    let header = format!("Evidence | {}", ids.join(" | "));
    let rows = evidence
        .iter()
        .map(|ev| {
            let eid = ev.get("id").and_then(Value::as_str).unwrap_or("").to_string();
            let scores: Vec<&str> = ids
                .iter()
                .map(|hid| aggregated.get(&(eid.clone(), hid.to_string())).map(String::as_str).unwrap_or("?"))
                .collect();
            format!("{eid} | {}", scores.join(" | "))
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("{header}\n{rows}")
}

async fn call(
    config: &StageConfig,
    agent: &Agent,
    prompt: &str,
    max_tokens: usize,
) -> Result<crate::engine::gateway::CompletionOutcome, crate::engine::errors::CoordinationError> {
    config
        .gateway
        .complete(
            CompletionRequest {
                agent,
                fallback_model: &config.thinking_model,
                messages: vec![Message {
                    role: Role::User,
                    content: Arc::from(prompt),
                    tool_calls: vec![],
                }],
                max_tokens,
                system_override: if agent.key == "system" { Some("") } else { None },
                tools: None,
            },
            &config.ctx,
        )
        .await
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let elimination = bb.read_latest("elimination", None).map(|e| e.content).unwrap_or(Value::Null);
    let empty = vec![];
    let surviving = elimination.get("surviving").and_then(Value::as_array).unwrap_or(&empty);
    let eliminated = elimination.get("eliminated").and_then(Value::as_array).unwrap_or(&empty);

    let mut outputs = Vec::new();
    for h in surviving {
        outputs.push(NamedOutput {
            name: h.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
            output: serde_json::to_string(h).unwrap_or_default(),
        });
    }
    for h in eliminated {
        outputs.push(NamedOutput {
            name: h.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
            output: serde_json::to_string(h).unwrap_or_default(),
        });
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
    fn build_has_seven_stages() {
        let protocol = build();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["hypotheses_raw", "hypotheses", "evidence_raw", "evidence", "matrix_cells", "elimination", "synthesis"]
        );
    }

    #[test]
    fn dedupe_hypotheses_reindexes_and_drops_duplicate_labels() {
        let bb = Blackboard::new("ach");
        bb.write(
            "hypotheses_raw",
            serde_json::json!([{"label": "Supply shock", "description": "a"}, {"label": "supply shock", "description": "b"}]),
            "A",
            "hypotheses_raw",
            Default::default(),
        );
        bb.write(
            "hypotheses_raw",
            serde_json::json!([{"label": "Demand collapse", "description": "c"}]),
            "B",
            "hypotheses_raw",
            Default::default(),
        );
        let entries = bb.read("hypotheses_raw", None);
        let deduped = dedupe_hypotheses(&entries).unwrap();
        let items = deduped.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], "H1");
        assert_eq!(items[1]["id"], "H2");
    }

    #[test]
    fn eliminate_produces_exact_inconsistency_counts() {
        let bb = Blackboard::new("ach");
        bb.write(
            "hypotheses",
            serde_json::json!([
                {"id": "H1", "label": "a", "description": "", "inconsistency_count": 0, "eliminated": false},
                {"id": "H2", "label": "b", "description": "", "inconsistency_count": 0, "eliminated": false},
                {"id": "H3", "label": "c", "description": "", "inconsistency_count": 0, "eliminated": false},
                {"id": "H4", "label": "d", "description": "", "inconsistency_count": 0, "eliminated": false},
            ]),
            "system",
            "hypotheses",
            Default::default(),
        );

        let mut cells = Vec::new();
        let counts = [("H1", 0), ("H2", 1), ("H3", 3), ("H4", 3)];
        for (hid, inconsistent) in counts {
            for i in 0..inconsistent {
                cells.push(serde_json::json!({"evidence_id": format!("E{i}"), "hypothesis_id": hid, "score": "I", "reasoning": ""}));
            }
            for i in inconsistent..3 {
                cells.push(serde_json::json!({"evidence_id": format!("E{i}"), "hypothesis_id": hid, "score": "C", "reasoning": ""}));
            }
        }
        bb.write("matrix_cells", Value::Array(cells), "system", "matrix_cells", Default::default());

        let bb = Arc::new(bb);
        let stage = eliminate_stage();
        let config = Arc::new(test_config());
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(stage(bb.clone(), vec![], config));

        let result = bb.read_latest("elimination", None).unwrap().content;
        let surviving: Vec<&str> = result["surviving"].as_array().unwrap().iter().map(|h| h["id"].as_str().unwrap()).collect();
        let eliminated: Vec<&str> = result["eliminated"].as_array().unwrap().iter().map(|h| h["id"].as_str().unwrap()).collect();
        assert_eq!(surviving, vec!["H1", "H2"]);
        assert_eq!(eliminated, vec!["H3", "H4"]);
    }

    fn test_config() -> StageConfig {
        use crate::cloudllm::client_wrapper::{ClientWrapper, ToolDefinition};
        use crate::engine::gateway::{Gateway, GatewayContext, SingleProviderRouter};
        use async_trait::async_trait;
        use std::error::Error;

        struct Dummy;
        #[async_trait]
        impl ClientWrapper for Dummy {
            async fn send_message(&self, _messages: &[Message], _tools: Option<Vec<ToolDefinition>>) -> Result<Message, Box<dyn Error>> {
                Ok(Message { role: Role::Assistant, content: Arc::from(""), tool_calls: vec![] })
            }
            fn model_name(&self) -> &str {
                "dummy"
            }
        }
        let router = Arc::new(SingleProviderRouter(Arc::new(Dummy) as Arc<dyn ClientWrapper>));
        StageConfig {
            gateway: Arc::new(Gateway::new(router)),
            ctx: GatewayContext::none(),
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            max_tokens: 1024,
        }
    }
}
