//! P24: Causal Loop Mapping — extract system variables, identify causal
//! links between them, merge the links by majority-vote polarity, trace
//! closed cycles into reinforcing/balancing feedback loops, then analyze
//! leverage points.
//!
//! Phase 4 is pure computation, no LLM call: depth-8-capped DFS, edge-set
//! cycle canonicalization, and reinforcing/balancing classification by
//! parity of negative links, all fixed policy rather than tunable knobs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::engine::agents::Agent;
use crate::engine::blackboard::Blackboard;
use crate::engine::gateway::{CompletionOutcome, CompletionRequest};
use crate::engine::errors::CoordinationError;
use crate::engine::orchestrator::{NamedOutput, ProtocolDef, ProtocolResult, ProtocolResultVariant, StageDescriptor};
use crate::engine::prompt;
use crate::engine::stage::{StageConfig, StageFn};
use crate::engine::trigger;

use super::{json_util, text_of};

const MAX_PATH_DEPTH: usize = 8;

const VARIABLE_EXTRACTION_PROMPT: &str = "\
Identify the key system variables at play in the following question, from your role's perspective. \
Output a JSON object: {{\"variables\": [{{\"name\": ..., \"description\": ...}}]}}.

Question: {question}

ROLE: {agent_name}
PERSPECTIVE: {system_prompt}";

const DEDUPLICATION_PROMPT: &str = "\
Merge and deduplicate the system variables below into a clean list, assigning each a short id (V1, V2, \
...). Output a JSON object: {{\"variables\": [{{\"id\": ..., \"name\": ..., \"description\": ...}}]}}.

Question: {question}

RAW VARIABLES:
{raw_variables_block}";

const CAUSAL_LINK_PROMPT: &str = "\
Identify causal links between the system variables below, from your role's perspective. For each link \
give the source variable id, the target variable id, and its polarity: \"+\" (same direction) or \"-\" \
(opposite direction). Output a JSON object: {{\"links\": [{{\"from\": ..., \"to\": ..., \"polarity\": \
..., \"reasoning\": ...}}]}}.

Question: {question}

VARIABLES:
{variables_block}

ROLE: {agent_name}
PERSPECTIVE: {system_prompt}";

const LEVERAGE_POINT_PROMPT: &str = "\
Identify the highest-leverage points for intervention in the system below.

Question: {question}

VARIABLES:
{variables_block}

CAUSAL LINKS:
{links_block}

REINFORCING LOOPS:
{reinforcing_block}

BALANCING LOOPS:
{balancing_block}";

pub fn build() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "causal-loop-mapping".to_string(),
        stages: vec![
            StageDescriptor::new("variables_raw", trigger::always(), variable_extraction_stage()),
            StageDescriptor::new("variables", trigger::after("variables_raw"), deduplication_stage()),
            StageDescriptor::new("links_raw", trigger::after("variables"), causal_link_stage()),
            StageDescriptor::new("links_loops", trigger::after("links_raw"), merge_and_trace_stage()),
            StageDescriptor::new("synthesis", trigger::after("links_loops"), leverage_analysis_stage()),
        ],
    }
}

async fn call(config: &StageConfig, agent: &Agent, prompt: &str, max_tokens: usize) -> Result<CompletionOutcome, CoordinationError> {
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

fn variable_extraction_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        VARIABLE_EXTRACTION_PROMPT,
                        &[("question", question.as_str()), ("agent_name", agent.name.as_str()), ("system_prompt", agent.system_prompt.as_str())],
                    );
                    if let Ok(outcome) = call(&config, &agent, &prompt, 2048).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        let vars = parsed.get("variables").cloned().unwrap_or(Value::Array(vec![]));
                        bb.write("variables_raw", vars, agent.name.clone(), "variables_raw", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

fn deduplication_stage() -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let raw_block = bb
                .read("variables_raw", None)
                .into_iter()
                .flat_map(|e| match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                })
                .map(|v| format!("- {}: {}", v.get("name").and_then(Value::as_str).unwrap_or("???"), v.get("description").and_then(Value::as_str).unwrap_or("")))
                .collect::<Vec<_>>()
                .join("\n");
            if raw_block.is_empty() {
                return;
            }

            let prompt = prompt::expand_owned(DEDUPLICATION_PROMPT, &[("question", question.as_str()), ("raw_variables_block", raw_block.as_str())]);
            let agent = Agent::new("system", "system", "");
            if let Ok(outcome) = call(&config, &agent, &prompt, 2048).await {
                let parsed = json_util::parse_json_object(&outcome.text);
                let variables = parsed.get("variables").cloned().unwrap_or(Value::Array(vec![]));
                bb.write("variables", variables, "system", "variables", HashMap::new());
            }
        })
    })
}

fn variables_block(variables: &[Value]) -> String {
    variables
        .iter()
        .map(|v| format!("- {}: {} \u{2014} {}", v.get("id").and_then(Value::as_str).unwrap_or(""), v.get("name").and_then(Value::as_str).unwrap_or(""), v.get("description").and_then(Value::as_str).unwrap_or("")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn causal_link_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let variables: Vec<Value> = bb
                .read_latest("variables", None)
                .map(|e| match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                })
                .unwrap_or_default();
            if variables.is_empty() {
                return;
            }
            let block = variables_block(&variables);

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                let block = block.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        CAUSAL_LINK_PROMPT,
                        &[
                            ("question", question.as_str()),
                            ("variables_block", block.as_str()),
                            ("agent_name", agent.name.as_str()),
                            ("system_prompt", agent.system_prompt.as_str()),
                        ],
                    );
                    if let Ok(outcome) = call(&config, &agent, &prompt, 2048).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        let links = parsed.get("links").cloned().unwrap_or(Value::Array(vec![]));
                        bb.write("links_raw", links, agent.name.clone(), "links_raw", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

/// Majority-vote polarity merge per `(from, to)` pair. Direct port of
/// `_merge_links`.
fn merge_links(raw_links: &[Value], valid_ids: &HashSet<String>) -> Vec<Value> {
    let mut buckets: HashMap<(String, String), Vec<String>> = HashMap::new();
    let mut reasoning: HashMap<(String, String), String> = HashMap::new();
    for link in raw_links {
        let from_var = link.get("from").and_then(Value::as_str).unwrap_or("").trim().to_string();
        let to_var = link.get("to").and_then(Value::as_str).unwrap_or("").trim().to_string();
        if !valid_ids.contains(&from_var) || !valid_ids.contains(&to_var) || from_var == to_var {
            continue;
        }
        let mut polarity = link.get("polarity").and_then(Value::as_str).unwrap_or("+").trim().to_string();
        if polarity != "+" && polarity != "-" {
            polarity = "+".to_string();
        }
        let key = (from_var.clone(), to_var.clone());
        reasoning.entry(key.clone()).or_insert_with(|| link.get("reasoning").and_then(Value::as_str).unwrap_or("").to_string());
        buckets.entry(key).or_default().push(polarity);
    }

    buckets
        .into_iter()
        .map(|(key, polarities)| {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for p in &polarities {
                *counts.entry(p.clone()).or_insert(0) += 1;
            }
            let winner = counts.into_iter().max_by_key(|(_, c)| *c).map(|(p, _)| p).unwrap_or_else(|| "+".to_string());
            serde_json::json!({
                "from": key.0,
                "to": key.1,
                "polarity": winner,
                "reasoning": reasoning.get(&key).cloned().unwrap_or_default(),
            })
        })
        .collect()
}

/// Depth-capped DFS cycle search with edge-set canonicalization, ported
/// directly from `_trace_loops`.
fn trace_loops(links: &[Value], variables: &[Value]) -> (Vec<Value>, Vec<Value>) {
    let mut adj: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for link in links {
        let from_var = link.get("from").and_then(Value::as_str).unwrap_or("").to_string();
        let to_var = link.get("to").and_then(Value::as_str).unwrap_or("").to_string();
        let polarity = link.get("polarity").and_then(Value::as_str).unwrap_or("+").to_string();
        adj.entry(from_var).or_default().push((to_var, polarity));
    }

    let all_nodes: Vec<String> = variables.iter().filter_map(|v| v.get("id").and_then(Value::as_str).map(str::to_string)).collect();
    let mut found: Vec<(Vec<String>, Vec<String>)> = Vec::new();
    let mut seen_keys: HashSet<Vec<(String, String)>> = HashSet::new();

    fn dfs(
        adj: &HashMap<String, Vec<(String, String)>>,
        start: &str,
        current: &str,
        path: &mut Vec<String>,
        polarities: &mut Vec<String>,
        visited: &mut HashSet<String>,
        found: &mut Vec<(Vec<String>, Vec<String>)>,
        seen_keys: &mut HashSet<Vec<(String, String)>>,
    ) {
        let Some(neighbors) = adj.get(current) else { return };
        for (neighbor, polarity) in neighbors.clone() {
            if neighbor == start && path.len() >= 2 {
                let mut edges: Vec<(String, String)> = (0..path.len())
                    .map(|i| {
                        let next = if i + 1 < path.len() { path[i + 1].clone() } else { start.to_string() };
                        (path[i].clone(), next)
                    })
                    .collect();
                edges.sort();
                if seen_keys.insert(edges) {
                    let mut full_path = path.clone();
                    full_path.push(current.to_string());
                    let mut full_polarities = polarities.clone();
                    full_polarities.push(polarity.clone());
                    found.push((full_path, full_polarities));
                }
            } else if !visited.contains(&neighbor) && path.len() < MAX_PATH_DEPTH {
                visited.insert(neighbor.clone());
                path.push(current.to_string());
                polarities.push(polarity.clone());
                dfs(adj, start, &neighbor, path, polarities, visited, found, seen_keys);
                polarities.pop();
                path.pop();
                visited.remove(&neighbor);
            }
        }
    }

    for node in &all_nodes {
        let mut visited = HashSet::new();
        visited.insert(node.clone());
        dfs(&adj, node, node, &mut Vec::new(), &mut Vec::new(), &mut visited, &mut found, &mut seen_keys);
    }

    let mut reinforcing = Vec::new();
    let mut balancing = Vec::new();
    let mut r_idx = 1;
    let mut b_idx = 1;
    for (path, polarities) in found {
        let neg_count = polarities.iter().filter(|p| p.as_str() == "-").count();
        if neg_count % 2 == 0 {
            reinforcing.push(serde_json::json!({ "id": format!("R{r_idx}"), "loop_type": "reinforcing", "path": path, "polarities": polarities }));
            r_idx += 1;
        } else {
            balancing.push(serde_json::json!({ "id": format!("B{b_idx}"), "loop_type": "balancing", "path": path, "polarities": polarities }));
            b_idx += 1;
        }
    }
    (reinforcing, balancing)
}

fn merge_and_trace_stage() -> StageFn {
    Arc::new(move |bb, _agents, _config| {
        Box::pin(async move {
            let variables: Vec<Value> = bb
                .read_latest("variables", None)
                .map(|e| match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                })
                .unwrap_or_default();
            if variables.is_empty() {
                return;
            }
            let valid_ids: HashSet<String> = variables.iter().filter_map(|v| v.get("id").and_then(Value::as_str).map(str::to_string)).collect();
            let raw_links: Vec<Value> = bb.read("links_raw", None).into_iter().flat_map(|e| match e.content {
                Value::Array(items) => items,
                _ => vec![],
            }).collect();

            let causal_links = merge_links(&raw_links, &valid_ids);
            let (reinforcing_loops, balancing_loops) = trace_loops(&causal_links, &variables);

            bb.write(
                "links_loops",
                serde_json::json!({
                    "causal_links": causal_links,
                    "reinforcing_loops": reinforcing_loops,
                    "balancing_loops": balancing_loops,
                }),
                "system",
                "links_loops",
                HashMap::new(),
            );
        })
    })
}

fn format_loops_block(loops: &[Value]) -> String {
    if loops.is_empty() {
        return "None detected".to_string();
    }
    loops
        .iter()
        .map(|l| {
            let empty = vec![];
            let path: Vec<&str> = l.get("path").and_then(Value::as_array).unwrap_or(&empty).iter().filter_map(Value::as_str).collect();
            let polarities: Vec<&str> = l.get("polarities").and_then(Value::as_array).unwrap_or(&empty).iter().filter_map(Value::as_str).collect();
            let path_str = if path.is_empty() { String::new() } else { format!("{} -> {}", path.join(" -> "), path[0]) };
            format!(
                "- {} ({}): {} [polarities: {}]",
                l.get("id").and_then(Value::as_str).unwrap_or(""),
                l.get("loop_type").and_then(Value::as_str).unwrap_or(""),
                path_str,
                polarities.join(" -> "),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn leverage_analysis_stage() -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let variables: Vec<Value> = bb
                .read_latest("variables", None)
                .map(|e| match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                })
                .unwrap_or_default();
            let links_loops = match bb.read_latest("links_loops", None) {
                Some(e) => e.content,
                None => return,
            };
            let empty = vec![];
            let links = links_loops.get("causal_links").and_then(Value::as_array).unwrap_or(&empty);
            let reinforcing = links_loops.get("reinforcing_loops").and_then(Value::as_array).unwrap_or(&empty);
            let balancing = links_loops.get("balancing_loops").and_then(Value::as_array).unwrap_or(&empty);

            let links_block = links
                .iter()
                .map(|l| {
                    format!(
                        "- {} --({})--> {}: {}",
                        l.get("from").and_then(Value::as_str).unwrap_or(""),
                        l.get("polarity").and_then(Value::as_str).unwrap_or(""),
                        l.get("to").and_then(Value::as_str).unwrap_or(""),
                        l.get("reasoning").and_then(Value::as_str).unwrap_or(""),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");

            let prompt = prompt::expand_owned(
                LEVERAGE_POINT_PROMPT,
                &[
                    ("question", question.as_str()),
                    ("variables_block", variables_block(&variables).as_str()),
                    ("links_block", links_block.as_str()),
                    ("reinforcing_block", format_loops_block(reinforcing).as_str()),
                    ("balancing_block", format_loops_block(balancing).as_str()),
                ],
            );

            let agent = Agent::new("system", "system", "");
            if let Ok(outcome) = call(&config, &agent, &prompt, 4096).await {
                bb.write("synthesis", Value::String(outcome.text), "system", "synthesis", HashMap::new());
            }
        })
    })
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let mut outputs = Vec::new();
    if let Some(e) = bb.read_latest("variables", None) {
        outputs.push(NamedOutput { name: "variables".to_string(), output: e.content.to_string() });
    }
    if let Some(e) = bb.read_latest("links_loops", None) {
        outputs.push(NamedOutput { name: "links_loops".to_string(), output: e.content.to_string() });
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
        assert_eq!(names, vec!["variables_raw", "variables", "links_raw", "links_loops", "synthesis"]);
    }

    #[test]
    fn merge_links_majority_votes_conflicting_polarity() {
        let valid: HashSet<String> = ["V1".to_string(), "V2".to_string()].into_iter().collect();
        let raw = vec![
            serde_json::json!({"from": "V1", "to": "V2", "polarity": "+"}),
            serde_json::json!({"from": "V1", "to": "V2", "polarity": "+"}),
            serde_json::json!({"from": "V1", "to": "V2", "polarity": "-"}),
        ];
        let merged = merge_links(&raw, &valid);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["polarity"], "+");
    }

    #[test]
    fn merge_links_drops_links_to_unknown_variables_and_self_loops() {
        let valid: HashSet<String> = ["V1".to_string()].into_iter().collect();
        let raw = vec![
            serde_json::json!({"from": "V1", "to": "V1", "polarity": "+"}),
            serde_json::json!({"from": "V1", "to": "V9", "polarity": "+"}),
        ];
        assert!(merge_links(&raw, &valid).is_empty());
    }

    #[test]
    fn trace_loops_finds_a_two_node_reinforcing_cycle() {
        let variables = vec![serde_json::json!({"id": "V1"}), serde_json::json!({"id": "V2"})];
        let links = vec![
            serde_json::json!({"from": "V1", "to": "V2", "polarity": "+"}),
            serde_json::json!({"from": "V2", "to": "V1", "polarity": "+"}),
        ];
        let (reinforcing, balancing) = trace_loops(&links, &variables);
        assert_eq!(reinforcing.len(), 1);
        assert!(balancing.is_empty());
        assert_eq!(reinforcing[0]["id"], "R1");
    }

    #[test]
    fn trace_loops_classifies_odd_negative_links_as_balancing() {
        let variables = vec![serde_json::json!({"id": "V1"}), serde_json::json!({"id": "V2"})];
        let links = vec![
            serde_json::json!({"from": "V1", "to": "V2", "polarity": "+"}),
            serde_json::json!({"from": "V2", "to": "V1", "polarity": "-"}),
        ];
        let (reinforcing, balancing) = trace_loops(&links, &variables);
        assert!(reinforcing.is_empty());
        assert_eq!(balancing.len(), 1);
        assert_eq!(balancing[0]["id"], "B1");
    }
}
