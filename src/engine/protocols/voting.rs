//! P19/P20/P21: Sealed-ballot voting family — Vickrey auction, Borda count,
//! Condorcet method. All three share the same opening move (extract the
//! distinct options implied by the question, then collect one sealed ballot
//! per agent) and differ only in how the ballots are tallied.
//!
//! The Condorcet variant reuses Borda's pairwise-comparison helper directly.
//! No tool use: these are sealed, identity-light votes, not open-ended
//! agent calls.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::engine::agents::Agent;
use crate::engine::blackboard::Blackboard;
use crate::engine::gateway::CompletionRequest;
use crate::engine::orchestrator::{NamedOutput, ProtocolDef, ProtocolResult, ProtocolResultVariant, StageDescriptor};
use crate::engine::prompt;
use crate::engine::stage::{mechanical_stage, synthesis_stage, ParseFn, StageConfig, StageFn};
use crate::engine::trigger;

use super::{json_util, text_of};

const OPTIONS_EXTRACTION_PROMPT: &str = "\
Identify the distinct options or courses of action implied by the question below. Output a JSON object: \
{{\"options\": [...]}} listing each option as a short label, in the order they're implied.

Question: {input}";

const RANK_BALLOT_PROMPT: &str = "\
Rank the options below from most to least preferred, from your role's perspective. Output a JSON \
object: {{\"ranking\": [...]}} listing every option exactly once, most preferred first.

Question: {question}

OPTIONS:
{options_block}";

const BID_PROMPT: &str = "\
Choose the option you most recommend from the list below and state your confidence, 0-100, that it's \
correct. Output a JSON object: {{\"option\": ..., \"confidence\": ...}}.

Question: {question}

OPTIONS:
{options_block}";

const REJUSTIFICATION_PROMPT: &str = "\
Your bid for \"{option}\" won this sealed-bid auction, but in a Vickrey auction the winner pays the \
second-highest bid, {price}. Recalibrate your justification to that lower confidence level — state what \
you're now less certain about.

Question: {question}";

const VICKREY_SYNTHESIS_PROMPT: &str = "\
Summarize the outcome of this sealed-bid auction and the winning recommendation.

Question: {question}

TALLY:
{tally}

RE-JUSTIFICATION AT SECOND PRICE:
{rejustification}";

const BORDA_SYNTHESIS_PROMPT: &str = "\
Summarize the outcome of this ranked-choice vote and the winning recommendation.

Question: {question}

TALLY:
{tally}";

const CONDORCET_SYNTHESIS_PROMPT: &str = "\
Summarize the outcome of this pairwise-comparison vote and the winning recommendation.

Question: {question}

TALLY:
{tally}";

fn options_stage() -> StageFn {
    let parse: ParseFn = Arc::new(json_util::parse_json_object);
    mechanical_stage("question", "options", OPTIONS_EXTRACTION_PROMPT, Some(parse))
}

fn options_list(bb: &Blackboard) -> Vec<String> {
    bb.read_latest("options", None)
        .and_then(|e| e.content.get("options").cloned())
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn options_block(options: &[String]) -> String {
    options.iter().map(|o| format!("- {o}")).collect::<Vec<_>>().join("\n")
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
                system_override: None,
                tools: None,
            },
            &config.ctx,
        )
        .await
}

/// Each agent submits a sealed ranking of every extracted option.
fn rank_ballot_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let options = options_list(&bb);
            let block = options_block(&options);

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                let block = block.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        RANK_BALLOT_PROMPT,
                        &[("question", question.as_str()), ("options_block", block.as_str())],
                    );
                    if let Ok(outcome) = call(&config, &agent, &prompt, 1024).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        bb.write("ballots", parsed, agent.name.clone(), "ballots", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

/// Each agent submits a sealed `{option, confidence}` bid.
fn bid_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let options = options_list(&bb);
            let block = options_block(&options);

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                let block = block.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        BID_PROMPT,
                        &[("question", question.as_str()), ("options_block", block.as_str())],
                    );
                    if let Ok(outcome) = call(&config, &agent, &prompt, 512).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        bb.write("bids", parsed, agent.name.clone(), "bids", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

/// Count of ballots on which `winner` is ranked above `other`, for the
/// pairwise head-to-head tie-break shared by Borda and Condorcet.
fn pairwise_wins(rankings: &[Vec<String>], winner: &str, other: &str) -> usize {
    rankings
        .iter()
        .filter(|ranking| {
            let pos_winner = ranking.iter().position(|o| o == winner);
            let pos_other = ranking.iter().position(|o| o == other);
            matches!((pos_winner, pos_other), (Some(w), Some(o)) if w < o)
        })
        .count()
}

fn ballot_rankings(bb: &Blackboard) -> Vec<(String, Vec<String>)> {
    bb.read("ballots", None)
        .into_iter()
        .map(|e| {
            let ranking = e
                .content
                .get("ranking")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            (e.author, ranking)
        })
        .collect()
}

/// Borda tally: each ballot awards `len(options) - 1 - position` points to
/// the option at that position; highest total wins. Ties are broken by
/// pairwise head-to-head wins between the tied options.
fn borda_tally_stage() -> StageFn {
    Arc::new(move |bb, _agents, _config| {
        Box::pin(async move {
            let options = options_list(&bb);
            let ballots = ballot_rankings(&bb);
            if options.is_empty() || ballots.is_empty() {
                return;
            }
            let n = options.len();
            let mut points: HashMap<&str, i64> = options.iter().map(|o| (o.as_str(), 0)).collect();
            for (_author, ranking) in &ballots {
                for (i, option) in ranking.iter().enumerate() {
                    if let Some(p) = points.get_mut(option.as_str()) {
                        *p += (n as i64 - 1 - i as i64).max(0);
                    }
                }
            }
            let rankings: Vec<Vec<String>> = ballots.iter().map(|(_, r)| r.clone()).collect();
            let max_points = points.values().copied().max().unwrap_or(0);
            let mut leaders: Vec<&str> = points.iter().filter(|(_, p)| **p == max_points).map(|(o, _)| *o).collect();
            leaders.sort();
            let winner = if leaders.len() > 1 {
                leaders
                    .iter()
                    .max_by_key(|candidate| {
                        leaders
                            .iter()
                            .filter(|other| *other != *candidate)
                            .map(|other| pairwise_wins(&rankings, candidate, other))
                            .sum::<usize>()
                    })
                    .copied()
                    .unwrap_or(leaders[0])
            } else {
                leaders[0]
            };
            let tally = serde_json::json!({
                "winner": winner,
                "points": points,
                "ballots_counted": ballots.len(),
                "tie_broken_by_pairwise": leaders.len() > 1,
            });
            bb.write("tally", tally, "system", "tally", HashMap::new());
        })
    })
}

/// Condorcet tally: the option that beats every other option head-to-head
/// wins; if no such option exists (a Condorcet cycle), the option with the
/// highest net pairwise wins stands in.
fn condorcet_tally_stage() -> StageFn {
    Arc::new(move |bb, _agents, _config| {
        Box::pin(async move {
            let options = options_list(&bb);
            let ballots = ballot_rankings(&bb);
            if options.is_empty() || ballots.is_empty() {
                return;
            }
            let rankings: Vec<Vec<String>> = ballots.iter().map(|(_, r)| r.clone()).collect();

            let mut net_wins: HashMap<&str, i64> = HashMap::new();
            let mut beats_everyone: HashMap<&str, bool> = HashMap::new();
            for a in &options {
                let mut wins_all = true;
                let mut net = 0i64;
                for b in &options {
                    if a == b {
                        continue;
                    }
                    let a_over_b = pairwise_wins(&rankings, a, b);
                    let b_over_a = pairwise_wins(&rankings, b, a);
                    net += a_over_b as i64 - b_over_a as i64;
                    if a_over_b <= b_over_a {
                        wins_all = false;
                    }
                }
                net_wins.insert(a.as_str(), net);
                beats_everyone.insert(a.as_str(), wins_all);
            }

            let condorcet_winner = options.iter().find(|o| beats_everyone.get(o.as_str()).copied().unwrap_or(false));
            let winner = match condorcet_winner {
                Some(w) => w.clone(),
                None => options
                    .iter()
                    .max_by_key(|o| net_wins.get(o.as_str()).copied().unwrap_or(i64::MIN))
                    .cloned()
                    .unwrap_or_else(|| options[0].clone()),
            };

            let tally = serde_json::json!({
                "winner": winner,
                "net_pairwise_wins": net_wins,
                "condorcet_winner_exists": condorcet_winner.is_some(),
                "ballots_counted": ballots.len(),
            });
            bb.write("tally", tally, "system", "tally", HashMap::new());
        })
    })
}

/// Vickrey tally: highest bid wins; the price paid is the second-highest
/// confidence (or the winner's own bid if it was the only one).
fn vickrey_tally_stage() -> StageFn {
    Arc::new(move |bb, _agents, _config| {
        Box::pin(async move {
            let mut bids: Vec<(String, String, f64)> = bb
                .read("bids", None)
                .into_iter()
                .map(|e| {
                    let option = e.content.get("option").and_then(Value::as_str).unwrap_or("").to_string();
                    let confidence = e.content.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
                    (e.author, option, confidence)
                })
                .collect();
            if bids.is_empty() {
                return;
            }
            bids.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
            let (winner_author, winner_option, winner_confidence) = bids[0].clone();
            let price = bids.get(1).map(|b| b.2).unwrap_or(winner_confidence);

            let tally = serde_json::json!({
                "winner": winner_author,
                "option": winner_option,
                "winning_confidence": winner_confidence,
                "price": price,
            });
            bb.write("tally", tally, "system", "tally", HashMap::new());
        })
    })
}

/// The winning agent re-justifies its recommendation as though it had only
/// bid the second-highest price, per the Vickrey second-price rule.
fn rejustification_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let tally = match bb.read_latest("tally", None) {
                Some(e) => e.content,
                None => return,
            };
            let winner_name = tally.get("winner").and_then(Value::as_str).unwrap_or("");
            let option = tally.get("option").and_then(Value::as_str).unwrap_or("");
            let price = tally.get("price").and_then(Value::as_f64).unwrap_or(0.0);
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();

            let winner_agent = agents.iter().find(|a| a.name == winner_name).cloned();
            let agent = match winner_agent {
                Some(a) => a,
                None => return,
            };

            let prompt = prompt::expand_owned(
                REJUSTIFICATION_PROMPT,
                &[
                    ("option", option),
                    ("price", &price.to_string()),
                    ("question", question.as_str()),
                ],
            );
            if let Ok(outcome) = call(&config, &agent, &prompt, 1024).await {
                bb.write(
                    "rejustification",
                    Value::String(outcome.text),
                    agent.name.clone(),
                    "rejustification",
                    HashMap::new(),
                );
            }
        })
    })
}

pub fn build_vickrey() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "vickrey-auction".to_string(),
        stages: vec![
            StageDescriptor::new("options", trigger::always(), options_stage()),
            StageDescriptor::new("bids", trigger::after("options"), bid_stage()),
            StageDescriptor::new("tally", trigger::after("bids"), vickrey_tally_stage()),
            StageDescriptor::new("rejustification", trigger::after("tally"), rejustification_stage()),
            StageDescriptor::new(
                "synthesis",
                trigger::after("rejustification"),
                synthesis_stage(vec!["tally".to_string(), "rejustification".to_string()], "synthesis", VICKREY_SYNTHESIS_PROMPT),
            ),
        ],
    }
}

pub fn build_borda() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "borda-count".to_string(),
        stages: vec![
            StageDescriptor::new("options", trigger::always(), options_stage()),
            StageDescriptor::new("ballots", trigger::after("options"), rank_ballot_stage()),
            StageDescriptor::new("tally", trigger::after("ballots"), borda_tally_stage()),
            StageDescriptor::new(
                "synthesis",
                trigger::after("tally"),
                synthesis_stage(vec!["tally".to_string()], "synthesis", BORDA_SYNTHESIS_PROMPT),
            ),
        ],
    }
}

pub fn build_condorcet() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "condorcet-method".to_string(),
        stages: vec![
            StageDescriptor::new("options", trigger::always(), options_stage()),
            StageDescriptor::new("ballots", trigger::after("options"), rank_ballot_stage()),
            StageDescriptor::new("tally", trigger::after("ballots"), condorcet_tally_stage()),
            StageDescriptor::new(
                "synthesis",
                trigger::after("tally"),
                synthesis_stage(vec!["tally".to_string()], "synthesis", CONDORCET_SYNTHESIS_PROMPT),
            ),
        ],
    }
}

fn extract_common(bb: &Blackboard, ballots_topic: &str) -> ProtocolResult {
    let mut outputs: Vec<NamedOutput> = bb
        .read(ballots_topic, None)
        .into_iter()
        .map(|e| NamedOutput { name: e.author, output: text_of(&e.content) })
        .collect();
    if let Some(e) = bb.read_latest("tally", None) {
        outputs.push(NamedOutput { name: "tally".to_string(), output: e.content.to_string() });
    }
    let synthesis = bb.read_latest("synthesis", None).map(|e| text_of(&e.content));
    ProtocolResult {
        variant: ProtocolResultVariant::Stages(outputs),
        synthesis,
    }
}

pub fn extract_vickrey(bb: &Blackboard) -> ProtocolResult {
    let mut result = extract_common(bb, "bids");
    if let Some(e) = bb.read_latest("rejustification", None) {
        if let ProtocolResultVariant::Stages(outputs) = &mut result.variant {
            outputs.push(NamedOutput { name: "rejustification".to_string(), output: text_of(&e.content) });
        }
    }
    result
}

pub fn extract_borda(bb: &Blackboard) -> ProtocolResult {
    extract_common(bb, "ballots")
}

pub fn extract_condorcet(bb: &Blackboard) -> ProtocolResult {
    extract_common(bb, "ballots")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairwise_wins_counts_ballots_preferring_winner() {
        let rankings = vec![vec!["A".to_string(), "B".to_string()], vec!["B".to_string(), "A".to_string()], vec!["A".to_string(), "B".to_string()]];
        assert_eq!(pairwise_wins(&rankings, "A", "B"), 2);
        assert_eq!(pairwise_wins(&rankings, "B", "A"), 1);
    }

    #[tokio::test]
    async fn borda_tally_picks_highest_point_total() {
        let bb = Arc::new(Blackboard::new("borda-count"));
        bb.write("options", serde_json::json!({"options": ["A", "B", "C"]}), "system", "options", Default::default());
        bb.write("ballots", serde_json::json!({"ranking": ["A", "B", "C"]}), "x", "ballots", Default::default());
        bb.write("ballots", serde_json::json!({"ranking": ["A", "C", "B"]}), "y", "ballots", Default::default());
        bb.write("ballots", serde_json::json!({"ranking": ["B", "A", "C"]}), "z", "ballots", Default::default());

        let stage = borda_tally_stage();
        let config = test_config();
        stage(bb.clone(), vec![], config).await;

        let tally = bb.read_latest("tally", None).unwrap().content;
        assert_eq!(tally["winner"], "A");
    }

    #[test]
    fn build_vickrey_has_five_stages() {
        let protocol = build_vickrey();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["options", "bids", "tally", "rejustification", "synthesis"]);
    }

    #[test]
    fn build_borda_has_four_stages() {
        let protocol = build_borda();
        assert_eq!(protocol.stages.len(), 4);
    }

    #[test]
    fn build_condorcet_has_four_stages() {
        let protocol = build_condorcet();
        assert_eq!(protocol.stages.len(), 4);
    }

    #[tokio::test]
    async fn vickrey_tally_winner_pays_second_highest_confidence() {
        let bb = Arc::new(Blackboard::new("vickrey-auction"));
        bb.write("bids", serde_json::json!({"option": "A", "confidence": 90}), "x", "bids", Default::default());
        bb.write("bids", serde_json::json!({"option": "B", "confidence": 60}), "y", "bids", Default::default());
        bb.write("bids", serde_json::json!({"option": "A", "confidence": 75}), "z", "bids", Default::default());

        let stage = vickrey_tally_stage();
        let config = test_config();
        stage(bb.clone(), vec![], config).await;

        let tally = bb.read_latest("tally", None).unwrap().content;
        assert_eq!(tally["winner"], "x");
        assert_eq!(tally["price"], 75.0);
    }

    #[tokio::test]
    async fn condorcet_tally_finds_winner_that_beats_every_option() {
        let bb = Arc::new(Blackboard::new("condorcet-method"));
        bb.write("options", serde_json::json!({"options": ["A", "B", "C"]}), "system", "options", Default::default());
        bb.write("ballots", serde_json::json!({"ranking": ["A", "B", "C"]}), "x", "ballots", Default::default());
        bb.write("ballots", serde_json::json!({"ranking": ["A", "C", "B"]}), "y", "ballots", Default::default());
        bb.write("ballots", serde_json::json!({"ranking": ["A", "B", "C"]}), "z", "ballots", Default::default());

        let stage = condorcet_tally_stage();
        let config = test_config();
        stage(bb.clone(), vec![], config).await;

        let tally = bb.read_latest("tally", None).unwrap().content;
        assert_eq!(tally["winner"], "A");
        assert_eq!(tally["condorcet_winner_exists"], true);
    }

    fn test_config() -> Arc<StageConfig> {
        use crate::cloudllm::client_wrapper::{ClientWrapper, ToolDefinition};
        use crate::engine::gateway::{Gateway, GatewayContext, SingleProviderRouter};
        use async_trait::async_trait;
        use std::error::Error;

        struct Unused;
        #[async_trait]
        impl ClientWrapper for Unused {
            async fn send_message(&self, _m: &[Message], _t: Option<Vec<ToolDefinition>>) -> Result<Message, Box<dyn Error>> {
                Ok(Message { role: Role::Assistant, content: Arc::from(""), tool_calls: vec![] })
            }
            fn model_name(&self) -> &str {
                "unused"
            }
        }
        let router = Arc::new(SingleProviderRouter(Arc::new(Unused) as Arc<dyn ClientWrapper>));
        Arc::new(StageConfig {
            gateway: Arc::new(Gateway::new(router)),
            ctx: GatewayContext::none(),
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            max_tokens: 1024,
        })
    }
}
