//! P18: Delphi Method — iterative expert estimation with anonymous feedback
//! and convergence detection.
//!
//! The orchestrator loop has no imperative `for`/`break`, so each round is
//! its own stage pinned to a fixed slot (round 1..3) and a trigger checks the
//! previous round's `converged` flag before firing the next one. A `*_done`
//! gate stage per round writes a `delphi_done` marker the first time either
//! `converged` is true or the round cap is hit, and synthesis waits on that
//! marker instead of guessing which round was last.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::engine::agents::Agent;
use crate::engine::blackboard::{Blackboard, BlackboardEntry};
use crate::engine::gateway::CompletionRequest;
use crate::engine::orchestrator::{NamedResponse, ProtocolDef, ProtocolResult, ProtocolResultVariant, RoundResult, StageDescriptor};
use crate::engine::prompt;
use crate::engine::stage::{compute_stage, StageConfig, StageFn};
use crate::engine::trigger::{self, Trigger};

use super::json_util;

const MAX_ROUNDS: usize = 3;
/// Converged once the IQR spread is under 15% of the median, mirroring
/// `_check_convergence`.
const CONVERGENCE_THRESHOLD: f64 = 0.15;

const INITIAL_ESTIMATE_PROMPT: &str = "\
You are participating in a Delphi estimation exercise.

Question requiring a numerical estimate:
{question}

Your role: {agent_name}
{system_prompt}

Provide your independent estimate for the question above. Think carefully about the factors that \
drive this number, and provide a confidence interval (low and high bounds).

Respond in JSON:
{{\"estimate\": 42.5, \"confidence_low\": 30.0, \"confidence_high\": 55.0, \"reasoning\": \"Detailed \
explanation of how you arrived at this estimate, what factors you considered, and what assumptions you \
made.\"}}";

const REVISION_ESTIMATE_PROMPT: &str = "\
You are participating in a Delphi estimation exercise (Round {round_number}).

Question requiring a numerical estimate:
{question}

Your role: {agent_name}
{system_prompt}

## Your Previous Estimate
- Estimate: {previous_estimate}
- Confidence range: {previous_low} to {previous_high}
- Your reasoning: {previous_reasoning}

## Anonymous Group Statistics (Round {previous_round})
- Median estimate: {median}
- Interquartile range: {iqr_low} to {iqr_high}
- Spread (IQR width): {spread}

## Anonymous Reasoning from Other Panelists
{anonymous_reasoning}

Review the group statistics and reasoning above. You may revise your estimate or keep it the same. If \
your estimate differs significantly from the median, explain why you believe your position is justified.

Respond in JSON:
{{\"estimate\": 42.5, \"confidence_low\": 30.0, \"confidence_high\": 55.0, \"reasoning\": \"Updated \
explanation \u{2014} what changed or why you held firm.\"}}";

const FINAL_SYNTHESIS_PROMPT: &str = "\
You are synthesizing the results of a Delphi estimation exercise.

Question:
{question}

The panel went through {rounds_used} round(s) of estimation.{convergence_note}

## Final Round Estimates
{estimates_block}

## Final Statistics
- Median: {final_median}
- IQR: {iqr_low} to {iqr_high}
- Spread (IQR width): {spread}

Produce a concise synthesis that explains: the final consensus estimate and what it means; key factors \
the panelists agreed on; key areas of disagreement or uncertainty; how estimates evolved across rounds \
(if multiple rounds).

Respond in JSON:
{{\"summary\": ..., \"key_agreements\": [...], \"key_disagreements\": [...], \"evolution_notes\": ...}}";

pub fn build() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "delphi-method".to_string(),
        stages: vec![
            StageDescriptor::new("round_1_estimates", trigger::always(), initial_round_stage()),
            StageDescriptor::new(
                "round_1_stats",
                trigger::after("round_1_estimates"),
                compute_stage("round_1_estimates", "round_1_stats", |entries| compute_stats(1, entries)),
            ),
            StageDescriptor::new("round_1_done", trigger::after("round_1_stats"), round_done_gate(1)),
            StageDescriptor::new(
                "round_2_estimates",
                not_converged_after("round_1_stats"),
                revision_round_stage(2, "round_1_stats", "round_1_estimates"),
            ),
            StageDescriptor::new(
                "round_2_stats",
                trigger::after("round_2_estimates"),
                compute_stage("round_2_estimates", "round_2_stats", |entries| compute_stats(2, entries)),
            ),
            StageDescriptor::new("round_2_done", trigger::after("round_2_stats"), round_done_gate(2)),
            StageDescriptor::new(
                "round_3_estimates",
                not_converged_after("round_2_stats"),
                revision_round_stage(3, "round_2_stats", "round_2_estimates"),
            ),
            StageDescriptor::new(
                "round_3_stats",
                trigger::after("round_3_estimates"),
                compute_stage("round_3_estimates", "round_3_stats", |entries| compute_stats(3, entries)),
            ),
            StageDescriptor::new("round_3_done", trigger::after("round_3_stats"), round_done_gate(3)),
            StageDescriptor::new("synthesis", trigger::after("delphi_done"), synthesis_stage_fn()),
        ],
    }
}

async fn call(config: &StageConfig, agent: &Agent, prompt: &str, max_tokens: usize) -> Result<String, ()> {
    config
        .gateway
        .complete(
            CompletionRequest {
                agent,
                fallback_model: &config.thinking_model,
                messages: vec![Message { role: Role::User, content: Arc::from(prompt), tool_calls: vec![] }],
                max_tokens,
                system_override: None,
                tools: None,
            },
            &config.ctx,
        )
        .await
        .map(|outcome| outcome.text)
        .map_err(|_| ())
}

fn initial_round_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| super::text_of(&e.content)).unwrap_or_default();

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        INITIAL_ESTIMATE_PROMPT,
                        &[("question", question.as_str()), ("agent_name", agent.name.as_str()), ("system_prompt", agent.system_prompt.as_str())],
                    );
                    if let Ok(text) = call(&config, &agent, &prompt, 4096).await {
                        let parsed = json_util::parse_json_object(&text);
                        bb.write("round_1_estimates", parsed, agent.name.clone(), "round_1_estimates", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

fn revision_round_stage(round_number: usize, prev_stats_topic: &'static str, prev_estimates_topic: &'static str) -> StageFn {
    let out_topic: &'static str = match round_number {
        2 => "round_2_estimates",
        _ => "round_3_estimates",
    };
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| super::text_of(&e.content)).unwrap_or_default();
            let stats = match bb.read_latest(prev_stats_topic, None) {
                Some(e) => e.content,
                None => return,
            };
            let prev_estimates = bb.read(prev_estimates_topic, None);

            let anonymous_reasoning = prev_estimates
                .iter()
                .enumerate()
                .map(|(i, e)| {
                    format!(
                        "- Panelist {} (estimate: {}): {}",
                        i + 1,
                        e.content.get("estimate").cloned().unwrap_or(Value::Null),
                        e.content.get("reasoning").and_then(Value::as_str).unwrap_or(""),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");

            let median = stats.get("median").cloned().unwrap_or(Value::Null).to_string();
            let iqr_low = stats.get("iqr_low").cloned().unwrap_or(Value::Null).to_string();
            let iqr_high = stats.get("iqr_high").cloned().unwrap_or(Value::Null).to_string();
            let spread = stats.get("spread").cloned().unwrap_or(Value::Null).to_string();
            let previous_round = (round_number - 1).to_string();
            let round_number_str = round_number.to_string();

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                let anonymous_reasoning = anonymous_reasoning.clone();
                let median = median.clone();
                let iqr_low = iqr_low.clone();
                let iqr_high = iqr_high.clone();
                let spread = spread.clone();
                let previous_round = previous_round.clone();
                let round_number_str = round_number_str.clone();
                let prev = prev_estimates.iter().find(|e| e.author == agent.name).cloned();
                handles.push(tokio::spawn(async move {
                    let (previous_estimate, previous_low, previous_high, previous_reasoning) = match &prev {
                        Some(e) => (
                            e.content.get("estimate").cloned().unwrap_or(Value::Null).to_string(),
                            e.content.get("confidence_low").cloned().unwrap_or(Value::Null).to_string(),
                            e.content.get("confidence_high").cloned().unwrap_or(Value::Null).to_string(),
                            e.content.get("reasoning").and_then(Value::as_str).unwrap_or("").to_string(),
                        ),
                        None => ("N/A".to_string(), "N/A".to_string(), "N/A".to_string(), "N/A".to_string()),
                    };
                    let prompt = prompt::expand_owned(
                        REVISION_ESTIMATE_PROMPT,
                        &[
                            ("round_number", round_number_str.as_str()),
                            ("question", question.as_str()),
                            ("agent_name", agent.name.as_str()),
                            ("system_prompt", agent.system_prompt.as_str()),
                            ("previous_estimate", previous_estimate.as_str()),
                            ("previous_low", previous_low.as_str()),
                            ("previous_high", previous_high.as_str()),
                            ("previous_reasoning", previous_reasoning.as_str()),
                            ("previous_round", previous_round.as_str()),
                            ("median", median.as_str()),
                            ("iqr_low", iqr_low.as_str()),
                            ("iqr_high", iqr_high.as_str()),
                            ("spread", spread.as_str()),
                            ("anonymous_reasoning", anonymous_reasoning.as_str()),
                        ],
                    );
                    if let Ok(text) = call(&config, &agent, &prompt, 4096).await {
                        let parsed = json_util::parse_json_object(&text);
                        bb.write(out_topic, parsed, agent.name.clone(), out_topic, HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

/// Median and IQR over this round's reported estimates, and whether the
/// spread is under 15% of the median. With fewer than 4 estimates the
/// original falls back to min/max as the IQR bounds; kept as-is.
fn compute_stats(round_number: usize, entries: &[BlackboardEntry]) -> Option<Value> {
    if entries.is_empty() {
        return None;
    }
    let mut values: Vec<f64> = entries.iter().map(|e| e.content.get("estimate").and_then(Value::as_f64).unwrap_or(0.0)).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len();
    let median = if n % 2 == 1 { values[n / 2] } else { (values[n / 2 - 1] + values[n / 2]) / 2.0 };
    let (iqr_low, iqr_high) = if n < 4 {
        (values[0], values[n - 1])
    } else {
        (values[n / 4], values[(3 * n) / 4])
    };
    let spread = iqr_high - iqr_low;
    let converged = if median == 0.0 { spread == 0.0 } else { (spread / median).abs() < CONVERGENCE_THRESHOLD };
    Some(serde_json::json!({
        "round": round_number,
        "median": median,
        "iqr_low": iqr_low,
        "iqr_high": iqr_high,
        "spread": spread,
        "converged": converged,
    }))
}

/// Fires the next round only if the previous round's stats say it hasn't
/// converged yet.
fn not_converged_after(stats_topic: &'static str) -> Trigger {
    Box::new(move |bb| match bb.read_latest(stats_topic, None) {
        Some(e) => !e.content.get("converged").and_then(Value::as_bool).unwrap_or(false),
        None => false,
    })
}

/// Writes the `delphi_done` marker the first time this round either
/// converged or hit the round cap — whichever round reaches this first wins,
/// since later rounds' gates never get a chance to fire once it exists.
fn round_done_gate(round_number: usize) -> StageFn {
    let stats_topic: &'static str = match round_number {
        1 => "round_1_stats",
        2 => "round_2_stats",
        _ => "round_3_stats",
    };
    Arc::new(move |bb, _agents, _config| {
        Box::pin(async move {
            if !bb.stages_completed().contains("delphi_done") {
                if let Some(stats) = bb.read_latest(stats_topic, None) {
                    let converged = stats.content.get("converged").and_then(Value::as_bool).unwrap_or(false);
                    if converged || round_number >= MAX_ROUNDS {
                        bb.write("delphi_done", stats.content, "system", "delphi_done", HashMap::new());
                    }
                }
            }
        })
    })
}

fn synthesis_stage_fn() -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let done = match bb.read_latest("delphi_done", None) {
                Some(e) => e.content,
                None => return,
            };
            let question = bb.read_latest("question", None).map(|e| super::text_of(&e.content)).unwrap_or_default();
            let round_number = done.get("round").and_then(Value::as_u64).unwrap_or(1) as usize;
            let converged = done.get("converged").and_then(Value::as_bool).unwrap_or(false);
            let estimates_topic = format!("round_{round_number}_estimates");
            let estimates = bb.read(&estimates_topic, None);

            let estimates_block = estimates
                .iter()
                .map(|e| {
                    format!(
                        "- {}: {} (range: {}\u{2013}{})\n  Reasoning: {}",
                        e.author,
                        e.content.get("estimate").cloned().unwrap_or(Value::Null),
                        e.content.get("confidence_low").cloned().unwrap_or(Value::Null),
                        e.content.get("confidence_high").cloned().unwrap_or(Value::Null),
                        e.content.get("reasoning").and_then(Value::as_str).unwrap_or(""),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");

            let convergence_note = if converged {
                " The panel converged (IQR < 15% of median)."
            } else {
                " The panel did NOT converge within the allotted rounds."
            };

            let prompt = prompt::expand_owned(
                FINAL_SYNTHESIS_PROMPT,
                &[
                    ("question", question.as_str()),
                    ("rounds_used", round_number.to_string().as_str()),
                    ("convergence_note", convergence_note),
                    ("estimates_block", estimates_block.as_str()),
                    ("final_median", done.get("median").cloned().unwrap_or(Value::Null).to_string().as_str()),
                    ("iqr_low", done.get("iqr_low").cloned().unwrap_or(Value::Null).to_string().as_str()),
                    ("iqr_high", done.get("iqr_high").cloned().unwrap_or(Value::Null).to_string().as_str()),
                    ("spread", done.get("spread").cloned().unwrap_or(Value::Null).to_string().as_str()),
                ],
            );

            let agent = Agent::new("system", "system", "");
            if let Ok(text) = call(&config, &agent, &prompt, config.max_tokens).await {
                bb.write("synthesis", Value::String(text), "system", "synthesis", HashMap::new());
            }
        })
    })
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let mut rounds = Vec::new();
    for round_number in 1..=MAX_ROUNDS {
        let topic = format!("round_{round_number}_estimates");
        let entries = bb.read(&topic, None);
        if entries.is_empty() {
            break;
        }
        let responses = entries.into_iter().map(|e| NamedResponse { name: e.author, response: e.content.to_string() }).collect();
        rounds.push(RoundResult { round: round_number, responses });
    }
    let synthesis = bb.read_latest("synthesis", None).map(|e| super::text_of(&e.content));
    ProtocolResult { variant: ProtocolResultVariant::Rounds(rounds), synthesis }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_has_ten_stages() {
        let protocol = build();
        assert_eq!(protocol.stages.len(), 10);
    }

    #[test]
    fn compute_stats_converges_on_tight_spread() {
        let bb = Blackboard::new("delphi-method");
        for (agent, est) in [("A", 100.0), ("B", 101.0), ("C", 99.0), ("D", 100.0)] {
            bb.write(
                "round_1_estimates",
                serde_json::json!({"estimate": est, "confidence_low": est - 5.0, "confidence_high": est + 5.0, "reasoning": "r"}),
                agent,
                "round_1_estimates",
                Default::default(),
            );
        }
        let entries = bb.read("round_1_estimates", None);
        let stats = compute_stats(1, &entries).unwrap();
        assert_eq!(stats["converged"], true);
    }

    #[test]
    fn compute_stats_does_not_converge_on_wide_spread() {
        let bb = Blackboard::new("delphi-method");
        for (agent, est) in [("A", 10.0), ("B", 100.0), ("C", 500.0), ("D", 900.0)] {
            bb.write(
                "round_1_estimates",
                serde_json::json!({"estimate": est, "confidence_low": 0.0, "confidence_high": 0.0, "reasoning": "r"}),
                agent,
                "round_1_estimates",
                Default::default(),
            );
        }
        let entries = bb.read("round_1_estimates", None);
        let stats = compute_stats(1, &entries).unwrap();
        assert_eq!(stats["converged"], false);
    }

    #[test]
    fn not_converged_after_is_false_once_converged_flag_is_set() {
        let bb = Blackboard::new("delphi-method");
        let trig = not_converged_after("round_1_stats");
        assert!(!trig(&bb));
        bb.write("round_1_stats", serde_json::json!({"converged": false}), "system", "round_1_stats", Default::default());
        assert!(trig(&bb));
        bb.write("round_1_stats", serde_json::json!({"converged": true}), "system", "round_1_stats", Default::default());
        assert!(!trig(&bb));
    }

    #[test]
    fn round_done_gate_fires_on_round_cap_even_if_not_converged() {
        let bb = Arc::new(Blackboard::new("delphi-method"));
        bb.write("round_3_stats", serde_json::json!({"round": 3, "converged": false, "median": 1.0, "iqr_low": 0.0, "iqr_high": 2.0, "spread": 2.0}), "system", "round_3_stats", Default::default());
        let gate = round_done_gate(3);
        let config = test_config();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(gate(bb.clone(), vec![], config));
        assert!(bb.read_latest("delphi_done", None).is_some());
    }

    #[test]
    fn extract_stops_at_first_missing_round() {
        let bb = Blackboard::new("delphi-method");
        bb.write("round_1_estimates", serde_json::json!({"estimate": 1.0}), "A", "round_1_estimates", Default::default());
        let result = extract(&bb);
        match result.variant {
            ProtocolResultVariant::Rounds(rounds) => assert_eq!(rounds.len(), 1),
            _ => panic!("expected Rounds variant"),
        }
    }

    fn test_config() -> Arc<StageConfig> {
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
        Arc::new(StageConfig {
            gateway: Arc::new(Gateway::new(router)),
            ctx: GatewayContext::none(),
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            max_tokens: 1024,
        })
    }
}
