//! P17: Red/Blue/White Team — adversarial stress-testing. Red agents attack
//! a plan, Blue agents defend against every attack, a White agent
//! adjudicates each vulnerability/defense pair, then renders a final
//! assessment.
//!
//! Team membership is a category filter (`@red`/`@blue`/`@white`) on
//! [`StageDescriptor::with_agents_filter`], so the roster still comes from
//! one agent list the way every other protocol in this crate takes it.

use std::collections::HashMap;
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
use crate::engine::stage::StageConfig;
use crate::engine::stage::StageFn;
use crate::engine::trigger;

use super::{json_util, text_of};

const RED_ATTACK_PROMPT: &str = "\
Identify vulnerabilities in the following plan, from your role's perspective. For each, give an id, \
severity (Low/Medium/High/Critical), title, description, and failure scenario. Output a JSON object: \
{{\"agent\": ..., \"vulnerabilities\": [{{\"id\": ..., \"severity\": ..., \"title\": ..., \
\"description\": ..., \"failure_scenario\": ...}}]}}.

Question: {question}

PLAN:
{plan}

ROLE: {agent_name}
PERSPECTIVE: {system_prompt}";

const BLUE_DEFENSE_PROMPT: &str = "\
Defend the plan against the vulnerabilities below, from your role's perspective. For each vulnerability \
you address, give its id, a defense type, your response, supporting evidence, and the residual risk left \
over. Output a JSON object: {{\"agent\": ..., \"mitigations\": [{{\"vulnerability_id\": ..., \
\"defense_type\": ..., \"response\": ..., \"evidence\": ..., \"residual_risk\": ...}}]}}.

Question: {question}

PLAN:
{plan}

ATTACKS:
{attacks_block}

ROLE: {agent_name}
PERSPECTIVE: {system_prompt}";

const WHITE_ADJUDICATE_PROMPT: &str = "\
Adjudicate each vulnerability against the defenses offered for it. For each, decide a verdict of \
Resolved, Partially Resolved, or Open. Output a JSON object: {{\"adjudications\": [{{\"vulnerability_id\": \
..., \"vulnerability_title\": ..., \"severity\": ..., \"verdict\": ..., \"reasoning\": ..., \
\"defense_gaps\": ..., \"recommended_action\": ...}}]}}.

Question: {question}

PLAN:
{plan}

ATTACKS:
{attacks_block}

DEFENSES:
{defenses_block}";

const FINAL_ASSESSMENT_PROMPT: &str = "\
Summarize the outcome of this Red/Blue/White exercise: which risks are resolved, which remain open, an \
overall plan strength score from 0-100, and concrete recommendations. Output a JSON object: \
{{\"resolved_risks\": [...], \"open_risks\": [...], \"plan_strength_score\": ..., \"recommendations\": \
[...]}}.

Question: {question}

PLAN:
{plan}

ADJUDICATIONS:
{adjudication_block}";

pub fn build() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "red-blue-white".to_string(),
        stages: vec![
            StageDescriptor::new("red_attacks", trigger::always(), red_attack_stage()).with_agents_filter("@red"),
            StageDescriptor::new("blue_defenses", trigger::after("red_attacks"), blue_defense_stage()).with_agents_filter("@blue"),
            StageDescriptor::new("adjudication", trigger::after("blue_defenses"), white_adjudicate_stage()).with_agents_filter("@white"),
            StageDescriptor::new("synthesis", trigger::after("adjudication"), final_assessment_stage()).with_agents_filter("@white"),
        ],
    }
}

/// The `{question}`/`{plan}` split: the seed question is `"<question>\n\nPLAN:\n<plan>"`
/// (the only seed topic `Orchestrator::run` writes is `question`), so every
/// stage here re-splits it on the first `"\n\nPLAN:\n"` marker rather than
/// reading a second seed topic.
fn split_question_and_plan(seed: &str) -> (String, String) {
    match seed.split_once("\n\nPLAN:\n") {
        Some((question, plan)) => (question.to_string(), plan.to_string()),
        None => (seed.to_string(), String::new()),
    }
}

fn red_attack_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let seed = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let (question, plan) = split_question_and_plan(&seed);

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                let plan = plan.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        RED_ATTACK_PROMPT,
                        &[
                            ("question", question.as_str()),
                            ("plan", plan.as_str()),
                            ("agent_name", agent.name.as_str()),
                            ("system_prompt", agent.system_prompt.as_str()),
                        ],
                    );
                    if let Ok(outcome) = call(&config, &agent, &prompt, 8192).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        bb.write("red_attacks", parsed, agent.name.clone(), "red_attacks", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

fn format_attacks_block(attacks: &[Value]) -> String {
    let mut lines = Vec::new();
    for attack in attacks {
        let agent = attack.get("agent").and_then(Value::as_str).unwrap_or("");
        let empty = vec![];
        let vulns = attack.get("vulnerabilities").and_then(Value::as_array).unwrap_or(&empty);
        for v in vulns {
            lines.push(format!(
                "[{}] ({}) {} \u{2014} from {}\n  Description: {}\n  Failure scenario: {}",
                v.get("id").and_then(Value::as_str).unwrap_or("?"),
                v.get("severity").and_then(Value::as_str).unwrap_or("?"),
                v.get("title").and_then(Value::as_str).unwrap_or("untitled"),
                agent,
                v.get("description").and_then(Value::as_str).unwrap_or(""),
                v.get("failure_scenario").and_then(Value::as_str).unwrap_or(""),
            ));
        }
    }
    if lines.is_empty() {
        "No attacks identified.".to_string()
    } else {
        lines.join("\n\n")
    }
}

fn format_defenses_block(defenses: &[Value]) -> String {
    let mut lines = Vec::new();
    for defense in defenses {
        let agent = defense.get("agent").and_then(Value::as_str).unwrap_or("");
        let empty = vec![];
        let mitigations = defense.get("mitigations").and_then(Value::as_array).unwrap_or(&empty);
        for m in mitigations {
            lines.push(format!(
                "Defense for {} ({}) \u{2014} from {}\n  Response: {}\n  Evidence: {}\n  Residual risk: {}",
                m.get("vulnerability_id").and_then(Value::as_str).unwrap_or("?"),
                m.get("defense_type").and_then(Value::as_str).unwrap_or("?"),
                agent,
                m.get("response").and_then(Value::as_str).unwrap_or(""),
                m.get("evidence").and_then(Value::as_str).unwrap_or(""),
                m.get("residual_risk").and_then(Value::as_str).unwrap_or(""),
            ));
        }
    }
    if lines.is_empty() {
        "No defenses provided.".to_string()
    } else {
        lines.join("\n\n")
    }
}

fn format_adjudication_block(adjudications: &[Value]) -> String {
    if adjudications.is_empty() {
        return "No adjudications.".to_string();
    }
    adjudications
        .iter()
        .map(|a| {
            format!(
                "[{}] {} (severity: {})\n  Verdict: {}\n  Reasoning: {}\n  Defense gaps: {}\n  Recommended action: {}",
                a.get("vulnerability_id").and_then(Value::as_str).unwrap_or(""),
                a.get("vulnerability_title").and_then(Value::as_str).unwrap_or(""),
                a.get("severity").and_then(Value::as_str).unwrap_or("Medium"),
                a.get("verdict").and_then(Value::as_str).unwrap_or("Open"),
                a.get("reasoning").and_then(Value::as_str).unwrap_or(""),
                a.get("defense_gaps").and_then(Value::as_str).unwrap_or(""),
                a.get("recommended_action").and_then(Value::as_str).unwrap_or(""),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn blue_defense_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let seed = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let (question, plan) = split_question_and_plan(&seed);
            let attacks: Vec<Value> = bb.read("red_attacks", None).into_iter().map(|e| e.content).collect();
            let attacks_block = format_attacks_block(&attacks);

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                let plan = plan.clone();
                let attacks_block = attacks_block.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        BLUE_DEFENSE_PROMPT,
                        &[
                            ("question", question.as_str()),
                            ("plan", plan.as_str()),
                            ("attacks_block", attacks_block.as_str()),
                            ("agent_name", agent.name.as_str()),
                            ("system_prompt", agent.system_prompt.as_str()),
                        ],
                    );
                    if let Ok(outcome) = call(&config, &agent, &prompt, 8192).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        bb.write("blue_defenses", parsed, agent.name.clone(), "blue_defenses", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

fn white_adjudicate_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let seed = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let (question, plan) = split_question_and_plan(&seed);
            let attacks: Vec<Value> = bb.read("red_attacks", None).into_iter().map(|e| e.content).collect();
            let defenses: Vec<Value> = bb.read("blue_defenses", None).into_iter().map(|e| e.content).collect();
            let attacks_block = format_attacks_block(&attacks);
            let defenses_block = format_defenses_block(&defenses);

            let white = agents.into_iter().next().unwrap_or_else(|| Agent::new("white", "White", ""));
            let prompt = prompt::expand_owned(
                WHITE_ADJUDICATE_PROMPT,
                &[
                    ("question", question.as_str()),
                    ("plan", plan.as_str()),
                    ("attacks_block", attacks_block.as_str()),
                    ("defenses_block", defenses_block.as_str()),
                ],
            );
            if let Ok(outcome) = call(&config, &white, &prompt, 14096).await {
                let parsed = json_util::parse_json_object(&outcome.text);
                let adjudications = parsed.get("adjudications").cloned().unwrap_or(Value::Array(vec![]));
                bb.write("adjudication", adjudications, white.name.clone(), "adjudication", HashMap::new());
            }
        })
    })
}

fn final_assessment_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let seed = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let (question, plan) = split_question_and_plan(&seed);
            let adjudications: Vec<Value> = bb
                .read_latest("adjudication", None)
                .map(|e| match e.content {
                    Value::Array(items) => items,
                    _ => vec![],
                })
                .unwrap_or_default();
            let adjudication_block = format_adjudication_block(&adjudications);

            let white = agents.into_iter().next().unwrap_or_else(|| Agent::new("white", "White", ""));
            let prompt = prompt::expand_owned(
                FINAL_ASSESSMENT_PROMPT,
                &[
                    ("question", question.as_str()),
                    ("plan", plan.as_str()),
                    ("adjudication_block", adjudication_block.as_str()),
                ],
            );
            if let Ok(outcome) = call(&config, &white, &prompt, 4096).await {
                bb.write("synthesis", Value::String(outcome.text), white.name.clone(), "synthesis", HashMap::new());
            }
        })
    })
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
                system_override: None,
                tools: None,
            },
            &config.ctx,
        )
        .await
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let mut outputs = Vec::new();
    for e in bb.read("red_attacks", None) {
        outputs.push(NamedOutput { name: format!("attack:{}", e.author), output: e.content.to_string() });
    }
    for e in bb.read("blue_defenses", None) {
        outputs.push(NamedOutput { name: format!("defense:{}", e.author), output: e.content.to_string() });
    }
    if let Some(e) = bb.read_latest("adjudication", None) {
        outputs.push(NamedOutput { name: "adjudication".to_string(), output: e.content.to_string() });
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
    fn build_has_four_stages_each_team_scoped() {
        let protocol = build();
        let filters: Vec<Option<&str>> = protocol.stages.iter().map(|s| s.agents_filter.as_deref()).collect();
        assert_eq!(filters, vec![Some("@red"), Some("@blue"), Some("@white"), Some("@white")]);
    }

    #[test]
    fn split_question_and_plan_separates_on_marker() {
        let (q, p) = split_question_and_plan("Should we launch?\n\nPLAN:\nShip next Tuesday.");
        assert_eq!(q, "Should we launch?");
        assert_eq!(p, "Ship next Tuesday.");
    }

    #[test]
    fn split_question_and_plan_falls_back_when_no_marker() {
        let (q, p) = split_question_and_plan("just a question");
        assert_eq!(q, "just a question");
        assert_eq!(p, "");
    }

    #[test]
    fn extract_yields_stages_variant_with_attacks_and_defenses() {
        let bb = Blackboard::new("red-blue-white");
        bb.write("red_attacks", serde_json::json!({"agent": "A", "vulnerabilities": []}), "A", "red_attacks", Default::default());
        bb.write("blue_defenses", serde_json::json!({"agent": "B", "mitigations": []}), "B", "blue_defenses", Default::default());
        let result = extract(&bb);
        match result.variant {
            ProtocolResultVariant::Stages(outputs) => assert_eq!(outputs.len(), 2),
            _ => panic!("expected Stages variant"),
        }
    }
}
