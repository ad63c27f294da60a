//! P23: Cynefin Probe — classify which Cynefin domain the question sits in,
//! then respond with the domain-appropriate move instead of one generic
//! answer.
//!
//! The domain set is closed to the five Cynefin values; a classification
//! vote with no majority (or an even split) falls back to `confused`, which
//! gets its own "ask clarifying questions first" response template rather
//! than guessing.

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
use crate::engine::stage::{compute_stage, StageConfig, StageFn};
use crate::engine::trigger;

use super::{json_util, text_of};

const DOMAINS: [&str; 5] = ["clear", "complicated", "complex", "chaotic", "confused"];

const CLASSIFICATION_PROMPT: &str = "\
Classify the following question into exactly one Cynefin domain: clear (best practice applies, cause \
and effect obvious), complicated (good practice, needs expert analysis), complex (cause and effect only \
clear in hindsight, requires probing), chaotic (no clear cause and effect, requires immediate \
stabilizing action), or confused (not enough information to classify). Output a JSON object: \
{{\"domain\": ..., \"reasoning\": ...}}.

Question: {question}";

const CLEAR_RESPONSE_PROMPT: &str = "\
This question falls in the Cynefin \"clear\" domain: sense, categorize, respond. Identify the \
established best practice that applies and give a direct, actionable answer.

Question: {question}

CLASSIFICATIONS:
{classifications_block}";

const COMPLICATED_RESPONSE_PROMPT: &str = "\
This question falls in the Cynefin \"complicated\" domain: sense, analyze, respond. Lay out the expert \
analysis needed and the range of good-practice options it points to, with a recommendation.

Question: {question}

CLASSIFICATIONS:
{classifications_block}";

const COMPLEX_RESPONSE_PROMPT: &str = "\
This question falls in the Cynefin \"complex\" domain: probe, sense, respond. Propose small, safe-to-fail \
experiments that would reveal which approach actually works, rather than a single upfront answer.

Question: {question}

CLASSIFICATIONS:
{classifications_block}";

const CHAOTIC_RESPONSE_PROMPT: &str = "\
This question falls in the Cynefin \"chaotic\" domain: act, sense, respond. Identify the immediate \
stabilizing action to take first, before any analysis, to establish enough order to move to a calmer \
domain.

Question: {question}

CLASSIFICATIONS:
{classifications_block}";

const CONFUSED_RESPONSE_PROMPT: &str = "\
The classifiers could not agree on a Cynefin domain for this question \u{2014} it may itself be \
unclear which domain applies. Before recommending an approach, list the specific clarifying questions \
that would resolve the ambiguity.

Question: {question}

CLASSIFICATIONS:
{classifications_block}";

pub fn build() -> ProtocolDef {
    ProtocolDef {
        protocol_id: "cynefin-probe".to_string(),
        stages: vec![
            StageDescriptor::new("classifications", trigger::always(), classification_stage()),
            StageDescriptor::new(
                "consensus",
                trigger::after("classifications"),
                compute_stage("classifications", "consensus", compute_consensus),
            ),
            StageDescriptor::new("domain_response", trigger::after("consensus"), domain_response_stage()),
            StageDescriptor::new(
                "synthesis",
                trigger::after("domain_response"),
                crate::engine::stage::synthesis_stage(
                    vec!["domain_response".to_string()],
                    "synthesis",
                    "Summarize the recommended move for this question.\n\nQuestion: {question}\n\n{domain_response}",
                ),
            ),
        ],
    }
}

/// Majority vote over each classifier's reported domain; ties (including a
/// 1-1 split between two agents) fall back to `confused` rather than
/// picking arbitrarily.
fn compute_consensus(entries: &[BlackboardEntry]) -> Option<Value> {
    if entries.is_empty() {
        return None;
    }
    let mut votes: HashMap<&'static str, usize> = HashMap::new();
    for entry in entries {
        let domain = entry.content.get("domain").and_then(Value::as_str).unwrap_or("");
        if let Some(known) = DOMAINS.iter().find(|d| **d == domain) {
            *votes.entry(known).or_insert(0) += 1;
        }
    }
    let max = votes.values().copied().max().unwrap_or(0);
    let leaders: Vec<&&str> = votes.iter().filter(|(_, count)| **count == max).map(|(d, _)| d).collect();
    let domain = if max == 0 || leaders.len() > 1 {
        "confused"
    } else {
        leaders[0]
    };
    Some(serde_json::json!({ "domain": domain, "votes": votes }))
}

fn template_for(domain: &str) -> &'static str {
    match domain {
        "clear" => CLEAR_RESPONSE_PROMPT,
        "complicated" => COMPLICATED_RESPONSE_PROMPT,
        "complex" => COMPLEX_RESPONSE_PROMPT,
        "chaotic" => CHAOTIC_RESPONSE_PROMPT,
        _ => CONFUSED_RESPONSE_PROMPT,
    }
}

fn classifications_block(bb: &Blackboard) -> String {
    bb.read("classifications", None)
        .into_iter()
        .map(|e| {
            format!(
                "- {} classified this as \"{}\": {}",
                e.author,
                e.content.get("domain").and_then(Value::as_str).unwrap_or(""),
                e.content.get("reasoning").and_then(Value::as_str).unwrap_or(""),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Each agent classifies the question independently; the response is parsed
/// as a JSON object (not text-wrapped) so [`compute_consensus`] can read
/// `domain`/`reasoning` straight off the blackboard entry.
fn classification_stage() -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(CLASSIFICATION_PROMPT, &[("question", question.as_str())]);
                    if let Ok(outcome) = call(&config, &agent, &prompt, 1024).await {
                        let parsed = json_util::parse_json_object(&outcome.text);
                        bb.write("classifications", parsed, agent.name.clone(), "classifications", HashMap::new());
                    }
                }));
            }
            join_all(handles).await;
        })
    })
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

fn domain_response_stage() -> StageFn {
    Arc::new(move |bb, _agents, config| {
        Box::pin(async move {
            let consensus = match bb.read_latest("consensus", None) {
                Some(e) => e.content,
                None => return,
            };
            let domain = consensus.get("domain").and_then(Value::as_str).unwrap_or("confused");
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let block = classifications_block(&bb);

            let prompt = prompt::expand_owned(
                template_for(domain),
                &[("question", question.as_str()), ("classifications_block", block.as_str())],
            );

            let agent = Agent::new("system", "system", "");
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
                let mut metadata = HashMap::new();
                metadata.insert("domain".to_string(), Value::String(domain.to_string()));
                bb.write("domain_response", Value::String(outcome.text), "system", "domain_response", metadata);
            }
        })
    })
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let mut outputs: Vec<NamedOutput> = bb
        .read("classifications", None)
        .into_iter()
        .map(|e| NamedOutput { name: e.author, output: text_of(&e.content) })
        .collect();
    if let Some(e) = bb.read_latest("consensus", None) {
        outputs.push(NamedOutput { name: "consensus".to_string(), output: e.content.to_string() });
    }
    if let Some(e) = bb.read_latest("domain_response", None) {
        outputs.push(NamedOutput { name: "domain_response".to_string(), output: text_of(&e.content) });
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
    fn build_has_four_stages() {
        let protocol = build();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["classifications", "consensus", "domain_response", "synthesis"]);
    }

    #[test]
    fn consensus_picks_majority_domain() {
        let bb = Blackboard::new("cynefin-probe");
        bb.write("classifications", serde_json::json!({"domain": "complex", "reasoning": "r"}), "A", "classifications", Default::default());
        bb.write("classifications", serde_json::json!({"domain": "complex", "reasoning": "r"}), "B", "classifications", Default::default());
        bb.write("classifications", serde_json::json!({"domain": "chaotic", "reasoning": "r"}), "C", "classifications", Default::default());
        let entries = bb.read("classifications", None);
        let consensus = compute_consensus(&entries).unwrap();
        assert_eq!(consensus["domain"], "complex");
    }

    #[test]
    fn consensus_falls_back_to_confused_on_tie() {
        let bb = Blackboard::new("cynefin-probe");
        bb.write("classifications", serde_json::json!({"domain": "clear", "reasoning": "r"}), "A", "classifications", Default::default());
        bb.write("classifications", serde_json::json!({"domain": "chaotic", "reasoning": "r"}), "B", "classifications", Default::default());
        let entries = bb.read("classifications", None);
        let consensus = compute_consensus(&entries).unwrap();
        assert_eq!(consensus["domain"], "confused");
    }

    #[tokio::test]
    async fn classification_stage_writes_parsed_json_not_wrapped_text() {
        use crate::cloudllm::client_wrapper::{ClientWrapper, ToolDefinition};
        use crate::engine::gateway::{Gateway, GatewayContext, SingleProviderRouter};
        use async_trait::async_trait;
        use std::error::Error;

        struct JsonClient;
        #[async_trait]
        impl ClientWrapper for JsonClient {
            async fn send_message(&self, _messages: &[Message], _tools: Option<Vec<ToolDefinition>>) -> Result<Message, Box<dyn Error>> {
                Ok(Message {
                    role: Role::Assistant,
                    content: Arc::from("{\"domain\": \"complex\", \"reasoning\": \"needs probing\"}"),
                    tool_calls: vec![],
                })
            }
            fn model_name(&self) -> &str {
                "dummy"
            }
        }

        let bb = Arc::new(Blackboard::new("cynefin-probe"));
        bb.write("question", Value::String("what now".to_string()), "system", "init", Default::default());

        let router = Arc::new(SingleProviderRouter(Arc::new(JsonClient) as Arc<dyn ClientWrapper>));
        let config = Arc::new(StageConfig {
            gateway: Arc::new(Gateway::new(router)),
            ctx: GatewayContext::none(),
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            max_tokens: 1024,
        });

        let stage = classification_stage();
        let agents = vec![Agent::new("a", "A", "")];
        stage(bb.clone(), agents, config).await;

        let entry = bb.read_latest("classifications", None).unwrap();
        assert_eq!(entry.content.get("domain").and_then(Value::as_str), Some("complex"));
        assert_eq!(entry.content.get("reasoning").and_then(Value::as_str), Some("needs probing"));
    }

    #[test]
    fn extract_includes_classifications_consensus_and_domain_response() {
        let bb = Blackboard::new("cynefin-probe");
        bb.write("classifications", serde_json::json!({"domain": "clear", "reasoning": "r"}), "A", "classifications", Default::default());
        bb.write("consensus", serde_json::json!({"domain": "clear", "votes": {"clear": 1}}), "system", "consensus", Default::default());
        bb.write("domain_response", serde_json::Value::String("do X".to_string()), "system", "domain_response", Default::default());
        let result = extract(&bb);
        match result.variant {
            ProtocolResultVariant::Stages(outputs) => assert_eq!(outputs.len(), 3),
            _ => panic!("expected Stages variant"),
        }
    }
}
