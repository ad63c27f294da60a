//! Reusable stage executors for blackboard-driven orchestration.
//!
//! Four factory functions — `parallel_agent_stage`, `sequential_agent_stage`,
//! `mechanical_stage`, `synthesis_stage` — each dispatched through
//! [`crate::engine::gateway::Gateway`] and [`crate::engine::prompt::expand`].
//! Every factory returns a [`StageFn`]: an owned, reusable async closure a
//! [`crate::engine::orchestrator::StageDescriptor`] wraps.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use super::agents::Agent;
use super::blackboard::Blackboard;
use super::event::Event;
use super::gateway::{CompletionOutcome, CompletionRequest, Gateway, GatewayContext};
use super::prompt;
use crate::cloudllm::client_wrapper::{Message, Role};

/// The configuration every stage call needs beyond the blackboard and the
/// agent roster: which gateway to dial, what context to emit events on, and
/// which models/limits to fall back to.
#[derive(Clone)]
pub struct StageConfig {
    pub gateway: Arc<Gateway>,
    pub ctx: GatewayContext,
    /// Model used for agent-identity calls.
    pub thinking_model: String,
    /// Model used for identity-free mechanical/synthesis calls.
    pub orchestration_model: String,
    pub max_tokens: usize,
}

/// A parse callback for [`mechanical_stage`]'s raw text output, e.g. JSON
/// extraction. `None` keeps the text unparsed.
pub type ParseFn = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// One executable protocol stage: `(blackboard, agents, config) -> ()`.
/// Reusable — the same `StageFn` can back several [`StageDescriptor`]s with
/// different topics bound in at construction time.
///
/// [`StageDescriptor`]: super::orchestrator::StageDescriptor
pub type StageFn = Arc<
    dyn Fn(Arc<Blackboard>, Vec<Agent>, Arc<StageConfig>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A placeholder agent used for mechanical/synthesis calls that carry no
/// persona — its key/name are never written as a blackboard author (callers
/// always pass `"system"` explicitly for that), only its (empty) system
/// prompt matters, which [`system_override`](CompletionRequest::system_override)
/// overrides with an empty string anyway.
fn system_agent() -> Agent {
    Agent::new("system", "system", "")
}

async fn run_agent_call(bb: &Blackboard, agent: &Agent, topic_out: &str, prompt: &str, config: &StageConfig) {
    let outcome = config
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
                max_tokens: config.max_tokens,
                system_override: None,
                tools: None,
            },
            &config.ctx,
        )
        .await;

    match outcome {
        Ok(outcome) => write_agent_output(bb, agent, topic_out, &outcome, &config.ctx),
        Err(e) => {
            bb.write(
                topic_out.to_string(),
                serde_json::json!({ "error": e.to_string() }),
                agent.name.clone(),
                topic_out.to_string(),
                HashMap::new(),
            );
        }
    }
}

fn write_agent_output(
    bb: &Blackboard,
    agent: &Agent,
    topic_out: &str,
    outcome: &CompletionOutcome,
    ctx: &GatewayContext,
) {
    let mut metadata = HashMap::new();
    metadata.insert("scope".to_string(), Value::String(agent.primary_scope()));
    metadata.insert(
        "token_usage".to_string(),
        serde_json::json!({
            "input_tokens": outcome.input_tokens,
            "output_tokens": outcome.output_tokens,
        }),
    );
    bb.write(
        topic_out.to_string(),
        Value::String(outcome.text.clone()),
        agent.name.clone(),
        topic_out.to_string(),
        metadata,
    );
    if let Some(sink) = &ctx.events {
        sink.emit(Event::AgentOutput {
            agent_key: agent.key.clone(),
            text: outcome.text.clone(),
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
        });
    }
}

/// All agents answer independently, in parallel, each writing its own entry
/// to `topic_out`.
pub fn parallel_agent_stage(
    topic_in: impl Into<String>,
    topic_out: impl Into<String>,
    prompt_template: impl Into<String>,
) -> StageFn {
    let topic_in = topic_in.into();
    let topic_out = topic_out.into();
    let prompt_template = prompt_template.into();

    Arc::new(move |bb, agents, config| {
        let topic_in = topic_in.clone();
        let topic_out = topic_out.clone();
        let prompt_template = prompt_template.clone();
        Box::pin(async move {
            let input_content = bb
                .read_latest(&topic_in, None)
                .map(|e| value_to_text(&e.content))
                .unwrap_or_default();

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let topic_out = topic_out.clone();
                let prompt_template = prompt_template.clone();
                let input_content = input_content.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(
                        &prompt_template,
                        &[("question", input_content.as_str()), ("input", input_content.as_str())],
                    );
                    run_agent_call(&bb, &agent, &topic_out, &prompt, &config).await;
                }));
            }
            join_all(handles).await;
        })
    })
}

/// All agents answer independently in parallel, each first gathering every
/// prior entry on `topics_in` visible to its own scope into a
/// `{prior_arguments}`/`{prior_responses}` block. Generalizes
/// `parallel_agent_stage` for rounds that build on earlier rounds instead of
/// a single fixed input topic — each agent gathers every prior-round entry
/// visible to its own scope into a shared context block before answering.
/// `extra_values` supplies any additional fixed placeholders a specific
/// round's template needs (e.g. `round_number`).
pub fn parallel_agent_stage_with_context(
    topics_in: Vec<String>,
    topic_out: impl Into<String>,
    prompt_template: impl Into<String>,
    extra_values: Vec<(String, String)>,
) -> StageFn {
    let topic_out = topic_out.into();
    let prompt_template = prompt_template.into();

    Arc::new(move |bb, agents, config| {
        let topics_in = topics_in.clone();
        let topic_out = topic_out.clone();
        let prompt_template = prompt_template.clone();
        let extra_values = extra_values.clone();
        Box::pin(async move {
            let question = bb
                .read_latest("question", None)
                .map(|e| value_to_text(&e.content))
                .unwrap_or_default();

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let topic_out = topic_out.clone();
                let prompt_template = prompt_template.clone();
                let topics_in = topics_in.clone();
                let extra_values = extra_values.clone();
                let question = question.clone();
                handles.push(tokio::spawn(async move {
                    let mut prior_blocks = Vec::new();
                    for topic in &topics_in {
                        for e in bb.read(topic, Some(&agent)) {
                            prior_blocks.push(format!("[{}] ({}): {}", e.author, e.stage, value_to_text(&e.content)));
                        }
                    }
                    let prior_text = prior_blocks.join("\n\n");

                    let mut values: HashMap<&str, &str> = HashMap::new();
                    values.insert("question", question.as_str());
                    values.insert("input", question.as_str());
                    values.insert("prior_arguments", prior_text.as_str());
                    values.insert("prior_responses", prior_text.as_str());
                    for (k, v) in &extra_values {
                        values.insert(k.as_str(), v.as_str());
                    }
                    let prompt = prompt::expand(&prompt_template, &values);
                    run_agent_call(&bb, &agent, &topic_out, &prompt, &config).await;
                }));
            }
            join_all(handles).await;
        })
    })
}

/// Agents run in declared order, each reading every prior entry on
/// `topic_out` visible to its own scope before writing its own.
pub fn sequential_agent_stage(
    topic_in: impl Into<String>,
    topic_out: impl Into<String>,
    prompt_template: impl Into<String>,
) -> StageFn {
    let topic_in = topic_in.into();
    let topic_out = topic_out.into();
    let prompt_template = prompt_template.into();

    Arc::new(move |bb, agents, config| {
        let topic_in = topic_in.clone();
        let topic_out = topic_out.clone();
        let prompt_template = prompt_template.clone();
        Box::pin(async move {
            let input_content = bb
                .read_latest(&topic_in, None)
                .map(|e| value_to_text(&e.content))
                .unwrap_or_default();

            for agent in &agents {
                let prior = bb.read(&topic_out, Some(agent));
                let prior_text = prior
                    .iter()
                    .map(|e| format!("[{}]: {}", e.author, value_to_text(&e.content)))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let prompt = prompt::expand_owned(
                    &prompt_template,
                    &[
                        ("question", input_content.as_str()),
                        ("input", input_content.as_str()),
                        ("prior_responses", prior_text.as_str()),
                    ],
                );
                run_agent_call(&bb, agent, &topic_out, &prompt, &config).await;
            }
        })
    })
}

/// One identity-free call against `orchestration_model`, combining every
/// entry on `topic_in` into the prompt. Used for mechanical extraction steps
/// (constraint parsing, hypothesis dedup, condition merging) that don't need
/// a persona.
pub fn mechanical_stage(
    topic_in: impl Into<String>,
    topic_out: impl Into<String>,
    prompt_template: impl Into<String>,
    parse_fn: Option<ParseFn>,
) -> StageFn {
    let topic_in = topic_in.into();
    let topic_out = topic_out.into();
    let prompt_template = prompt_template.into();

    Arc::new(move |bb, _agents, config| {
        let topic_in = topic_in.clone();
        let topic_out = topic_out.clone();
        let prompt_template = prompt_template.clone();
        let parse_fn = parse_fn.clone();
        Box::pin(async move {
            let entries = bb.read(&topic_in, None);
            if entries.is_empty() {
                return;
            }
            let combined = entries
                .iter()
                .map(|e| format!("=== {} ===\n{}", e.author, value_to_text(&e.content)))
                .collect::<Vec<_>>()
                .join("\n\n");
            let prompt = prompt::expand_uniform(&prompt_template, &combined);

            let agent = system_agent();
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
                        max_tokens: 4096,
                        system_override: Some(""),
                        tools: None,
                    },
                    &config.ctx,
                )
                .await;

            if let Ok(outcome) = outcome {
                let content = match &parse_fn {
                    Some(f) => f(&outcome.text),
                    None => Value::String(outcome.text.clone()),
                };
                let mut metadata = HashMap::new();
                metadata.insert(
                    "token_usage".to_string(),
                    serde_json::json!({
                        "input_tokens": outcome.input_tokens,
                        "output_tokens": outcome.output_tokens,
                    }),
                );
                bb.write(topic_out.clone(), content, "system", topic_out, metadata);
            }
        })
    })
}

/// Reads several topics and produces one final output. A placeholder with
/// no matching topic section falls back to the combined text of every
/// gathered topic rather than an empty string.
pub fn synthesis_stage(
    topics_in: Vec<String>,
    topic_out: impl Into<String>,
    prompt_template: impl Into<String>,
) -> StageFn {
    let topic_out = topic_out.into();
    let prompt_template = prompt_template.into();

    Arc::new(move |bb, _agents, config| {
        let topics_in = topics_in.clone();
        let topic_out = topic_out.clone();
        let prompt_template = prompt_template.clone();
        Box::pin(async move {
            let mut sections: HashMap<String, String> = HashMap::new();
            for topic in &topics_in {
                let entries = bb.read(topic, None);
                let text = entries
                    .iter()
                    .map(|e| {
                        if e.author == "system" {
                            value_to_text(&e.content)
                        } else {
                            format!("[{}]: {}", e.author, value_to_text(&e.content))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n");
                sections.insert(topic.clone(), text);
            }

            let question = bb
                .read_latest("question", None)
                .map(|e| value_to_text(&e.content))
                .unwrap_or_default();
            let all_content = sections.values().cloned().collect::<Vec<_>>().join("\n\n");

            let needed = prompt::placeholder_names(&prompt_template);
            let mut values: HashMap<&str, &str> = HashMap::new();
            for topic in &topics_in {
                values.insert(topic.as_str(), sections.get(topic).map(String::as_str).unwrap_or(""));
            }
            values.insert("question", question.as_str());
            values.insert("input", question.as_str());
            for key in &needed {
                values
                    .entry(key.as_str())
                    .or_insert_with(|| sections.get(key).map(String::as_str).unwrap_or(all_content.as_str()));
            }
            let prompt = prompt::expand(&prompt_template, &values);

            let agent = system_agent();
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
                metadata.insert(
                    "token_usage".to_string(),
                    serde_json::json!({
                        "input_tokens": outcome.input_tokens,
                        "output_tokens": outcome.output_tokens,
                    }),
                );
                if let Some(sink) = &config.ctx.events {
                    sink.emit(Event::Synthesis {
                        text: outcome.text.clone(),
                    });
                }
                bb.write(topic_out.clone(), Value::String(outcome.text.clone()), "system", topic_out, metadata);
            }
        })
    })
}

/// A deterministic stage with no LLM call at all: read every entry on
/// `topic_in`, fold them through a pure function, write the result to
/// `topic_out`. Used for the genuinely mechanical steps in the scoring/
/// voting/mapping protocol families (Borda tallying, Vickrey second-price,
/// Cynefin consensus, causal-loop classification, Delphi convergence) —
/// these compute a deterministic answer from already-gathered agent output
/// and gain nothing from a further model call, unlike [`mechanical_stage`]'s
/// LLM-backed extraction/merge step.
pub fn compute_stage<F>(topic_in: impl Into<String>, topic_out: impl Into<String>, f: F) -> StageFn
where
    F: Fn(&[super::blackboard::BlackboardEntry]) -> Option<Value> + Send + Sync + 'static,
{
    let topic_in = topic_in.into();
    let topic_out = topic_out.into();
    let f = Arc::new(f);

    Arc::new(move |bb, _agents, _config| {
        let topic_in = topic_in.clone();
        let topic_out = topic_out.clone();
        let f = f.clone();
        Box::pin(async move {
            let entries = bb.read(&topic_in, None);
            if let Some(content) = f(&entries) {
                bb.write(topic_out.clone(), content, "system", topic_out, HashMap::new());
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{ClientWrapper, NativeToolCall, ToolDefinition};
    use crate::engine::gateway::SingleProviderRouter;
    use async_trait::async_trait;
    use std::error::Error;

    struct StaticClient(&'static str);

    #[async_trait]
    impl ClientWrapper for StaticClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(self.0),
                tool_calls: vec![],
            })
        }
        fn model_name(&self) -> &str {
            "static"
        }
    }

    fn test_config(reply: &'static str) -> Arc<StageConfig> {
        let router = Arc::new(SingleProviderRouter(Arc::new(StaticClient(reply)) as Arc<dyn ClientWrapper>));
        Arc::new(StageConfig {
            gateway: Arc::new(Gateway::new(router)),
            ctx: GatewayContext::none(),
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            max_tokens: 1024,
        })
    }

    #[tokio::test]
    async fn parallel_agent_stage_writes_one_entry_per_agent() {
        let bb = Arc::new(Blackboard::new("p"));
        bb.write("question", Value::String("Q".to_string()), "system", "init", HashMap::new());
        let agents = vec![Agent::new("a", "A", "sys"), Agent::new("b", "B", "sys")];
        let stage = parallel_agent_stage("question", "round1", "Q: {question}");
        stage(bb.clone(), agents, test_config("answer")).await;
        assert_eq!(bb.read("round1", None).len(), 2);
    }

    #[tokio::test]
    async fn sequential_agent_stage_lets_later_agents_see_earlier_output() {
        let bb = Arc::new(Blackboard::new("p"));
        bb.write("question", Value::String("Q".to_string()), "system", "init", HashMap::new());
        let agents = vec![Agent::new("a", "A", "sys"), Agent::new("b", "B", "sys")];
        let stage = sequential_agent_stage("question", "round1", "Q: {question} Prior: {prior_responses}");
        stage(bb.clone(), agents, test_config("answer")).await;
        let entries = bb.read("round1", None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].author, "A");
        assert_eq!(entries[1].author, "B");
    }

    #[tokio::test]
    async fn mechanical_stage_skips_when_input_topic_empty() {
        let bb = Arc::new(Blackboard::new("p"));
        let stage = mechanical_stage("nothing", "out", "{input}", None);
        stage(bb.clone(), vec![], test_config("x")).await;
        assert!(!bb.has_topic("out"));
    }

    #[tokio::test]
    async fn mechanical_stage_applies_parse_fn() {
        let bb = Arc::new(Blackboard::new("p"));
        bb.write("in", Value::String("raw".to_string()), "a", "round", HashMap::new());
        let parse: ParseFn = Arc::new(|text| serde_json::json!({ "parsed": text }));
        let stage = mechanical_stage("in", "out", "{input}", Some(parse));
        stage(bb.clone(), vec![], test_config("42")).await;
        let entry = bb.read_latest("out", None).unwrap();
        assert_eq!(entry.content["parsed"], "42");
    }

    #[tokio::test]
    async fn synthesis_stage_writes_final_output() {
        let bb = Arc::new(Blackboard::new("p"));
        bb.write("question", Value::String("Q".to_string()), "system", "init", HashMap::new());
        bb.write("round1", Value::String("r1".to_string()), "a", "round1", HashMap::new());
        let stage = synthesis_stage(vec!["round1".to_string()], "final", "Summarize: {round1}");
        stage(bb.clone(), vec![], test_config("synthesized")).await;
        let entry = bb.read_latest("final", None).unwrap();
        assert_eq!(entry.content, Value::String("synthesized".to_string()));
    }

    #[tokio::test]
    async fn compute_stage_writes_deterministic_result() {
        let bb = Arc::new(Blackboard::new("p"));
        bb.write("votes", Value::String("x".to_string()), "a", "round", HashMap::new());
        bb.write("votes", Value::String("y".to_string()), "b", "round", HashMap::new());
        let stage = compute_stage("votes", "tally", |entries| Some(Value::from(entries.len())));
        stage(bb.clone(), vec![], test_config("unused")).await;
        assert_eq!(bb.read_latest("tally", None).unwrap().content, Value::from(2));
    }

    #[allow(dead_code)]
    fn silence_unused(_n: NativeToolCall) {}
}
