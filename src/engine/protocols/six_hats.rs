//! P28: Six Thinking Hats — De Bono's seven-phase sequence (Blue opens,
//! White/Red/Yellow/Black/Green each explore in turn, Blue closes), with
//! every agent wearing the *same* hat in a given phase instead of keeping
//! its own persona.
//!
//! Each phase overrides the agent's own system prompt with the hat's stance
//! prompt via [`CompletionRequest::system_override`] — the one place this
//! protocol needs a bespoke executor instead of [`crate::engine::stage`]'s
//! factories, since those always call through an agent's own persona.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;

use crate::cloudllm::client_wrapper::{Message, Role};
use crate::engine::blackboard::Blackboard;
use crate::engine::gateway::CompletionRequest;
use crate::engine::orchestrator::{NamedOutput, ProtocolDef, ProtocolResult, ProtocolResultVariant, StageDescriptor};
use crate::engine::prompt;
use crate::engine::stage::StageFn;
use crate::engine::trigger;

use super::text_of;

struct Hat {
    topic: &'static str,
    stance: &'static str,
    prior_topics: &'static [&'static str],
    user_prompt: &'static str,
}

const HATS: [Hat; 7] = [
    Hat {
        topic: "blue_open",
        stance: "You are wearing the Blue Hat: you manage the thinking process itself. State what this \
            question needs from the thinking session ahead — don't answer it yet.",
        prior_topics: &[],
        user_prompt: "Question: {question}",
    },
    Hat {
        topic: "white",
        stance: "You are wearing the White Hat: report facts and information only. No opinions, no \
            interpretation — just what is known, what is unknown, and what data would resolve the unknowns.",
        prior_topics: &["blue_open"],
        user_prompt: "Question: {question}\n\nBLUE HAT FRAMING:\n{prior}",
    },
    Hat {
        topic: "red",
        stance: "You are wearing the Red Hat: express gut feelings, intuitions, and emotional reactions \
            about the question, with no need to justify them.",
        prior_topics: &["blue_open", "white"],
        user_prompt: "Question: {question}\n\nFACTS SO FAR:\n{prior}",
    },
    Hat {
        topic: "yellow",
        stance: "You are wearing the Yellow Hat: find the genuine value, benefits, and best-case outcomes. \
            Be optimistic but specific — vague positivity doesn't count.",
        prior_topics: &["blue_open", "white", "red"],
        user_prompt: "Question: {question}\n\nDISCUSSION SO FAR:\n{prior}",
    },
    Hat {
        topic: "black",
        stance: "You are wearing the Black Hat: find the genuine risks, flaws, and reasons this could fail. \
            Be critical but specific — vague pessimism doesn't count.",
        prior_topics: &["blue_open", "white", "red", "yellow"],
        user_prompt: "Question: {question}\n\nDISCUSSION SO FAR:\n{prior}",
    },
    Hat {
        topic: "green",
        stance: "You are wearing the Green Hat: generate creative alternatives and lateral moves — \
            options nobody has proposed yet, not a refinement of what's already on the table.",
        prior_topics: &["blue_open", "white", "red", "yellow", "black"],
        user_prompt: "Question: {question}\n\nDISCUSSION SO FAR:\n{prior}",
    },
    Hat {
        topic: "blue_close",
        stance: "You are wearing the Blue Hat again: synthesize the full session into a clear \
            recommendation and next steps.",
        prior_topics: &["blue_open", "white", "red", "yellow", "black", "green"],
        user_prompt: "Question: {question}\n\nFULL SESSION:\n{prior}",
    },
];

fn hat_stage(hat: &'static Hat) -> StageFn {
    Arc::new(move |bb, agents, config| {
        Box::pin(async move {
            let question = bb.read_latest("question", None).map(|e| text_of(&e.content)).unwrap_or_default();
            let mut prior_blocks = Vec::new();
            for topic in hat.prior_topics.iter().copied() {
                for e in bb.read(topic, None) {
                    prior_blocks.push(format!("[{} — {}] {}", e.author, e.stage, text_of(&e.content)));
                }
            }
            let prior = prior_blocks.join("\n\n");

            let mut handles = Vec::with_capacity(agents.len());
            for agent in agents {
                let bb = bb.clone();
                let config = config.clone();
                let question = question.clone();
                let prior = prior.clone();
                handles.push(tokio::spawn(async move {
                    let prompt = prompt::expand_owned(hat.user_prompt, &[("question", question.as_str()), ("prior", prior.as_str())]);
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
                                system_override: Some(hat.stance),
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
                        bb.write(hat.topic, Value::String(outcome.text), agent.name.clone(), hat.topic, metadata);
                    }
                }));
            }
            join_all(handles).await;
        })
    })
}

pub fn build() -> ProtocolDef {
    let stages = HATS
        .iter()
        .enumerate()
        .map(|(i, hat)| {
            let trigger = if i == 0 {
                trigger::always()
            } else {
                trigger::after(HATS[i - 1].topic)
            };
            StageDescriptor::new(hat.topic, trigger, hat_stage(hat))
        })
        .collect();

    ProtocolDef {
        protocol_id: "six-hats".to_string(),
        stages,
    }
}

pub fn extract(bb: &Blackboard) -> ProtocolResult {
    let outputs: Vec<NamedOutput> = HATS
        .iter()
        .flat_map(|hat| {
            bb.read(hat.topic, None)
                .into_iter()
                .map(move |e| NamedOutput { name: format!("{} ({})", e.author, hat.topic), output: text_of(&e.content) })
        })
        .collect();
    let synthesis = bb.read_latest("blue_close", None).map(|e| text_of(&e.content));
    ProtocolResult {
        variant: ProtocolResultVariant::Stages(outputs),
        synthesis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_has_seven_hats_in_order() {
        let protocol = build();
        let names: Vec<&str> = protocol.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["blue_open", "white", "red", "yellow", "black", "green", "blue_close"]);
    }

    #[test]
    fn extract_uses_blue_close_as_synthesis() {
        let bb = Blackboard::new("six-hats");
        bb.write("blue_open", Value::String("framing".to_string()), "A", "blue_open", Default::default());
        bb.write("blue_close", Value::String("final recommendation".to_string()), "system", "blue_close", Default::default());
        let result = extract(&bb);
        assert_eq!(result.synthesis.as_deref(), Some("final recommendation"));
        match result.variant {
            ProtocolResultVariant::Stages(outputs) => assert_eq!(outputs.len(), 2),
            _ => panic!("expected Stages variant"),
        }
    }
}
