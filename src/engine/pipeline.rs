//! Pipeline orchestrator — chains several protocol runs end to end.
//!
//! An ordered list of `{protocol_key, question_template, thinking_model,
//! orchestration_model, rounds, output_passthrough}` steps (see
//! [`crate::engine::store::PipelineStep`]). For each step, `{prev_output}`
//! in the template is substituted with the previous step's synthesis
//! (falling back to its last agent output when no synthesis was produced),
//! the step's protocol is run to completion via
//! [`crate::engine::orchestrator::Orchestrator`], and — when
//! `output_passthrough` is set — `prev_output` is updated from this step's
//! own synthesis before moving on.

use std::sync::Arc;

use crate::engine::agents::Agent;
use crate::engine::errors::CoordinationError;
use crate::engine::event::{Event, EventSink};
use crate::engine::gateway::{Gateway, GatewayContext};
use crate::engine::orchestrator::{Orchestrator, ProtocolResult};
use crate::engine::prompt;
use crate::engine::registry::ProtocolRecord;
use crate::engine::stage::StageConfig;
use crate::engine::store::PipelineStep;

/// One step's outcome: its protocol result plus the literal question it was
/// run with (after `{prev_output}` substitution), for callers that want to
/// display what was actually asked.
pub struct StepOutcome {
    pub protocol_key: String,
    pub question: String,
    pub result: ProtocolResult,
}

/// Drives a pipeline's steps to completion, emitting `step_start` /
/// `step_complete` events as it goes. Holds no persistence state itself —
/// the run controller is responsible for turning each [`StepOutcome`] into
/// a [`crate::engine::store::RunStepRecord`].
pub struct PipelineOrchestrator {
    gateway: Arc<Gateway>,
}

impl PipelineOrchestrator {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Run every step of `steps` in order against `agents`, seeding the
    /// first step's `{prev_output}` with `initial_question`.
    pub async fn run(
        &self,
        steps: &[PipelineStep],
        initial_question: &str,
        agents: Vec<Agent>,
        registry: &std::collections::HashMap<&'static str, ProtocolRecord>,
        events: Option<EventSink>,
    ) -> Result<Vec<StepOutcome>, CoordinationError> {
        let mut prev_output = initial_question.to_string();
        let mut outcomes = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            if let Some(sink) = &events {
                if sink.is_closed() {
                    return Err(CoordinationError::Cancelled);
                }
            }

            let record = registry.get(step.protocol_key.as_str()).ok_or_else(|| {
                CoordinationError::Validation(format!("unknown protocol key: {}", step.protocol_key))
            })?;

            let mut placeholders = std::collections::HashMap::new();
            placeholders.insert("prev_output", prev_output.as_str());
            let question = prompt::expand(&step.question_template, &placeholders);

            if let Some(sink) = &events {
                sink.emit(Event::StepStart {
                    step_index: index,
                    protocol_key: step.protocol_key.clone(),
                });
            }

            let ctx = GatewayContext {
                events: events.clone(),
                no_tools: !record.tools_enabled,
            };
            let config = Arc::new(StageConfig {
                gateway: self.gateway.clone(),
                ctx,
                thinking_model: step.thinking_model.clone(),
                orchestration_model: step.orchestration_model.clone(),
                max_tokens: 4096,
            });

            let protocol = (record.build)();
            let bb = Orchestrator::new().run(protocol, question.clone(), agents.clone(), config).await;
            let result = (record.extract)(&bb);

            if step.output_passthrough {
                if let Some(synthesis) = &result.synthesis {
                    prev_output = synthesis.clone();
                } else if let Some(last) = last_agent_text(&result) {
                    prev_output = last;
                }
            }

            if let Some(sink) = &events {
                sink.emit(Event::StepComplete {
                    step_index: index,
                    status: "completed".to_string(),
                });
            }

            outcomes.push(StepOutcome {
                protocol_key: step.protocol_key.clone(),
                question,
                result,
            });
        }

        Ok(outcomes)
    }
}

/// Fallback for `output_passthrough` when a step produced no synthesis: the
/// last agent output in whichever variant the result carries.
fn last_agent_text(result: &ProtocolResult) -> Option<String> {
    use crate::engine::orchestrator::ProtocolResultVariant::*;
    match &result.variant {
        Perspectives(items) | AgentOutputs(items) => items.last().map(|r| r.response.clone()),
        Rounds(rounds) => rounds.last().and_then(|r| r.responses.last()).map(|r| r.response.clone()),
        Stages(stages) => stages.last().map(|s| s.output.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
    use crate::engine::gateway::SingleProviderRouter;
    use crate::engine::registry::build_registry;
    use async_trait::async_trait;
    use std::error::Error;

    struct StaticClient;

    #[async_trait]
    impl ClientWrapper for StaticClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            Ok(Message {
                role: Role::Assistant,
                content: std::sync::Arc::from("S1"),
                tool_calls: vec![],
            })
        }
        fn model_name(&self) -> &str {
            "static"
        }
    }

    fn gateway() -> Arc<Gateway> {
        let router = Arc::new(SingleProviderRouter(Arc::new(StaticClient) as Arc<dyn ClientWrapper>));
        Arc::new(Gateway::new(router))
    }

    #[tokio::test]
    async fn passthrough_substitutes_prior_synthesis_into_next_question() {
        let registry = build_registry();
        let steps = vec![
            PipelineStep {
                protocol_key: "parallel-synthesis".to_string(),
                question_template: "{prev_output}".to_string(),
                thinking_model: "thinking".to_string(),
                orchestration_model: "orchestration".to_string(),
                rounds: None,
                output_passthrough: true,
            },
            PipelineStep {
                protocol_key: "parallel-synthesis".to_string(),
                question_template: "Given: {prev_output}".to_string(),
                thinking_model: "thinking".to_string(),
                orchestration_model: "orchestration".to_string(),
                rounds: None,
                output_passthrough: false,
            },
        ];
        let agents = vec![Agent::new("a", "A", "sys")];
        let pipeline = PipelineOrchestrator::new(gateway());
        let outcomes = pipeline.run(&steps, "Initial question", agents, &registry, None).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].question, "Initial question");
        assert_eq!(outcomes[1].question, "Given: S1");
    }

    #[tokio::test]
    async fn unknown_protocol_key_is_a_validation_error() {
        let registry = build_registry();
        let steps = vec![PipelineStep {
            protocol_key: "not-a-protocol".to_string(),
            question_template: "{prev_output}".to_string(),
            thinking_model: "t".to_string(),
            orchestration_model: "o".to_string(),
            rounds: None,
            output_passthrough: false,
        }];
        let agents = vec![Agent::new("a", "A", "sys")];
        let pipeline = PipelineOrchestrator::new(gateway());
        let err = pipeline.run(&steps, "Q", agents, &registry, None).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
    }
}
