//! The protocol orchestrator: a dumb state machine over a blackboard.
//!
//! `while pending: scan triggers, fire matches, drop what fired, stop when
//! nothing fires.` The orchestrator never reads entry content itself — it
//! only evaluates triggers and dispatches stage executors.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::agents::Agent;
use super::blackboard::Blackboard;
use super::event::Event;
use super::stage::{StageConfig, StageFn};
use super::trigger::Trigger;

/// One stage in a protocol definition: a name, a pure trigger predicate, an
/// executor, and an optional agent filter (`None` = all agents, `"@tag"` =
/// agents carrying that category, `"a,b"` = agents with those exact names).
pub struct StageDescriptor {
    pub name: String,
    pub trigger: Trigger,
    pub execute: StageFn,
    pub agents_filter: Option<String>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, trigger: Trigger, execute: StageFn) -> Self {
        Self {
            name: name.into(),
            trigger,
            execute,
            agents_filter: None,
        }
    }

    pub fn with_agents_filter(mut self, filter: impl Into<String>) -> Self {
        self.agents_filter = Some(filter.into());
        self
    }
}

/// A protocol as an ordered list of stage descriptors.
pub struct ProtocolDef {
    pub protocol_id: String,
    pub stages: Vec<StageDescriptor>,
}

/// One `{name, response}` pair — an agent's independent answer.
#[derive(Debug, Clone, Serialize)]
pub struct NamedResponse {
    pub name: String,
    pub response: String,
}

/// One `{name, output}` pair — a named stage's final output.
#[derive(Debug, Clone, Serialize)]
pub struct NamedOutput {
    pub name: String,
    pub output: String,
}

/// One round of a multi-round protocol (debate, negotiation, Delphi).
#[derive(Debug, Clone, Serialize)]
pub struct RoundResult {
    pub round: usize,
    pub responses: Vec<NamedResponse>,
}

/// The heterogeneous shape every protocol orchestrator's output takes,
/// declared as an explicit tagged variant: every protocol states up front
/// which variant it produces, and `run_controller`'s output extraction
/// pattern-matches exactly once instead of probing for known shapes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolResultVariant {
    Perspectives(Vec<NamedResponse>),
    Rounds(Vec<RoundResult>),
    Stages(Vec<NamedOutput>),
    AgentOutputs(Vec<NamedResponse>),
}

/// A protocol run's full output: the structured variant plus an optional
/// free-text synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolResult {
    pub variant: ProtocolResultVariant,
    pub synthesis: Option<String>,
}

/// Fires stages as their triggers match. Never reads blackboard entry
/// content — only checks `stages_completed()`/`conflicts()` via triggers and
/// dispatches the matching executor.
pub struct Orchestrator;

impl Orchestrator {
    pub fn new() -> Self {
        Orchestrator
    }

    /// Run `protocol` to completion, returning the blackboard it produced.
    /// Writes the seed `question` entry under topic `"question"`, stage
    /// `"init"`, author `"system"` before the first pass.
    pub async fn run(
        &self,
        protocol: ProtocolDef,
        question: impl Into<String>,
        agents: Vec<Agent>,
        config: Arc<StageConfig>,
    ) -> Arc<Blackboard> {
        let bb = Arc::new(Blackboard::new(protocol.protocol_id));
        bb.write("question", Value::String(question.into()), "system", "init", HashMap::new());

        let mut pending: Vec<StageDescriptor> = protocol.stages;
        loop {
            let mut any_fired = false;
            let mut i = 0;
            while i < pending.len() {
                if (pending[i].trigger)(&bb) {
                    let stage = pending.remove(i);
                    let stage_agents = filter_agents(&agents, stage.agents_filter.as_deref());
                    if let Some(sink) = &config.ctx.events {
                        sink.emit(Event::Stage {
                            message: format!("stage '{}' started", stage.name),
                        });
                    }
                    (stage.execute)(bb.clone(), stage_agents, config.clone()).await;
                    any_fired = true;
                } else {
                    i += 1;
                }
            }
            if !any_fired {
                break;
            }
        }

        bb
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter agents by spec: `@category`, comma-separated names, or `None` (all).
fn filter_agents(agents: &[Agent], filter_spec: Option<&str>) -> Vec<Agent> {
    match filter_spec {
        None => agents.to_vec(),
        Some(spec) if spec.starts_with('@') => {
            let category = &spec[1..];
            agents
                .iter()
                .filter(|a| a.categories.iter().any(|c| c == category))
                .cloned()
                .collect()
        }
        Some(spec) => {
            let names: HashSet<&str> = spec.split(',').map(str::trim).collect();
            agents.iter().filter(|a| names.contains(a.name.as_str())).cloned().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, ToolDefinition};
    use crate::engine::gateway::{Gateway, GatewayContext, SingleProviderRouter};
    use crate::engine::stage::{mechanical_stage, parallel_agent_stage};
    use crate::engine::trigger;
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
                content: std::sync::Arc::from("ok"),
                tool_calls: vec![],
            })
        }
        fn model_name(&self) -> &str {
            "static"
        }
    }

    fn test_config() -> Arc<StageConfig> {
        let router = Arc::new(SingleProviderRouter(Arc::new(StaticClient) as Arc<dyn ClientWrapper>));
        Arc::new(StageConfig {
            gateway: Arc::new(Gateway::new(router)),
            ctx: GatewayContext::none(),
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            max_tokens: 512,
        })
    }

    #[tokio::test]
    async fn runs_stages_in_trigger_order_and_stops_when_none_fire() {
        let protocol = ProtocolDef {
            protocol_id: "test".to_string(),
            stages: vec![
                StageDescriptor::new("round1", trigger::always(), parallel_agent_stage("question", "round1", "{question}")),
                StageDescriptor::new(
                    "final",
                    trigger::after("round1"),
                    mechanical_stage("round1", "final", "{input}", None),
                ),
            ],
        };
        let agents = vec![Agent::new("a", "A", "sys")];
        let bb = Orchestrator::new().run(protocol, "Q", agents, test_config()).await;

        assert!(bb.has_topic("round1"));
        assert!(bb.has_topic("final"));
        assert_eq!(bb.stages_completed().len(), 3); // init, round1, final
    }

    #[tokio::test]
    async fn agent_filter_by_category_restricts_roster() {
        let agents = vec![
            Agent::new("a", "A", "sys").with_categories(vec!["red".to_string()]),
            Agent::new("b", "B", "sys").with_categories(vec!["blue".to_string()]),
        ];
        let filtered = filter_agents(&agents, Some("@red"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "A");
    }

    #[tokio::test]
    async fn agent_filter_by_name_list_restricts_roster() {
        let agents = vec![Agent::new("a", "A", "sys"), Agent::new("b", "B", "sys")];
        let filtered = filter_agents(&agents, Some("A, B"));
        assert_eq!(filtered.len(), 2);
    }

    #[allow(dead_code)]
    fn silence_unused(_n: NativeToolCall) {}
}
