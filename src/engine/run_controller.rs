//! Run controller — resolves a protocol, hydrates agents, drives the
//! orchestrator to completion, streams events, and persists the result.
//!
//! No ambient event-channel or no-tools flag threaded through task-local
//! state anywhere in this path: both are carried explicitly by the
//! [`crate::engine::gateway::GatewayContext`] built here and handed down
//! through [`crate::engine::stage::StageConfig`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::engine::agents::{self, Agent};
use crate::engine::errors::CoordinationError;
use crate::engine::event::{AgentRosterEntry, Event, EventSink};
use crate::engine::gateway::{Gateway, GatewayContext};
use crate::engine::orchestrator::{Orchestrator, ProtocolResult, ProtocolResultVariant};
use crate::engine::pipeline::PipelineOrchestrator;
use crate::engine::registry::{self, ProtocolRecord};
use crate::engine::stage::StageConfig;
use crate::engine::store::{
    AgentOutputRecord, PipelineStep, RunRecord, RunStatus, RunStepRecord, RunType, Store,
};

/// How often the event-drain loop re-checks whether the background run task
/// has finished.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Input to a single-protocol run, mirroring the `/api/runs/protocol` body.
#[derive(Debug, Clone)]
pub struct ProtocolRunRequest {
    pub run_id: String,
    pub protocol_key: String,
    pub question: String,
    pub agent_keys: Vec<String>,
    pub thinking_model: String,
    pub orchestration_model: String,
    pub rounds: Option<usize>,
    pub no_tools: bool,
    pub max_tokens: usize,
}

/// Input to a pipeline run, mirroring the `/api/runs/pipeline` body.
#[derive(Debug, Clone)]
pub struct PipelineRunRequest {
    pub run_id: String,
    pub pipeline_id: Option<String>,
    pub question: String,
    pub agent_keys: Vec<String>,
    pub steps: Vec<PipelineStep>,
}

/// Ties the blackboard/orchestrator machinery to a [`Store`] and an
/// [`EventSink`]-carrying stream for one embedding process. One instance is
/// typically shared for the whole process's lifetime.
pub struct RunController {
    store: Arc<dyn Store>,
    gateway: Arc<Gateway>,
    registry: HashMap<&'static str, ProtocolRecord>,
}

impl RunController {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<Gateway>) -> Self {
        Self {
            store,
            gateway,
            registry: registry::build_registry(),
        }
    }

    /// Resolve `agent_keys` against the store's custom agents first, falling
    /// back to the builtin roster.
    async fn hydrate_agents(&self, agent_keys: &[String]) -> Result<Vec<Agent>, CoordinationError> {
        if agent_keys.is_empty() {
            return Err(CoordinationError::Validation("agent_keys must not be empty".to_string()));
        }
        let builtin = agents::builtin_agents();
        let mut resolved = Vec::with_capacity(agent_keys.len());
        for key in agent_keys {
            if let Some(stored) = self.store.get_agent(key).await {
                resolved.push(Agent::from(&stored));
                continue;
            }
            match builtin.get(&key.to_lowercase()) {
                Some(agent) => resolved.push(agent.clone()),
                None => {
                    return Err(CoordinationError::Validation(format!("unknown agent: {key}")));
                }
            }
        }
        Ok(resolved)
    }

    /// Start a single-protocol run as a background task and return the
    /// receiving end of its event stream. Dropping the receiver is how a
    /// caller cancels the run.
    pub fn run_protocol(self: Arc<Self>, request: ProtocolRunRequest) -> mpsc::UnboundedReceiver<Event> {
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            self.drive_protocol_run(request, external_tx).await;
        });
        external_rx
    }

    async fn drive_protocol_run(&self, request: ProtocolRunRequest, external_tx: mpsc::UnboundedSender<Event>) {
        let started_at = Utc::now();
        let start_instant = Instant::now();

        self.store
            .create_run(RunRecord {
                run_id: request.run_id.clone(),
                run_type: RunType::SingleProtocol,
                protocol_key: Some(request.protocol_key.clone()),
                pipeline_id: None,
                question: request.question.clone(),
                agent_keys: request.agent_keys.clone(),
                status: RunStatus::Running,
                cost: 0.0,
                started_at,
                completed_at: None,
            })
            .await;

        let record = match self.registry.get(request.protocol_key.as_str()) {
            Some(r) => r,
            None => {
                self.fail_run(
                    &request.run_id,
                    &external_tx,
                    format!("unknown protocol key: {}", request.protocol_key),
                    start_instant,
                )
                .await;
                return;
            }
        };

        let agents = match self.hydrate_agents(&request.agent_keys).await {
            Ok(a) => a,
            Err(e) => {
                self.fail_run(&request.run_id, &external_tx, e.to_string(), start_instant).await;
                return;
            }
        };

        let _ = external_tx.send(Event::RunStart {
            run_id: request.run_id.clone(),
            protocol_key: request.protocol_key.clone(),
        });
        let _ = external_tx.send(Event::AgentRoster {
            agents: agents
                .iter()
                .map(|a| AgentRosterEntry {
                    key: a.key.clone(),
                    display_name: a.name.clone(),
                })
                .collect(),
        });
        let _ = external_tx.send(Event::Stage {
            message: format!("running protocol '{}'...", request.protocol_key),
        });

        let (sink, internal_rx) = EventSink::channel();
        let ctx = GatewayContext {
            events: Some(sink),
            no_tools: request.no_tools || !record.tools_enabled,
        };
        let config = Arc::new(StageConfig {
            gateway: self.gateway.clone(),
            ctx,
            thinking_model: request.thinking_model.clone(),
            orchestration_model: request.orchestration_model.clone(),
            max_tokens: request.max_tokens,
        });

        let protocol = (record.build)();
        let question = request.question.clone();
        let run_agents = agents.clone();
        let run_task = tokio::spawn(async move { Orchestrator::new().run(protocol, question, run_agents, config).await });

        let bb = match drain_until_complete(internal_rx, run_task, &external_tx).await {
            Some(bb) => bb,
            None => {
                // Consumer closed the stream; run task was aborted.
                self.store
                    .update_run_status(&request.run_id, RunStatus::Failed, Some(Utc::now()))
                    .await;
                return;
            }
        };

        let result = (record.extract)(&bb);
        self.persist_outputs(&request.run_id, None, &result, &agents).await;

        let status = if external_tx.is_closed() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.store.update_run_status(&request.run_id, status, Some(Utc::now())).await;
        let _ = external_tx.send(Event::RunComplete {
            status: if status == RunStatus::Completed { "completed" } else { "failed" }.to_string(),
            elapsed_seconds: start_instant.elapsed().as_secs_f64(),
        });
    }

    /// Start a pipeline run in the background and return its event stream.
    pub fn run_pipeline(self: Arc<Self>, request: PipelineRunRequest) -> mpsc::UnboundedReceiver<Event> {
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            self.drive_pipeline_run(request, external_tx).await;
        });
        external_rx
    }

    async fn drive_pipeline_run(&self, request: PipelineRunRequest, external_tx: mpsc::UnboundedSender<Event>) {
        let started_at = Utc::now();
        let start_instant = Instant::now();

        self.store
            .create_run(RunRecord {
                run_id: request.run_id.clone(),
                run_type: RunType::Pipeline,
                protocol_key: None,
                pipeline_id: request.pipeline_id.clone(),
                question: request.question.clone(),
                agent_keys: request.agent_keys.clone(),
                status: RunStatus::Running,
                cost: 0.0,
                started_at,
                completed_at: None,
            })
            .await;

        let agents = match self.hydrate_agents(&request.agent_keys).await {
            Ok(a) => a,
            Err(e) => {
                self.fail_run(&request.run_id, &external_tx, e.to_string(), start_instant).await;
                return;
            }
        };

        let _ = external_tx.send(Event::RunStart {
            run_id: request.run_id.clone(),
            protocol_key: "pipeline".to_string(),
        });
        let _ = external_tx.send(Event::AgentRoster {
            agents: agents
                .iter()
                .map(|a| AgentRosterEntry {
                    key: a.key.clone(),
                    display_name: a.name.clone(),
                })
                .collect(),
        });

        let mut run_step_ids = Vec::with_capacity(request.steps.len());
        for (index, step) in request.steps.iter().enumerate() {
            let run_step_id = format!("{}-step{}", request.run_id, index);
            run_step_ids.push(run_step_id.clone());
            self.store
                .create_run_step(RunStepRecord {
                    run_step_id,
                    run_id: request.run_id.clone(),
                    step_order: index,
                    protocol_key: step.protocol_key.clone(),
                    status: RunStatus::Pending,
                    started_at: None,
                    completed_at: None,
                })
                .await;
        }

        let pipeline = PipelineOrchestrator::new(self.gateway.clone());
        let outcomes = pipeline
            .run(
                &request.steps,
                &request.question,
                agents.clone(),
                &self.registry,
                Some(EventSink::from_sender(external_tx.clone())),
            )
            .await;

        let outcomes = match outcomes {
            Ok(o) => o,
            Err(e) => {
                self.fail_run(&request.run_id, &external_tx, e.to_string(), start_instant).await;
                return;
            }
        };

        for (index, outcome) in outcomes.iter().enumerate() {
            let run_step_id = run_step_ids[index].clone();
            self.store
                .update_run_step_status(&run_step_id, RunStatus::Completed, Some(Utc::now()))
                .await;
            self.persist_outputs(&request.run_id, Some(run_step_id), &outcome.result, &agents)
                .await;
        }

        self.store
            .update_run_status(&request.run_id, RunStatus::Completed, Some(Utc::now()))
            .await;
        let _ = external_tx.send(Event::RunComplete {
            status: "completed".to_string(),
            elapsed_seconds: start_instant.elapsed().as_secs_f64(),
        });
    }

    async fn fail_run(
        &self,
        run_id: &str,
        external_tx: &mpsc::UnboundedSender<Event>,
        message: String,
        start_instant: Instant,
    ) {
        self.store.update_run_status(run_id, RunStatus::Failed, Some(Utc::now())).await;
        let _ = external_tx.send(Event::Error { message });
        let _ = external_tx.send(Event::RunComplete {
            status: "failed".to_string(),
            elapsed_seconds: start_instant.elapsed().as_secs_f64(),
        });
    }

    /// Extract per-agent outputs and an optional synthesis from a finished
    /// protocol result and persist each as an [`AgentOutputRecord`] (plus
    /// one synthesis row keyed `_synthesis`, matching end-to-end
    /// scenario 1). The live `agent_output`/`synthesis` events themselves
    /// were already forwarded by [`drain_until_complete`] straight from the
    /// stage executors that wrote them (they carry the real token counts);
    /// this only needs to persist, not re-emit.
    async fn persist_outputs(
        &self,
        run_id: &str,
        run_step_id: Option<String>,
        result: &ProtocolResult,
        agents: &[Agent],
    ) {
        let now = Utc::now();
        let name_to_key: HashMap<&str, &str> = agents.iter().map(|a| (a.name.as_str(), a.key.as_str())).collect();

        for (name, text) in agent_texts(result) {
            let agent_key = name_to_key.get(name.as_str()).copied().unwrap_or(name.as_str()).to_string();
            self.store
                .put_agent_output(AgentOutputRecord {
                    run_id: run_id.to_string(),
                    run_step_id: run_step_id.clone(),
                    agent_key,
                    model_id: None,
                    text,
                    tool_calls: vec![],
                    input_tokens: 0,
                    output_tokens: 0,
                    cost: 0.0,
                    started_at: now,
                    completed_at: now,
                })
                .await;
        }

        if let Some(synthesis) = &result.synthesis {
            self.store
                .put_agent_output(AgentOutputRecord {
                    run_id: run_id.to_string(),
                    run_step_id,
                    agent_key: "_synthesis".to_string(),
                    model_id: None,
                    text: synthesis.clone(),
                    tool_calls: vec![],
                    input_tokens: 0,
                    output_tokens: 0,
                    cost: 0.0,
                    started_at: now,
                    completed_at: now,
                })
                .await;
        }
    }
}

/// Drain `internal_rx` (tool-loop events from the gateway) into
/// `external_tx`, polling every [`EVENT_POLL_INTERVAL`] so the loop notices
/// promptly once `run_task` finishes, or once the consumer closes the
/// external stream. Returns `None` in the latter case, after aborting
/// `run_task`; returns `Some(blackboard)` once the run task completes
/// normally.
async fn drain_until_complete(
    mut internal_rx: mpsc::UnboundedReceiver<Event>,
    mut run_task: tokio::task::JoinHandle<Arc<crate::engine::blackboard::Blackboard>>,
    external_tx: &mpsc::UnboundedSender<Event>,
) -> Option<Arc<crate::engine::blackboard::Blackboard>> {
    loop {
        match tokio::time::timeout(EVENT_POLL_INTERVAL, internal_rx.recv()).await {
            Ok(Some(event)) => {
                if external_tx.send(event).is_err() {
                    run_task.abort();
                    return None;
                }
            }
            Ok(None) => {}
            Err(_elapsed) => {}
        }
        if run_task.is_finished() {
            break;
        }
    }

    while let Ok(event) = internal_rx.try_recv() {
        if external_tx.send(event).is_err() {
            run_task.abort();
            return None;
        }
    }

    match run_task.await {
        Ok(bb) => Some(bb),
        Err(_join_error) => None,
    }
}

/// Pull `{name, text}` pairs out of whichever [`ProtocolResultVariant`] a
/// protocol produced. `Rounds` uses only the last round — each agent's
/// final position — since a persisted output row is one-per-agent, not
/// one-per-round.
fn agent_texts(result: &ProtocolResult) -> Vec<(String, String)> {
    match &result.variant {
        ProtocolResultVariant::Perspectives(items) | ProtocolResultVariant::AgentOutputs(items) => {
            items.iter().map(|r| (r.name.clone(), r.response.clone())).collect()
        }
        ProtocolResultVariant::Rounds(rounds) => rounds
            .last()
            .map(|r| r.responses.iter().map(|nr| (nr.name.clone(), nr.response.clone())).collect())
            .unwrap_or_default(),
        ProtocolResultVariant::Stages(stages) => stages.iter().map(|s| (s.name.clone(), s.output.clone())).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
    use crate::engine::gateway::SingleProviderRouter;
    use crate::engine::store::InMemoryStore;
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
                content: std::sync::Arc::from("answer"),
                tool_calls: vec![],
            })
        }
        fn model_name(&self) -> &str {
            "static"
        }
    }

    fn controller() -> Arc<RunController> {
        let router = Arc::new(SingleProviderRouter(Arc::new(StaticClient) as Arc<dyn ClientWrapper>));
        let gateway = Arc::new(Gateway::new(router));
        Arc::new(RunController::new(Arc::new(InMemoryStore::new()), gateway))
    }

    async fn drain_all(mut rx: mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn parallel_synthesis_emits_three_outputs_then_synthesis_then_complete() {
        let controller = controller();
        let rx = controller.clone().run_protocol(ProtocolRunRequest {
            run_id: "r1".to_string(),
            protocol_key: "parallel-synthesis".to_string(),
            question: "Should we enter market X?".to_string(),
            agent_keys: vec!["ceo".to_string(), "cfo".to_string(), "cto".to_string()],
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            rounds: None,
            no_tools: false,
            max_tokens: 1024,
        });
        let events = drain_all(rx).await;

        let agent_output_count = events.iter().filter(|e| matches!(e, Event::AgentOutput { .. })).count();
        assert_eq!(agent_output_count, 3);
        let synthesis_count = events.iter().filter(|e| matches!(e, Event::Synthesis { .. })).count();
        assert_eq!(synthesis_count, 1);
        assert!(matches!(events.last(), Some(Event::RunComplete { status, .. }) if status == "completed"));

        let run = controller.store.get_run("r1").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let outputs = controller.store.list_agent_outputs("r1").await;
        assert_eq!(outputs.len(), 4);
        assert!(outputs.iter().any(|o| o.agent_key == "_synthesis"));
    }

    #[tokio::test]
    async fn unknown_protocol_key_fails_the_run() {
        let controller = controller();
        let rx = controller.clone().run_protocol(ProtocolRunRequest {
            run_id: "r2".to_string(),
            protocol_key: "not-a-protocol".to_string(),
            question: "Q".to_string(),
            agent_keys: vec!["ceo".to_string()],
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            rounds: None,
            no_tools: false,
            max_tokens: 1024,
        });
        let events = drain_all(rx).await;
        assert!(events.iter().any(|e| matches!(e, Event::Error { .. })));
        assert!(matches!(events.last(), Some(Event::RunComplete { status, .. }) if status == "failed"));

        let run = controller.store.get_run("r2").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn empty_agent_list_fails_validation() {
        let controller = controller();
        let rx = controller.clone().run_protocol(ProtocolRunRequest {
            run_id: "r3".to_string(),
            protocol_key: "parallel-synthesis".to_string(),
            question: "Q".to_string(),
            agent_keys: vec![],
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            rounds: None,
            no_tools: false,
            max_tokens: 1024,
        });
        let events = drain_all(rx).await;
        assert!(matches!(events.last(), Some(Event::RunComplete { status, .. }) if status == "failed"));
    }

    #[tokio::test]
    async fn pipeline_passthrough_runs_two_steps_and_persists_run_steps() {
        let controller = controller();
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
        let rx = controller.clone().run_pipeline(PipelineRunRequest {
            run_id: "p1".to_string(),
            pipeline_id: Some("demo-pipeline".to_string()),
            question: "Start here".to_string(),
            agent_keys: vec!["ceo".to_string()],
            steps,
        });
        let events = drain_all(rx).await;
        assert!(matches!(events.last(), Some(Event::RunComplete { status, .. }) if status == "completed"));

        let run_steps = controller.store.list_run_steps("p1").await;
        assert_eq!(run_steps.len(), 2);
        assert!(run_steps.iter().all(|s| s.status == RunStatus::Completed));
    }

    #[tokio::test]
    async fn cancellation_aborts_run_and_marks_run_failed() {
        let controller = controller();
        let rx = controller.clone().run_protocol(ProtocolRunRequest {
            run_id: "r4".to_string(),
            protocol_key: "parallel-synthesis".to_string(),
            question: "Q".to_string(),
            agent_keys: vec!["ceo".to_string()],
            thinking_model: "thinking".to_string(),
            orchestration_model: "orchestration".to_string(),
            rounds: None,
            no_tools: false,
            max_tokens: 1024,
        });
        // Close the stream immediately, before the run has a chance to complete.
        drop(rx);
        // Give the background task a moment to observe the closed channel
        // and mark the run failed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let run = controller.store.get_run("r4").await;
        if let Some(run) = run {
            assert_ne!(run.status, RunStatus::Pending);
        }
    }

    #[tokio::test]
    async fn pipeline_cancellation_stops_before_later_steps() {
        let controller = controller();
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
                output_passthrough: true,
            },
            PipelineStep {
                protocol_key: "parallel-synthesis".to_string(),
                question_template: "Finally: {prev_output}".to_string(),
                thinking_model: "thinking".to_string(),
                orchestration_model: "orchestration".to_string(),
                rounds: None,
                output_passthrough: false,
            },
        ];
        let mut rx = controller.clone().run_pipeline(PipelineRunRequest {
            run_id: "p2".to_string(),
            pipeline_id: Some("three-step".to_string()),
            question: "Start".to_string(),
            agent_keys: vec!["ceo".to_string()],
            steps,
        });

        // Drain until the first step's completion event, then close the
        // stream — mirroring end-to-end scenario 5.
        loop {
            match rx.recv().await {
                Some(Event::StepComplete { step_index: 0, .. }) => break,
                Some(_) => continue,
                None => panic!("stream closed before first step completed"),
            }
        }
        drop(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let run = controller.store.get_run("p2").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let run_steps = controller.store.list_run_steps("p2").await;
        let completed = run_steps.iter().filter(|s| s.status == RunStatus::Completed).count();
        assert!(completed < 3, "later steps must not run to completion after cancellation");
    }
}
