//! Persistence boundary — a relational-shaped schema behind a trait so the
//! core never depends on a concrete database.
//!
//! Storage, the HTTP surface, and agent-configuration import all live
//! outside this crate: the run controller only needs *somewhere* to read
//! custom agents from and write run/output records to. [`Store`] is that
//! seam; [`InMemoryStore`] is a same-process reference implementation
//! sufficient for tests and for embedding this engine without a real
//! database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::agents::Agent;

/// A store-backed, mutable agent record — the "custom" half of the
/// Agent variant. Builtin agents never pass through here; they come
/// straight from [`crate::engine::agents::builtin_agents`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAgent {
    pub key: String,
    pub name: String,
    pub system_prompt: String,
    pub model_id: Option<String>,
    pub max_output_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub tool_names: Vec<String>,
    pub context_scope: Option<Vec<String>>,
    pub categories: Vec<String>,
}

impl From<&StoredAgent> for Agent {
    fn from(s: &StoredAgent) -> Self {
        let mut agent = Agent::new(s.key.clone(), s.name.clone(), s.system_prompt.clone());
        agent.model_id = s.model_id.clone();
        agent.max_output_tokens = s.max_output_tokens;
        agent.temperature = s.temperature;
        agent.tool_names = s.tool_names.clone();
        agent.context_scope = s.context_scope.clone();
        agent.categories = s.categories.clone();
        agent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub agent_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub protocol_key: String,
    pub question_template: String,
    pub thinking_model: String,
    pub orchestration_model: String,
    pub rounds: Option<usize>,
    pub output_passthrough: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub steps: Vec<PipelineStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunType {
    SingleProtocol,
    Pipeline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub run_type: RunType,
    pub protocol_key: Option<String>,
    pub pipeline_id: Option<String>,
    pub question: String,
    pub agent_keys: Vec<String>,
    pub status: RunStatus,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStepRecord {
    pub run_step_id: String,
    pub run_id: String,
    pub step_order: usize,
    pub protocol_key: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Every output belongs to exactly one run; if the run has steps, it either
/// references one (`run_step_id`) or the whole run (`run_step_id: None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputRecord {
    pub run_id: String,
    pub run_step_id: Option<String>,
    pub agent_key: String,
    pub model_id: Option<String>,
    pub text: String,
    pub tool_calls: Vec<serde_json::Value>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// The persistence seam. Every method is `async` so a real database-backed
/// implementation can do I/O; [`InMemoryStore`] just locks a mutex.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_agent(&self, key: &str) -> Option<StoredAgent>;
    async fn put_agent(&self, agent: StoredAgent);
    async fn list_agents(&self) -> Vec<StoredAgent>;

    async fn get_team(&self, id: &str) -> Option<Team>;
    async fn put_team(&self, team: Team);

    async fn get_pipeline(&self, id: &str) -> Option<Pipeline>;
    async fn put_pipeline(&self, pipeline: Pipeline);

    async fn create_run(&self, run: RunRecord);
    async fn get_run(&self, run_id: &str) -> Option<RunRecord>;
    async fn update_run_status(&self, run_id: &str, status: RunStatus, completed_at: Option<DateTime<Utc>>);
    async fn list_runs(&self, limit: usize, offset: usize) -> Vec<RunRecord>;

    async fn create_run_step(&self, step: RunStepRecord);
    async fn update_run_step_status(&self, run_step_id: &str, status: RunStatus, completed_at: Option<DateTime<Utc>>);
    async fn list_run_steps(&self, run_id: &str) -> Vec<RunStepRecord>;

    async fn put_agent_output(&self, output: AgentOutputRecord);
    async fn list_agent_outputs(&self, run_id: &str) -> Vec<AgentOutputRecord>;
}

/// A same-process reference [`Store`] backed by a handful of `Mutex<HashMap>`s.
/// Sufficient for embedding this engine without standing up a real
/// database, and for every test in this crate.
#[derive(Default)]
pub struct InMemoryStore {
    agents: Mutex<HashMap<String, StoredAgent>>,
    teams: Mutex<HashMap<String, Team>>,
    pipelines: Mutex<HashMap<String, Pipeline>>,
    runs: Mutex<HashMap<String, RunRecord>>,
    run_steps: Mutex<HashMap<String, RunStepRecord>>,
    agent_outputs: Mutex<Vec<AgentOutputRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_agent(&self, key: &str) -> Option<StoredAgent> {
        self.agents.lock().expect("store mutex poisoned").get(key).cloned()
    }

    async fn put_agent(&self, agent: StoredAgent) {
        self.agents.lock().expect("store mutex poisoned").insert(agent.key.clone(), agent);
    }

    async fn list_agents(&self) -> Vec<StoredAgent> {
        self.agents.lock().expect("store mutex poisoned").values().cloned().collect()
    }

    async fn get_team(&self, id: &str) -> Option<Team> {
        self.teams.lock().expect("store mutex poisoned").get(id).cloned()
    }

    async fn put_team(&self, team: Team) {
        self.teams.lock().expect("store mutex poisoned").insert(team.id.clone(), team);
    }

    async fn get_pipeline(&self, id: &str) -> Option<Pipeline> {
        self.pipelines.lock().expect("store mutex poisoned").get(id).cloned()
    }

    async fn put_pipeline(&self, pipeline: Pipeline) {
        self.pipelines.lock().expect("store mutex poisoned").insert(pipeline.id.clone(), pipeline);
    }

    async fn create_run(&self, run: RunRecord) {
        self.runs.lock().expect("store mutex poisoned").insert(run.run_id.clone(), run);
    }

    async fn get_run(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.lock().expect("store mutex poisoned").get(run_id).cloned()
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus, completed_at: Option<DateTime<Utc>>) {
        if let Some(run) = self.runs.lock().expect("store mutex poisoned").get_mut(run_id) {
            run.status = status;
            if completed_at.is_some() {
                run.completed_at = completed_at;
            }
        }
    }

    async fn list_runs(&self, limit: usize, offset: usize) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.runs.lock().expect("store mutex poisoned").values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.into_iter().skip(offset).take(limit).collect()
    }

    async fn create_run_step(&self, step: RunStepRecord) {
        self.run_steps.lock().expect("store mutex poisoned").insert(step.run_step_id.clone(), step);
    }

    async fn update_run_step_status(&self, run_step_id: &str, status: RunStatus, completed_at: Option<DateTime<Utc>>) {
        if let Some(step) = self.run_steps.lock().expect("store mutex poisoned").get_mut(run_step_id) {
            step.status = status;
            if completed_at.is_some() {
                step.completed_at = completed_at;
            }
        }
    }

    async fn list_run_steps(&self, run_id: &str) -> Vec<RunStepRecord> {
        let mut steps: Vec<RunStepRecord> = self
            .run_steps
            .lock()
            .expect("store mutex poisoned")
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_order);
        steps
    }

    async fn put_agent_output(&self, output: AgentOutputRecord) {
        self.agent_outputs.lock().expect("store mutex poisoned").push(output);
    }

    async fn list_agent_outputs(&self, run_id: &str) -> Vec<AgentOutputRecord> {
        self.agent_outputs
            .lock()
            .expect("store mutex poisoned")
            .iter()
            .filter(|o| o.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run(run_id: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            run_type: RunType::SingleProtocol,
            protocol_key: Some("parallel-synthesis".to_string()),
            pipeline_id: None,
            question: "Q".to_string(),
            agent_keys: vec!["ceo".to_string()],
            status: RunStatus::Pending,
            cost: 0.0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn run_status_transitions_are_visible_on_read() {
        let store = InMemoryStore::new();
        store.create_run(sample_run("r1")).await;
        store.update_run_status("r1", RunStatus::Completed, Some(Utc::now())).await;
        let run = store.get_run("r1").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn agent_outputs_filter_by_run_id() {
        let store = InMemoryStore::new();
        let output = AgentOutputRecord {
            run_id: "r1".to_string(),
            run_step_id: None,
            agent_key: "ceo".to_string(),
            model_id: None,
            text: "answer".to_string(),
            tool_calls: vec![],
            input_tokens: 10,
            output_tokens: 20,
            cost: 0.01,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        };
        store.put_agent_output(output).await;
        store
            .put_agent_output(AgentOutputRecord {
                run_id: "r2".to_string(),
                run_step_id: None,
                agent_key: "cfo".to_string(),
                model_id: None,
                text: "other".to_string(),
                tool_calls: vec![],
                input_tokens: 1,
                output_tokens: 1,
                cost: 0.0,
                started_at: Utc::now(),
                completed_at: Utc::now(),
            })
            .await;
        assert_eq!(store.list_agent_outputs("r1").await.len(), 1);
    }

    #[tokio::test]
    async fn list_runs_respects_limit_and_offset() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.create_run(sample_run(&format!("r{i}"))).await;
        }
        assert_eq!(store.list_runs(2, 0).await.len(), 2);
        assert_eq!(store.list_runs(100, 4).await.len(), 1);
    }
}
