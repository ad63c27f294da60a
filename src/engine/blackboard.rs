//! Shared blackboard — communal state store for coordination protocols.
//!
//! Externalized, versioned, role-scoped state. Agents write intelligence;
//! the blackboard owns state; the orchestrator owns flow.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::agents::Agent;

/// One immutable record on the blackboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboardEntry {
    pub entry_id: String,
    pub topic: String,
    pub author: String,
    pub stage: String,
    pub content: Value,
    pub metadata: HashMap<String, Value>,
    /// 1-based, monotonically increasing per topic.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl BlackboardEntry {
    /// The `metadata.scope` tag, defaulting to `"all"` when unset.
    pub fn scope(&self) -> &str {
        self.metadata
            .get("scope")
            .and_then(Value::as_str)
            .unwrap_or("all")
    }

    /// Cumulative token usage recorded under `metadata.token_usage`.
    pub fn token_usage(&self) -> (u64, u64) {
        let usage = self.metadata.get("token_usage");
        let input = usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output = usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        (input, output)
    }
}

/// Aggregated telemetry over every entry written so far.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSignals {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub elapsed_seconds: f64,
    pub entry_count: usize,
}

/// A watcher invoked synchronously on every write, in registration order.
pub type Watcher = Box<dyn Fn(&BlackboardEntry) + Send + Sync>;

struct State {
    entries: Vec<BlackboardEntry>,
    version_counters: HashMap<String, u64>,
}

/// Append-only communal state store with role-scoped reads and watcher
/// callbacks.
///
/// Single-writer per stage step: callers serialize concurrent writes
/// through the internal mutex. Lives exactly as long as one run.
pub struct Blackboard {
    pub protocol_id: String,
    state: Mutex<State>,
    watchers: Mutex<Vec<Watcher>>,
    start_time: SystemTime,
    flushed_count: Mutex<usize>,
}

impl Blackboard {
    pub fn new(protocol_id: impl Into<String>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            state: Mutex::new(State {
                entries: Vec::new(),
                version_counters: HashMap::new(),
            }),
            watchers: Mutex::new(Vec::new()),
            start_time: SystemTime::now(),
            flushed_count: Mutex::new(0),
        }
    }

    /// Append an immutable entry. Fires all watcher callbacks synchronously
    /// before returning. A panicking watcher is caught and logged; it never
    /// poisons the blackboard for subsequent writers.
    pub fn write(
        &self,
        topic: impl Into<String>,
        content: Value,
        author: impl Into<String>,
        stage: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> BlackboardEntry {
        let topic = topic.into();
        let entry = {
            let mut state = self.state.lock().expect("blackboard mutex poisoned");
            let version = state.version_counters.get(&topic).copied().unwrap_or(0) + 1;
            state.version_counters.insert(topic.clone(), version);

            let entry = BlackboardEntry {
                entry_id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
                topic,
                author: author.into(),
                stage: stage.into(),
                content,
                metadata,
                version,
                timestamp: Utc::now(),
            };
            state.entries.push(entry.clone());
            entry
        };

        let watchers = self.watchers.lock().expect("watcher mutex poisoned");
        for watcher in watchers.iter() {
            let entry_ref = &entry;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                watcher(entry_ref);
            }));
            if let Err(_panic) = result {
                log::error!(
                    "blackboard watcher panicked handling write to topic '{}'",
                    entry.topic
                );
            }
        }

        entry
    }

    /// Read all entries for a topic, filtered by `reader`'s scope if
    /// provided.
    pub fn read(&self, topic: &str, reader: Option<&Agent>) -> Vec<BlackboardEntry> {
        let state = self.state.lock().expect("blackboard mutex poisoned");
        let entries: Vec<BlackboardEntry> = state
            .entries
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect();
        drop(state);

        match reader {
            None => entries,
            Some(agent) => entries
                .into_iter()
                .filter(|e| {
                    super::scoping::is_visible(
                        agent.context_scope.as_deref(),
                        e.scope(),
                        &e.author,
                    )
                })
                .collect(),
        }
    }

    /// Read the most recent entry for a topic.
    pub fn read_latest(&self, topic: &str, reader: Option<&Agent>) -> Option<BlackboardEntry> {
        self.read(topic, reader).into_iter().last()
    }

    /// Register a watcher callback fired on every subsequent write.
    pub fn on_write(&self, watcher: Watcher) {
        self.watchers.lock().expect("watcher mutex poisoned").push(watcher);
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state
            .lock()
            .expect("blackboard mutex poisoned")
            .entries
            .iter()
            .any(|e| e.topic == topic)
    }

    pub fn topics(&self) -> HashSet<String> {
        self.state
            .lock()
            .expect("blackboard mutex poisoned")
            .entries
            .iter()
            .map(|e| e.topic.clone())
            .collect()
    }

    /// Stage names that have at least one write.
    pub fn stages_completed(&self) -> HashSet<String> {
        self.state
            .lock()
            .expect("blackboard mutex poisoned")
            .entries
            .iter()
            .map(|e| e.stage.clone())
            .collect()
    }

    /// Detect 2+ agents writing the same topic+stage with different
    /// content. Returns `None` if no pair qualifies.
    pub fn conflicts(&self, topic: &str) -> Option<Vec<(BlackboardEntry, BlackboardEntry)>> {
        let state = self.state.lock().expect("blackboard mutex poisoned");
        let mut by_stage: HashMap<String, Vec<&BlackboardEntry>> = HashMap::new();
        for e in state.entries.iter().filter(|e| e.topic == topic) {
            by_stage.entry(e.stage.clone()).or_default().push(e);
        }

        let mut pairs = Vec::new();
        for entries in by_stage.values() {
            for i in 0..entries.len() {
                for j in (i + 1)..entries.len() {
                    let (a, b) = (entries[i], entries[j]);
                    if a.author != b.author && a.content != b.content {
                        pairs.push((a.clone(), b.clone()));
                    }
                }
            }
        }

        if pairs.is_empty() {
            None
        } else {
            Some(pairs)
        }
    }

    /// Aggregated token usage and wall-clock elapsed since construction.
    pub fn resource_signals(&self) -> ResourceSignals {
        let state = self.state.lock().expect("blackboard mutex poisoned");
        let (mut total_input, mut total_output) = (0u64, 0u64);
        for e in state.entries.iter() {
            let (input, output) = e.token_usage();
            total_input += input;
            total_output += output;
        }
        let elapsed = self
            .start_time
            .elapsed()
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        ResourceSignals {
            total_input_tokens: total_input,
            total_output_tokens: total_output,
            elapsed_seconds: elapsed.as_secs_f64(),
            entry_count: state.entries.len(),
        }
    }

    /// Full serializable snapshot for audit. A snapshot taken later is
    /// always a superset (by append order) of one taken earlier, since
    /// entries are never mutated or removed.
    pub fn snapshot(&self) -> Value {
        let state = self.state.lock().expect("blackboard mutex poisoned");
        serde_json::json!({
            "protocol_id": self.protocol_id,
            "entries": state.entries,
            "resource_signals": self.resource_signals(),
        })
    }

    /// Append any entries not yet flushed to a newline-delimited record
    /// file, tracking how many have been flushed so repeated calls only
    /// append the delta.
    pub fn append_to_log(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let state = self.state.lock().expect("blackboard mutex poisoned");
        let mut flushed = self.flushed_count.lock().expect("flush cursor poisoned");
        for e in state.entries.iter().skip(*flushed) {
            let line = serde_json::json!({
                "type": "blackboard_write",
                "entry_id": e.entry_id,
                "topic": e.topic,
                "author": e.author,
                "stage": e.stage,
                "content": e.content,
                "metadata": e.metadata,
                "version": e.version,
                "timestamp": e.timestamp,
            });
            writeln!(file, "{}", line)?;
        }
        *flushed = state.entries.len();
        Ok(())
    }
}

pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with_scope(name: &str, scope: &str) -> Agent {
        Agent::new(name.to_lowercase(), name, "").with_context_scope(vec![scope.to_string()])
    }

    #[test]
    fn monotonic_versions_per_topic() {
        let bb = Blackboard::new("p");
        for i in 0..5 {
            bb.write(
                "topic",
                Value::String(format!("v{}", i)),
                "system",
                "stage",
                HashMap::new(),
            );
        }
        let entries = bb.read("topic", None);
        let versions: Vec<u64> = entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn scope_filter_soundness() {
        let bb = Blackboard::new("p");
        let mut financial_meta = HashMap::new();
        financial_meta.insert("scope".to_string(), Value::String("financial".to_string()));
        bb.write(
            "round",
            Value::String("financial content".to_string()),
            "cfo",
            "round",
            financial_meta,
        );
        let mut market_meta = HashMap::new();
        market_meta.insert("scope".to_string(), Value::String("market".to_string()));
        bb.write(
            "round",
            Value::String("market content".to_string()),
            "cmo",
            "round",
            market_meta,
        );

        let financial_reader = agent_with_scope("CFO", "financial");
        let visible = bb.read("round", Some(&financial_reader));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].author, "cfo");
    }

    #[test]
    fn system_entries_always_visible() {
        let bb = Blackboard::new("p");
        bb.write(
            "question",
            Value::String("Q".to_string()),
            "system",
            "init",
            HashMap::new(),
        );
        let reader = agent_with_scope("CFO", "financial");
        assert_eq!(bb.read("question", Some(&reader)).len(), 1);
    }

    #[test]
    fn snapshot_is_append_only_prefix() {
        let bb = Blackboard::new("p");
        bb.write("t", Value::Bool(true), "system", "s", HashMap::new());
        let first = bb.snapshot();
        bb.write("t", Value::Bool(false), "system", "s", HashMap::new());
        let second = bb.snapshot();
        let first_entries = first["entries"].as_array().unwrap();
        let second_entries = second["entries"].as_array().unwrap();
        assert_eq!(first_entries.len(), 1);
        assert_eq!(second_entries.len(), 2);
        assert_eq!(first_entries[0]["entry_id"], second_entries[0]["entry_id"]);
    }

    #[test]
    fn conflicts_detect_disagreeing_authors() {
        let bb = Blackboard::new("p");
        bb.write(
            "plan",
            Value::String("A".to_string()),
            "red",
            "plan",
            HashMap::new(),
        );
        bb.write(
            "plan",
            Value::String("B".to_string()),
            "blue",
            "plan",
            HashMap::new(),
        );
        assert!(bb.conflicts("plan").is_some());
        assert!(bb.conflicts("other").is_none());
    }

    #[test]
    fn append_to_log_only_flushes_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let bb = Blackboard::new("p");
        bb.write("t", Value::String("first".to_string()), "system", "s", HashMap::new());
        bb.append_to_log(&path).unwrap();
        let after_first = std::fs::read_to_string(&path).unwrap();
        assert_eq!(after_first.lines().count(), 1);

        bb.write("t", Value::String("second".to_string()), "system", "s", HashMap::new());
        bb.append_to_log(&path).unwrap();
        let after_second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(after_second.lines().count(), 2);

        bb.append_to_log(&path).unwrap();
        let after_noop = std::fs::read_to_string(&path).unwrap();
        assert_eq!(after_noop.lines().count(), 2);
    }

    #[test]
    fn panicking_watcher_does_not_break_write() {
        let bb = Blackboard::new("p");
        bb.on_write(Box::new(|_entry| panic!("boom")));
        bb.on_write(Box::new(|_entry| {}));
        bb.write("t", Value::Bool(true), "system", "s", HashMap::new());
        assert_eq!(bb.read("t", None).len(), 1);
    }
}
