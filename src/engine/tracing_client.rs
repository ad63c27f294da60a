//! Call-level tracing — a decorator around [`ClientWrapper`] that appends a
//! structured record per call, plus a blackboard watcher that streams every
//! write to the same file in real time.
//!
//! The wrapper seam is [`ClientWrapper`] itself rather than one vendor's SDK
//! client class, so it composes with any provider this crate already
//! supports.

use std::error::Error;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex as TokioMutex;

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, MessageStreamFuture, TokenUsage, ToolDefinition};
use crate::engine::blackboard::Blackboard;

/// Appends newline-delimited JSON records to `path`, one per call, one per
/// blackboard write. A single instance is typically shared by every
/// [`TracingClientWrapper`] and blackboard watcher installed for one run.
pub struct TraceLog {
    path: PathBuf,
    file: StdMutex<std::fs::File>,
}

impl TraceLog {
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: StdMutex::new(file) })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn append(&self, record: serde_json::Value) {
        let mut file = self.file.lock().expect("trace log mutex poisoned");
        if let Err(e) = writeln!(file, "{record}") {
            log::error!("failed writing trace record to {:?}: {}", self.path, e);
        }
    }
}

/// Wraps any [`ClientWrapper`] with a per-call trace record: timestamp,
/// protocol id, agent name, model id, token counts, latency, and a
/// truncated response preview.
pub struct TracingClientWrapper {
    inner: std::sync::Arc<dyn ClientWrapper>,
    log: std::sync::Arc<TraceLog>,
    protocol_id: String,
    agent_name: String,
}

const RESPONSE_PREVIEW_CHARS: usize = 500;

impl TracingClientWrapper {
    pub fn new(
        inner: std::sync::Arc<dyn ClientWrapper>,
        log: std::sync::Arc<TraceLog>,
        protocol_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            log,
            protocol_id: protocol_id.into(),
            agent_name: agent_name.into(),
        }
    }
}

#[async_trait]
impl ClientWrapper for TracingClientWrapper {
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error>> {
        let start = Instant::now();
        let result = self.inner.send_message(messages, tools).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let usage = self.inner.get_last_usage().await;
        let (input_tokens, output_tokens) = usage
            .as_ref()
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));
        let (response_preview, is_error) = match &result {
            Ok(message) => (truncate(&message.content, RESPONSE_PREVIEW_CHARS), false),
            Err(e) => (e.to_string(), true),
        };

        self.log.append(serde_json::json!({
            "type": "llm_call",
            "timestamp": Utc::now(),
            "protocol_id": self.protocol_id,
            "agent_name": self.agent_name,
            "model_id": self.inner.model_name(),
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "latency_ms": latency_ms,
            "is_error": is_error,
            "response_preview": response_preview,
        }));

        result
    }

    fn send_message_stream<'a>(
        &'a self,
        messages: &'a [Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> MessageStreamFuture<'a> {
        self.inner.send_message_stream(messages, tools)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn get_last_usage(&self) -> Option<TokenUsage> {
        self.inner.get_last_usage().await
    }

    fn usage_slot(&self) -> Option<&TokioMutex<Option<TokenUsage>>> {
        self.inner.usage_slot()
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

/// Install a watcher on `bb` that appends every write to `log` as a
/// `blackboard_write` record, mirroring `BlackboardTracer`'s real-time
/// per-write stream rather than [`Blackboard::append_to_log`]'s
/// call-it-yourself batch flush.
pub fn install_blackboard_tracer(bb: &Blackboard, log: std::sync::Arc<TraceLog>) {
    bb.on_write(Box::new(move |entry| {
        log.append(serde_json::json!({
            "type": "blackboard_write",
            "entry_id": entry.entry_id,
            "topic": entry.topic,
            "author": entry.author,
            "stage": entry.stage,
            "version": entry.version,
            "timestamp": entry.timestamp,
        }));
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::Role;
    use std::sync::Arc;

    struct StaticClient;

    #[async_trait]
    impl ClientWrapper for StaticClient {
        async fn send_message(&self, _messages: &[Message], _tools: Option<Vec<ToolDefinition>>) -> Result<Message, Box<dyn Error>> {
            Ok(Message { role: Role::Assistant, content: Arc::from("hello there"), tool_calls: vec![] })
        }
        fn model_name(&self) -> &str {
            "static-model"
        }
    }

    #[tokio::test]
    async fn send_message_appends_one_trace_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let log = Arc::new(TraceLog::open(path.clone()).unwrap());
        let wrapper = TracingClientWrapper::new(Arc::new(StaticClient) as Arc<dyn ClientWrapper>, log, "parallel-synthesis", "CEO");

        wrapper
            .send_message(&[Message { role: Role::User, content: Arc::from("hi"), tool_calls: vec![] }], None)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("\"protocol_id\":\"parallel-synthesis\""));
        assert!(content.contains("\"agent_name\":\"CEO\""));
    }

    #[test]
    fn blackboard_tracer_appends_on_every_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bb_trace.jsonl");
        let log = Arc::new(TraceLog::open(path.clone()).unwrap());
        let bb = Blackboard::new("p");
        install_blackboard_tracer(&bb, log);

        bb.write("t", serde_json::Value::Bool(true), "system", "s", Default::default());
        bb.write("t", serde_json::Value::Bool(false), "system", "s", Default::default());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
