//! The live event stream carrying run progress to a consumer.
//!
//! Mirrors the "typed enum + async emit" shape of
//! [`crate::cloudllm::event::AgentEvent`] but at run granularity instead of
//! per-agent-call granularity, and over the discriminated union fixed by
//! the run controller's contract rather than an open set of agent lifecycle
//! hooks.

use serde::Serialize;
use tokio::sync::mpsc;

/// One progress record on the run's live stream. Every variant implicitly
/// carries the run it belongs to via the channel it was sent on; the run id
/// is attached by the controller when framing the SSE payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    RunStart {
        run_id: String,
        protocol_key: String,
    },
    Stage {
        message: String,
    },
    AgentRoster {
        agents: Vec<AgentRosterEntry>,
    },
    ToolCall {
        agent_name: String,
        tool_name: String,
        /// Truncated JSON-ish summary of the call's input.
        tool_input: String,
        iteration: usize,
    },
    ToolResult {
        agent_name: String,
        tool_name: String,
        /// Truncated preview of the tool's result content.
        result_preview: String,
        elapsed_ms: f64,
        iteration: usize,
    },
    AgentOutput {
        agent_key: String,
        text: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Synthesis {
        text: String,
    },
    StepStart {
        step_index: usize,
        protocol_key: String,
    },
    StepComplete {
        step_index: usize,
        status: String,
    },
    Error {
        message: String,
    },
    RunComplete {
        status: String,
        elapsed_seconds: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRosterEntry {
    pub key: String,
    pub display_name: String,
}

impl Event {
    /// Render this event as an SSE-style wire frame:
    /// `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let name = value
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
        format!("event: {}\ndata: {}\n\n", name, data)
    }
}

/// A cloneable multi-producer handle onto a run's event channel.
///
/// One [`EventSink`] exists per run; the run controller holds the receiving
/// end, the gateway and stage executors hold cloned senders. There is no
/// ambient/global slot anywhere — every call site that needs to emit events
/// receives its sink as an explicit parameter (see
/// [`crate::engine::gateway::GatewayContext`]).
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Create a fresh channel for one run. Returns the sink half (to be
    /// cloned into every task participating in the run) and the receiver
    /// half (owned by the run controller).
    pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { sender: tx }, rx)
    }

    /// Wrap an existing sender, e.g. a run controller's own external channel
    /// half, so a component downstream can both emit on and poll the
    /// liveness of the caller's actual consumer rather than an intermediary
    /// relay.
    pub fn from_sender(sender: mpsc::UnboundedSender<Event>) -> EventSink {
        EventSink { sender }
    }

    /// Send an event. Silently drops the event if the receiver has already
    /// been dropped (the consumer closed the stream) — per the cancellation
    /// contract, the run controller is responsible for reacting to that,
    /// not every emitting call site.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// True once the receiving half has been dropped — the consumer closed
    /// the stream. Checked by the pipeline orchestrator between steps so it
    /// stops dispatching further protocol runs as soon as cancellation is
    /// observed.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_has_expected_shape() {
        let event = Event::RunComplete {
            status: "completed".to_string(),
            elapsed_seconds: 1.5,
        };
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("event: run_complete\ndata: "));
        assert!(frame.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_does_not_panic() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(Event::Stage {
            message: "x".to_string(),
        });
    }
}
