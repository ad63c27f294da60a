//! LLM gateway — the single call site for "an agent talks to the model".
//!
//! Generalizes [`crate::cloudllm::agent::Agent::send`]'s tool-use loop shape
//! (emit → call → detect tool calls → execute → resume) over
//! [`ClientWrapper::send_message`]'s native tool-calling wire format (see
//! `clients/common.rs::send_with_native_tools`) instead of the JSON-in-text
//! `{"tool_call": ...}` convention `agent.rs` parses by regex. The iteration
//! cap is raised from 5 to 15, and the event sink is an explicit parameter
//! rather than an ambient, task-local slot.

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, ToolDefinition};
use crate::engine::agents::Agent;
use crate::engine::errors::CoordinationError;
use crate::engine::event::{Event, EventSink};
use crate::engine::tool_executor::{self, ToolHandlers};

/// Hard cap on agentic tool-loop iterations, independent of provider
/// behavior. See the "tool loop boundedness" testable property.
pub const MAX_TOOL_ITERATIONS: usize = 15;

/// Resolves which concrete provider client to use for a given agent model
/// id. The default implementation routes every call through one shared
/// client; a caller wiring up several vendors implements this to dispatch
/// by `model_id`.
pub trait ProviderRouter: Send + Sync {
    /// `model_id` is the agent's own override, if it declared one.
    /// `fallback_model` is the orchestration- or thinking-model id the
    /// calling stage would use when the agent declares none — routers that
    /// speak to more than one vendor dispatch on whichever is present.
    fn client_for(&self, model_id: Option<&str>, fallback_model: &str) -> Arc<dyn ClientWrapper>;
}

/// Routes every call to one fixed client regardless of the agent's declared
/// `model_id`. Sufficient for single-provider deployments and for tests.
pub struct SingleProviderRouter(pub Arc<dyn ClientWrapper>);

impl ProviderRouter for SingleProviderRouter {
    fn client_for(&self, _model_id: Option<&str>, _fallback_model: &str) -> Arc<dyn ClientWrapper> {
        self.0.clone()
    }
}

/// Resolves a registered tool name to its schema, for agents that declare
/// tools by name rather than passing explicit schemas per call.
pub trait ToolSchemaSource: Send + Sync {
    fn schema_for(&self, tool_name: &str) -> Option<ToolDefinition>;
}

/// Explicit context threaded from the run controller through every gateway
/// call site rather than an ambient, task-local event queue and
/// `no_tools` flag: two concurrent runs never share one of these because
/// there is no global slot to collide on.
#[derive(Clone)]
pub struct GatewayContext {
    pub events: Option<EventSink>,
    pub no_tools: bool,
}

impl GatewayContext {
    pub fn none() -> Self {
        Self {
            events: None,
            no_tools: false,
        }
    }

    fn emit(&self, event: Event) {
        if let Some(sink) = &self.events {
            sink.emit(event);
        }
    }
}

/// Parameters for one gateway call.
pub struct CompletionRequest<'a> {
    pub agent: &'a Agent,
    pub fallback_model: &'a str,
    pub messages: Vec<Message>,
    pub max_tokens: usize,
    pub system_override: Option<&'a str>,
    pub tools: Option<Vec<ToolDefinition>>,
}

/// Outcome of a completion call: the final assistant text plus cumulative
/// token usage across every round of the tool loop.
pub struct CompletionOutcome {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_iterations: usize,
}

/// The gateway itself: a router plus the tool machinery every call may need.
pub struct Gateway {
    router: Arc<dyn ProviderRouter>,
    tool_handlers: Option<Arc<dyn ToolHandlers>>,
    tool_schemas: Option<Arc<dyn ToolSchemaSource>>,
}

impl Gateway {
    pub fn new(router: Arc<dyn ProviderRouter>) -> Self {
        Self {
            router,
            tool_handlers: None,
            tool_schemas: None,
        }
    }

    pub fn with_tools(
        mut self,
        handlers: Arc<dyn ToolHandlers>,
        schemas: Arc<dyn ToolSchemaSource>,
    ) -> Self {
        self.tool_handlers = Some(handlers);
        self.tool_schemas = Some(schemas);
        self
    }

    /// Dispatch one agent call, driving the agentic tool loop to completion.
    pub async fn complete(
        &self,
        request: CompletionRequest<'_>,
        ctx: &GatewayContext,
    ) -> Result<CompletionOutcome, CoordinationError> {
        let client = self
            .router
            .client_for(request.agent.model_id.as_deref(), request.fallback_model);

        let resolved_tools = self.resolve_tools(request.agent, request.tools, ctx.no_tools);

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system_override.or(Some(request.agent.system_prompt.as_str())) {
            if !system.is_empty() {
                messages.push(Message {
                    role: Role::System,
                    content: Arc::from(system),
                    tool_calls: vec![],
                });
            }
        }
        messages.extend(request.messages);

        let (mut input_tokens, mut output_tokens) = (0u64, 0u64);
        let mut iteration = 0usize;

        loop {
            let response = client
                .send_message(&messages, resolved_tools.clone())
                .await
                .map_err(|e: Box<dyn Error>| CoordinationError::Provider(e.to_string()))?;

            if let Some(usage) = client.get_last_usage().await {
                input_tokens += usage.input_tokens as u64;
                output_tokens += usage.output_tokens as u64;
            }

            if response.tool_calls.is_empty() || iteration >= MAX_TOOL_ITERATIONS {
                return Ok(CompletionOutcome {
                    text: response.content.to_string(),
                    input_tokens,
                    output_tokens,
                    tool_iterations: iteration,
                });
            }

            let tool_calls = response.tool_calls.clone();
            messages.push(response);
            iteration += 1;

            for call in &tool_calls {
                self.run_tool_call(request.agent, call, iteration, ctx, &mut messages).await;
            }
        }
    }

    async fn run_tool_call(
        &self,
        agent: &Agent,
        call: &NativeToolCall,
        iteration: usize,
        ctx: &GatewayContext,
        messages: &mut Vec<Message>,
    ) {
        let input_summary = truncate(&call.arguments.to_string(), 500);
        ctx.emit(Event::ToolCall {
            agent_name: agent.name.clone(),
            tool_name: call.name.clone(),
            tool_input: input_summary,
            iteration,
        });

        let start = Instant::now();
        let (result, elapsed_ms) = match &self.tool_handlers {
            Some(handlers) => {
                tool_executor::execute_tool(handlers.as_ref(), &call.name, call.arguments.clone()).await
            }
            None => (
                serde_json::json!({ "error": "no tool handlers configured" }),
                start.elapsed().as_secs_f64() * 1000.0,
            ),
        };

        ctx.emit(Event::ToolResult {
            agent_name: agent.name.clone(),
            tool_name: call.name.clone(),
            result_preview: truncate(&result.to_string(), 500),
            elapsed_ms,
            iteration,
        });

        messages.push(Message {
            role: Role::Tool {
                call_id: call.id.clone(),
            },
            content: Arc::from(result.to_string().as_str()),
            tool_calls: vec![],
        });
    }

    fn resolve_tools(
        &self,
        agent: &Agent,
        explicit: Option<Vec<ToolDefinition>>,
        no_tools: bool,
    ) -> Option<Vec<ToolDefinition>> {
        if no_tools {
            return None;
        }
        if let Some(tools) = explicit {
            if !tools.is_empty() {
                return Some(tools);
            }
        }
        let schemas = self.tool_schemas.as_ref()?;
        let resolved: Vec<ToolDefinition> = agent
            .tool_names
            .iter()
            .filter_map(|name| schemas.schema_for(name))
            .collect();
        if resolved.is_empty() {
            None
        } else {
            Some(resolved)
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::cloudllm::client_wrapper::TokenUsage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    /// A scripted client that keeps requesting the same tool forever, used
    /// to exercise the 15-iteration cap.
    struct LoopingToolClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClientWrapper for LoopingToolClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from("still working"),
                tool_calls: vec![NativeToolCall {
                    id: "call_1".to_string(),
                    name: "echo".to_string(),
                    arguments: serde_json::json!({}),
                }],
            })
        }

        fn model_name(&self) -> &str {
            "looping-test-model"
        }
    }

    struct EchoHandlers;

    #[async_trait]
    impl ToolHandlers for EchoHandlers {
        async fn invoke(&self, _tool_name: &str, input: serde_json::Value) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
            Ok(input)
        }
        fn has_tool(&self, tool_name: &str) -> bool {
            tool_name == "echo"
        }
    }

    #[tokio::test]
    async fn tool_loop_stops_at_fifteen_iterations() {
        let client = Arc::new(LoopingToolClient {
            calls: AtomicUsize::new(0),
        });
        let router = Arc::new(SingleProviderRouter(client.clone() as Arc<dyn ClientWrapper>));
        let gateway = Gateway::new(router).with_tools(
            Arc::new(EchoHandlers),
            Arc::new(NoSchemas),
        );

        let agent = Agent::new("a", "Agent", "system prompt");
        let (sink, mut rx) = EventSink::channel();
        let ctx = GatewayContext {
            events: Some(sink),
            no_tools: false,
        };

        let outcome = gateway
            .complete(
                CompletionRequest {
                    agent: &agent,
                    fallback_model: "test-model",
                    messages: vec![Message {
                        role: Role::User,
                        content: Arc::from("go"),
                        tool_calls: vec![],
                    }],
                    max_tokens: 1024,
                    system_override: None,
                    tools: Some(vec![ToolDefinition {
                        name: "echo".to_string(),
                        description: "echoes".to_string(),
                        parameters_schema: serde_json::json!({}),
                    }]),
                },
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(outcome.tool_iterations, MAX_TOOL_ITERATIONS);

        let mut tool_calls_seen = 0;
        let mut tool_results_seen = 0;
        drop(gateway);
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::ToolCall { .. } => tool_calls_seen += 1,
                Event::ToolResult { .. } => tool_results_seen += 1,
                _ => {}
            }
        }
        assert_eq!(tool_calls_seen, MAX_TOOL_ITERATIONS);
        assert_eq!(tool_results_seen, MAX_TOOL_ITERATIONS);
    }

    struct NoSchemas;
    impl ToolSchemaSource for NoSchemas {
        fn schema_for(&self, _tool_name: &str) -> Option<ToolDefinition> {
            None
        }
    }

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
                content: Arc::from("done"),
                tool_calls: vec![],
            })
        }

        fn model_name(&self) -> &str {
            "static-test-model"
        }
    }

    #[tokio::test]
    async fn no_tool_calls_returns_immediately() {
        let router = Arc::new(SingleProviderRouter(Arc::new(StaticClient) as Arc<dyn ClientWrapper>));
        let gateway = Gateway::new(router);
        let agent = Agent::new("a", "Agent", "sys");
        let outcome = gateway
            .complete(
                CompletionRequest {
                    agent: &agent,
                    fallback_model: "m",
                    messages: vec![Message {
                        role: Role::User,
                        content: Arc::from("hi"),
                        tool_calls: vec![],
                    }],
                    max_tokens: 100,
                    system_override: None,
                    tools: None,
                },
                &GatewayContext::none(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.tool_iterations, 0);
    }

    #[allow(dead_code)]
    fn silence_unused(_m: TokioMutex<Option<TokenUsage>>) {}
}
