//! Tool executor — looks up a tool by name, invokes its handler, and
//! sanitizes the result.
//!
//! Handlers are supplied by the caller through the [`ToolHandlers`] trait
//! object — the concrete handler map (and the tools it registers) lives
//! outside this crate entirely; this module only knows how to dispatch to
//! one, time it, and sanitize what comes back.

use std::error::Error;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

/// Tool output larger than this is truncated and replaced with a structured
/// marker, so a runaway tool can't blow up the conversation context.
pub const MAX_OUTPUT_BYTES: usize = 50_000;

/// Looks up and invokes tools by name. Implementors supply the actual
/// handler map; this crate only defines the contract and the sanitizing
/// wrapper around it.
#[async_trait]
pub trait ToolHandlers: Send + Sync {
    /// Invoke the named tool with the given input. `Err` here is still
    /// caught and converted to a tool-result-shaped error by
    /// [`execute_tool`] — implementors do not need their own top-level
    /// catch-all.
    async fn invoke(&self, tool_name: &str, input: Value) -> Result<Value, Box<dyn Error + Send + Sync>>;

    /// Whether `tool_name` is registered. Used to produce an "unknown tool"
    /// result without paying for an `invoke` attempt.
    fn has_tool(&self, tool_name: &str) -> bool;
}

/// Execute `tool_name` against `handlers`, returning the truncated result
/// content and the elapsed time. Never propagates an error: unknown tools
/// and handler failures are both folded into a JSON error object, matching
/// the tool executor's "never raise" contract so the agent loop can react
/// to tool failures rather than aborting the run.
pub async fn execute_tool(
    handlers: &dyn ToolHandlers,
    tool_name: &str,
    input: Value,
) -> (Value, f64) {
    let start = Instant::now();

    let result = if !handlers.has_tool(tool_name) {
        serde_json::json!({
            "error": format!("unknown tool: {}", tool_name),
        })
    } else {
        match handlers.invoke(tool_name, input).await {
            Ok(value) => sanitize(value),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        }
    };

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    (result, elapsed_ms)
}

/// Cap a tool result's serialized size; beyond the cap, replace the content
/// with a structured truncation marker rather than silently dropping data.
fn sanitize(value: Value) -> Value {
    let serialized = value.to_string();
    if serialized.len() <= MAX_OUTPUT_BYTES {
        return value;
    }
    let truncated: String = serialized.chars().take(MAX_OUTPUT_BYTES).collect();
    serde_json::json!({
        "truncated": true,
        "original_bytes": serialized.len(),
        "content": truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandlers;

    #[async_trait]
    impl ToolHandlers for EchoHandlers {
        async fn invoke(&self, tool_name: &str, input: Value) -> Result<Value, Box<dyn Error + Send + Sync>> {
            if tool_name == "fail" {
                return Err("boom".into());
            }
            Ok(serde_json::json!({ "echo": input }))
        }

        fn has_tool(&self, tool_name: &str) -> bool {
            matches!(tool_name, "echo" | "fail")
        }
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_object() {
        let (result, _elapsed) = execute_tool(&EchoHandlers, "missing", Value::Null).await;
        assert!(result["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn handler_error_becomes_error_object_not_panic() {
        let (result, _elapsed) = execute_tool(&EchoHandlers, "fail", Value::Null).await;
        assert_eq!(result["error"], "boom");
    }

    #[tokio::test]
    async fn successful_call_passes_through() {
        let (result, _elapsed) = execute_tool(&EchoHandlers, "echo", serde_json::json!(42)).await;
        assert_eq!(result["echo"], 42);
    }

    #[test]
    fn oversized_output_is_truncated() {
        let huge = serde_json::json!({ "data": "x".repeat(MAX_OUTPUT_BYTES + 10) });
        let sanitized = sanitize(huge);
        assert_eq!(sanitized["truncated"], true);
    }
}
