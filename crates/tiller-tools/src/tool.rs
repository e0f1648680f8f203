// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single tool invocation parsed out of model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: Uuid,
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
    /// Human-readable label for progress display.
    pub display_name: String,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            display_name: name.clone(),
            name,
            arguments,
        }
    }
}

/// The result of executing one tool request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub request_id: Uuid,
    pub tool_name: String,
    pub result: String,
    pub error: Option<String>,
}

impl ToolResponse {
    /// Successful plain-text result.
    pub fn ok(request: &ToolRequest, result: impl Into<String>) -> Self {
        Self {
            request_id: request.id,
            tool_name: request.name.clone(),
            result: result.into(),
            error: None,
        }
    }

    /// Error result; `result` carries the message so the model can react to
    /// the failure on its next turn.
    pub fn err(request: &ToolRequest, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            request_id: request.id,
            tool_name: request.name.clone(),
            result: msg.clone(),
            error: Some(msg),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Invocation context attached to every request immediately before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolScope {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub has_tool_policy: bool,
    /// Effective allow-set; only consulted when `has_tool_policy` is true.
    pub allowed_tool_names: Vec<String>,
}

/// A request annotated with its invocation scope, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ScopedToolRequest {
    pub request: ToolRequest,
    pub scope: ToolScope,
}

/// One executable tool.  Implementations live outside the runtime; the
/// registry dispatches to them by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, request: &ToolRequest, scope: &ToolScope) -> ToolResponse;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_response_carries_request_identity() {
        let req = ToolRequest::new("search", json!({"q": "x"}));
        let resp = ToolResponse::ok(&req, "found");
        assert_eq!(resp.request_id, req.id);
        assert_eq!(resp.tool_name, "search");
        assert!(!resp.is_error());
    }

    #[test]
    fn err_response_mirrors_message_into_result() {
        let req = ToolRequest::new("search", json!({}));
        let resp = ToolResponse::err(&req, "boom");
        assert!(resp.is_error());
        assert_eq!(resp.result, "boom");
        assert_eq!(resp.error.as_deref(), Some("boom"));
    }
}
