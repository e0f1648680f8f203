// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::{ScopedToolRequest, Tool, ToolRequest, ToolResponse, ToolScope, Tooling};

/// Central registry holding all available tools and dispatching batches.
///
/// This is the default [`Tooling`] implementation used by the binary and the
/// tests; deployments with their own executor implement [`Tooling`] directly.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Attachment titles registered for semantic search, per chat.  Shared
    /// with [`SemanticSearchTool`] so registration updates are visible to an
    /// already-registered tool.
    search_titles: Arc<Mutex<HashMap<Uuid, Vec<String>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Register the built-in semantic-search tool wired to this registry's
    /// title table.
    pub fn register_semantic_search(&mut self) {
        let tool = SemanticSearchTool::new(Arc::clone(&self.search_titles));
        self.register(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Titles registered for a chat by `configure_semantic_search`.
    pub fn semantic_search_titles(&self, chat_id: Uuid) -> Vec<String> {
        self.search_titles
            .lock()
            .unwrap()
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn execute_one(&self, scoped: &ScopedToolRequest) -> ToolResponse {
        let ScopedToolRequest { request, scope } = scoped;
        if scope.has_tool_policy && !scope.allowed_tool_names.contains(&request.name) {
            warn!(tool = %request.name, "tool call denied by chat tool policy");
            return ToolResponse::err(
                request,
                format!("tool '{}' is not allowed for this chat", request.name),
            );
        }
        match self.tools.get(&request.name) {
            Some(tool) => tool.execute(request, scope).await,
            None => ToolResponse::err(request, format!("unknown tool: {}", request.name)),
        }
    }
}

#[async_trait]
impl Tooling for ToolRegistry {
    async fn execute_tools(&self, requests: Vec<ScopedToolRequest>) -> Vec<ToolResponse> {
        // Requests in a batch are independent; run them concurrently and
        // collect in request order so responses correspond by index as well
        // as by id.
        let futures: Vec<_> = requests.iter().map(|r| self.execute_one(r)).collect();
        futures::future::join_all(futures).await
    }

    async fn configure_semantic_search(&self, chat_id: Uuid, file_titles: Vec<String>) {
        self.search_titles
            .lock()
            .unwrap()
            .insert(chat_id, file_titles);
    }
}

/// Searches the attachment titles registered for the requesting chat.
/// Placeholder ranking: case-insensitive substring match.
pub struct SemanticSearchTool {
    registry_titles: Arc<Mutex<HashMap<Uuid, Vec<String>>>>,
}

/// Echoes its `text` argument back.  Useful for wiring checks and demos.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back to the model"
    }

    async fn execute(&self, request: &ToolRequest, _scope: &ToolScope) -> ToolResponse {
        match request.arguments.get("text").and_then(|v| v.as_str()) {
            Some(text) => ToolResponse::ok(request, text),
            None => ToolResponse::err(request, "missing required argument: text"),
        }
    }
}

impl SemanticSearchTool {
    /// Share the registry's title table so `configure_semantic_search`
    /// updates are visible to the tool without re-registration.
    pub fn new(registry_titles: Arc<Mutex<HashMap<Uuid, Vec<String>>>>) -> Self {
        Self { registry_titles }
    }
}

#[async_trait]
impl Tool for SemanticSearchTool {
    fn name(&self) -> &str {
        "semantic_search"
    }

    fn description(&self) -> &str {
        "Search the chat's attached files by title"
    }

    async fn execute(&self, request: &ToolRequest, scope: &ToolScope) -> ToolResponse {
        let query = match request.arguments.get("query").and_then(|v| v.as_str()) {
            Some(q) => q.to_lowercase(),
            None => return ToolResponse::err(request, "missing required argument: query"),
        };
        let titles = self
            .registry_titles
            .lock()
            .unwrap()
            .get(&scope.chat_id)
            .cloned()
            .unwrap_or_default();
        let hits: Vec<String> = titles
            .into_iter()
            .filter(|t| t.to_lowercase().contains(&query))
            .collect();
        ToolResponse::ok(request, hits.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
