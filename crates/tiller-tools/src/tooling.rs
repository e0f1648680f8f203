// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use uuid::Uuid;

use crate::{ScopedToolRequest, ToolResponse};

/// External tool executor consumed by the agent runtime.
///
/// `execute_tools` returns exactly one response per request, matched by
/// `request_id`.  Failures are reported as error-bearing responses, never by
/// panicking or erroring the call itself — the model gets a chance to react
/// on its next turn.
#[async_trait]
pub trait Tooling: Send + Sync {
    async fn execute_tools(&self, requests: Vec<ScopedToolRequest>) -> Vec<ToolResponse>;

    /// Make the chat's attached files searchable through the semantic-search
    /// tool.  Called by the context assembler before each turn when the chat
    /// has attachments.
    async fn configure_semantic_search(&self, chat_id: Uuid, file_titles: Vec<String>);
}
