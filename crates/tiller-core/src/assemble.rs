// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tracing::debug;

use tiller_context::{merge_memory, merge_skills, BuildParameters, ContextBuilder, Workspace};
use tiller_store::Store;
use tiller_tools::Tooling;

use crate::GenerationState;

/// Assembles `BuildParameters` for one iteration and renders the model input.
///
/// Steps, in order: semantic-search registration, context fetch, workspace
/// merges, tool-policy filtering, live-prompt override, final render.
pub struct ContextAssembler {
    store: Arc<dyn Store>,
    builder: Arc<dyn ContextBuilder>,
    tooling: Option<Arc<dyn Tooling>>,
    workspace: Option<Arc<dyn Workspace>>,
}

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn Store>,
        builder: Arc<dyn ContextBuilder>,
        tooling: Option<Arc<dyn Tooling>>,
        workspace: Option<Arc<dyn Workspace>>,
    ) -> Self {
        Self {
            store,
            builder,
            tooling,
            workspace,
        }
    }

    pub async fn assemble(&self, state: &GenerationState) -> anyhow::Result<BuildParameters> {
        let chat_id = state.request.chat_id;

        // Attachments become searchable before the model sees the prompt.
        // The action's own tool set is not touched by this step.
        if let Some(tooling) = &self.tooling {
            if self.store.has_attachments(chat_id).await? {
                let titles = self.store.attachment_file_titles(chat_id).await?;
                debug!(count = titles.len(), "registering attachment titles for search");
                tooling.configure_semantic_search(chat_id, titles).await;
            }
        }

        let mut configuration = self.store.fetch_context_data(chat_id).await?;

        if let Some(workspace) = &self.workspace {
            if let Some(ctx) = workspace.workspace_context() {
                configuration.workspace_context = Some(ctx);
            }
            configuration.memory_context =
                merge_memory(configuration.memory_context.take(), workspace.memory_context());
            configuration.skill_context =
                merge_skills(configuration.skill_context.take(), workspace.skill_context());
        }

        let mut tools = state.request.action.tools().clone();
        if configuration.has_tool_policy {
            tools.retain(|name| configuration.allowed_tools.contains(name));
        }

        // The live prompt wins over whatever the store captured at message
        // creation (it may have been replaced by a redirect).
        for message in &mut configuration.context_messages {
            if message.message_id == state.request.message_id {
                message.user_input = state.prompt.clone();
            }
        }

        Ok(BuildParameters {
            chat_id,
            message_id: state.request.message_id,
            prompt: state.prompt.clone(),
            tools,
            configuration,
            tool_results: state.tool_results.clone(),
        })
    }

    /// Step 6: delegate to the context builder for the final prompt string.
    pub fn render(&self, params: &BuildParameters) -> anyhow::Result<String> {
        self.builder.build(params)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
