// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use tiller_context::{ContextConfiguration, ProcessedOutput};
use tiller_model::{ImageConfiguration, RuntimeTransition, SendableModel};
use tiller_tools::ToolResponse;

use crate::{ImageRecord, MessageRecord, MetricsRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chat {0} not found")]
    ChatNotFound(Uuid),
    #[error("message {0} not found")]
    MessageNotFound(Uuid),
    #[error("chat {0} has no image model configured")]
    NoImageModel(Uuid),
}

/// Command surface over the persistent database.
///
/// The runtime treats the store as an opaque executor: every method is one
/// typed command.  Implementations own their concurrency; callers tolerate
/// transient write failures on the streaming paths (logged, not fatal).
#[async_trait]
pub trait Store: Send + Sync {
    // ── Chat reads ───────────────────────────────────────────────────────────

    async fn language_model(&self, chat_id: Uuid) -> anyhow::Result<SendableModel>;

    async fn image_model(&self, chat_id: Uuid) -> anyhow::Result<SendableModel>;

    /// Image settings for the chat with the live prompt substituted in.
    async fn image_configuration(
        &self,
        chat_id: Uuid,
        prompt: &str,
    ) -> anyhow::Result<ImageConfiguration>;

    async fn has_attachments(&self, chat_id: Uuid) -> anyhow::Result<bool>;

    async fn attachment_file_titles(&self, chat_id: Uuid) -> anyhow::Result<Vec<String>>;

    async fn fetch_context_data(&self, chat_id: Uuid) -> anyhow::Result<ContextConfiguration>;

    // ── Model lifecycle writes ───────────────────────────────────────────────

    /// Durable record of a runtime state transition for a model.
    async fn transition_runtime_state(
        &self,
        model_id: Uuid,
        transition: RuntimeTransition,
    ) -> anyhow::Result<()>;

    /// Drop a model's stored local-path binding (stale bookmark or moved file).
    async fn delete_model_location(&self, model_id: Uuid) -> anyhow::Result<()>;

    // ── Message writes ───────────────────────────────────────────────────────

    async fn create_message(&self, message: MessageRecord) -> anyhow::Result<()>;

    /// Replace the message's channel set with a full parse.
    async fn update_processed_output(
        &self,
        message_id: Uuid,
        output: &ProcessedOutput,
    ) -> anyhow::Result<()>;

    /// Cheap streaming write: only the user-facing final channel content.
    async fn update_streaming_final_channel(
        &self,
        message_id: Uuid,
        content: &str,
        is_complete: bool,
    ) -> anyhow::Result<()>;

    /// Append text to the final channel, preserving prior content (separated
    /// from it by a blank line when present).
    async fn append_final_channel_content(
        &self,
        message_id: Uuid,
        content: &str,
    ) -> anyhow::Result<()>;

    async fn update_tool_responses(
        &self,
        message_id: Uuid,
        responses: &[ToolResponse],
    ) -> anyhow::Result<()>;

    async fn add_metrics(&self, metrics: MetricsRecord) -> anyhow::Result<()>;

    async fn add_image_response(&self, image: ImageRecord) -> anyhow::Result<()>;
}
