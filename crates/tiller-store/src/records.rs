// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tiller_context::{Channel, ContextConfiguration};
use tiller_model::{ImageConfiguration, SendableModel};
use tiller_tools::ToolResponse;

/// A chat and everything the runtime reads from it.
#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: Uuid,
    pub language_model: SendableModel,
    pub image_model: Option<SendableModel>,
    pub context: ContextConfiguration,
    /// Titles of files attached to the chat.
    pub attachments: Vec<String>,
    /// Template for image generations; the live prompt is substituted in.
    pub image_settings: Option<ImageConfiguration>,
}

impl ChatRecord {
    pub fn new(language_model: SendableModel, context: ContextConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            language_model,
            image_model: None,
            context,
            attachments: Vec::new(),
            image_settings: None,
        }
    }
}

/// One message and its accumulated structured output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub user_input: String,
    pub channels: Vec<Channel>,
    pub tool_responses: Vec<ToolResponse>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(chat_id: Uuid, user_input: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            user_input: user_input.into(),
            channels: Vec::new(),
            tool_responses: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Per-generation metrics saved when a run completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub message_id: Uuid,
    pub generated_tokens: u32,
    pub prompt_tokens: u32,
    pub context_utilization: Option<f32>,
    pub duration_ms: u64,
}

/// One persisted image-generation frame.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub message_id: Uuid,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub step: u32,
}
