// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tiller_tools::ToolRequest;

/// Labeled slice of the model's structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Chain-of-thought; never shown to the user.
    Analysis,
    /// Model-to-system side channel (tool preambles, status notes).
    Commentary,
    /// User-visible reply text.
    Final,
    /// A tool-call payload addressed to a recipient.
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Stable identity.  Assigned on the first full parse of a message and
    /// preserved across every later re-parse of the same message.
    pub id: Uuid,
    pub kind: ChannelKind,
    pub content: String,
    /// Position within the message, starting at 0.
    pub order: u32,
    /// False while the channel is still being streamed (or was truncated).
    pub is_complete: bool,
    /// Addressee of a tool channel, e.g. `functions.search`.
    pub recipient: Option<String>,
    /// Id of the [`ToolRequest`] parsed from this channel, when any.
    pub associated_tool_id: Option<Uuid>,
}

impl Channel {
    pub fn new(kind: ChannelKind, content: impl Into<String>, order: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            content: content.into(),
            order,
            is_complete: true,
            recipient: None,
            associated_tool_id: None,
        }
    }
}

/// Structured parse of one message's raw model output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessedOutput {
    pub channels: Vec<Channel>,
    pub tool_calls: Vec<ToolRequest>,
    /// The raw text the parse was produced from.
    pub raw: String,
}

impl ProcessedOutput {
    /// Content of the last final channel — the user-visible reply.
    pub fn final_text(&self) -> &str {
        self.channels
            .iter()
            .rev()
            .find(|c| c.kind == ChannelKind::Final)
            .map(|c| c.content.as_str())
            .unwrap_or("")
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
