// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tiller_tools::ToolResponse;

/// One prior turn included in the rendered context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub message_id: Uuid,
    pub user_input: String,
    pub assistant_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryContext {
    pub items: Vec<MemoryItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub instructions: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillContext {
    pub skills: Vec<Skill>,
}

/// Everything the store knows about a chat that shapes its prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfiguration {
    pub system_instruction: String,
    pub context_messages: Vec<ContextMessage>,
    /// Token ceiling for the rendered prompt, when the chat constrains it.
    pub max_prompt: Option<u32>,
    pub memory_context: Option<MemoryContext>,
    pub skill_context: Option<SkillContext>,
    pub workspace_context: Option<String>,
    /// Allow-set from the chat's tool policy.  Only meaningful when
    /// `has_tool_policy` is true.
    pub allowed_tools: HashSet<String>,
    pub has_tool_policy: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ContextConfiguration {
    fn default() -> Self {
        Self {
            system_instruction: String::new(),
            context_messages: Vec::new(),
            max_prompt: None,
            memory_context: None,
            skill_context: None,
            workspace_context: None,
            allowed_tools: HashSet::new(),
            has_tool_policy: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Assembled inputs for one prompt render.
#[derive(Debug, Clone)]
pub struct BuildParameters {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    /// The live prompt for the current message (may differ from what the
    /// store has persisted, e.g. after a steering redirect).
    pub prompt: String,
    /// Effective tool names after policy filtering.
    pub tools: HashSet<String>,
    pub configuration: ContextConfiguration,
    /// Tool results gathered earlier in the current generation.
    pub tool_results: Vec<ToolResponse>,
}
