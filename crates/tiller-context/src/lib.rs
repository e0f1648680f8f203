// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod builder;
mod channel;
mod config;
mod harmony;
mod merge;
mod workspace;

pub use builder::{ContextBuilder, HarmonyContextBuilder};
pub use channel::{Channel, ChannelKind, ProcessedOutput};
pub use config::{
    BuildParameters, ContextConfiguration, ContextMessage, MemoryContext, MemoryItem, Skill,
    SkillContext,
};
pub use harmony::parse_output;
pub use merge::{merge_memory, merge_skills};
pub use workspace::{FileWorkspace, Workspace};
