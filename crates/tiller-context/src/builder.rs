// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::fmt::Write as _;

use tiller_model::SendableModel;

use crate::{parse_output, BuildParameters, ProcessedOutput};

/// Renders final prompt text from assembled inputs and parses raw model
/// output back into structured channels.
pub trait ContextBuilder: Send + Sync {
    fn build(&self, params: &BuildParameters) -> anyhow::Result<String>;

    fn process(&self, raw: &str, model: &SendableModel) -> anyhow::Result<ProcessedOutput>;
}

/// Default builder for Harmony-style models.
///
/// The rendered layout keeps stable sections in a fixed order (system,
/// workspace, memory, skills, tools, history, current turn) so prefix caches
/// at the backend stay warm across iterations.
#[derive(Debug, Default)]
pub struct HarmonyContextBuilder;

impl ContextBuilder for HarmonyContextBuilder {
    fn build(&self, params: &BuildParameters) -> anyhow::Result<String> {
        let cfg = &params.configuration;
        let mut prompt = String::new();

        if !cfg.system_instruction.is_empty() {
            writeln!(prompt, "<|im_start|>system\n{}", cfg.system_instruction)?;
        }
        if let Some(ws) = &cfg.workspace_context {
            writeln!(prompt, "\n## Workspace\n{ws}")?;
        }
        if let Some(memory) = &cfg.memory_context {
            if !memory.items.is_empty() {
                writeln!(prompt, "\n## Memory")?;
                for item in &memory.items {
                    writeln!(prompt, "- {}", item.content)?;
                }
            }
        }
        if let Some(skills) = &cfg.skill_context {
            for skill in &skills.skills {
                writeln!(prompt, "\n## Skill: {}\n{}", skill.name, skill.instructions)?;
            }
        }
        if !params.tools.is_empty() {
            let mut names: Vec<&str> = params.tools.iter().map(String::as_str).collect();
            names.sort_unstable();
            writeln!(prompt, "\n## Tools\n{}", names.join(", "))?;
        }
        if !cfg.system_instruction.is_empty() {
            writeln!(prompt, "<|im_end|>")?;
        }

        for msg in &cfg.context_messages {
            writeln!(prompt, "<|im_start|>user\n{}<|im_end|>", msg.user_input)?;
            if let Some(reply) = &msg.assistant_output {
                writeln!(prompt, "<|im_start|>assistant\n{reply}<|im_end|>")?;
            }
        }

        for result in &params.tool_results {
            writeln!(
                prompt,
                "<|im_start|>tool\n[{}] {}<|im_end|>",
                result.tool_name, result.result
            )?;
        }

        write!(prompt, "<|im_start|>assistant\n")?;
        Ok(prompt)
    }

    fn process(&self, raw: &str, _model: &SendableModel) -> anyhow::Result<ProcessedOutput> {
        Ok(parse_output(raw))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
