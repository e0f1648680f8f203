// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! File-backed context providers.
//!
//! A workspace root holds an optional `.tiller/` directory:
//!
//! ```text
//! .tiller/
//! ├── context.md      → workspace context block
//! ├── memory.md       → memory items, one paragraph each
//! └── skills/
//!     ├── review.md   → skill "review"
//!     └── deploy.md   → skill "deploy"
//! ```
//!
//! All providers are optional; a missing file simply yields `None`.

use std::path::PathBuf;

use tracing::debug;
use uuid::Uuid;

use crate::{MemoryContext, MemoryItem, Skill, SkillContext};

/// Optional file-backed memory/skills/context for a chat.
pub trait Workspace: Send + Sync {
    fn memory_context(&self) -> Option<MemoryContext>;
    fn skill_context(&self) -> Option<SkillContext>;
    fn workspace_context(&self) -> Option<String>;
}

pub struct FileWorkspace {
    root: PathBuf,
}

impl FileWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self) -> PathBuf {
        self.root.join(".tiller")
    }
}

impl Workspace for FileWorkspace {
    fn memory_context(&self) -> Option<MemoryContext> {
        let text = std::fs::read_to_string(self.dir().join("memory.md")).ok()?;
        let items: Vec<MemoryItem> = text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| MemoryItem {
                id: Uuid::new_v4(),
                content: p.to_string(),
            })
            .collect();
        if items.is_empty() {
            return None;
        }
        debug!(count = items.len(), "loaded workspace memory items");
        Some(MemoryContext { items })
    }

    fn skill_context(&self) -> Option<SkillContext> {
        let dir = self.dir().join("skills");
        let entries = std::fs::read_dir(&dir).ok()?;
        let mut skills = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(instructions) => skills.push(Skill {
                    name: name.to_string(),
                    instructions: instructions.trim().to_string(),
                }),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable skill"),
            }
        }
        if skills.is_empty() {
            return None;
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Some(SkillContext { skills })
    }

    fn workspace_context(&self) -> Option<String> {
        let text = std::fs::read_to_string(self.dir().join("context.md")).ok()?;
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
