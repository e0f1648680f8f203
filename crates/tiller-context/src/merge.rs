// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::{MemoryContext, SkillContext};

/// Merge workspace memory into the chat's stored memory.
///
/// Primary (store) items are preserved in order; secondary (workspace) items
/// are appended unless already present.  Presence is checked by id first and
/// by exact content second, since file-backed providers mint fresh ids on
/// every load.
pub fn merge_memory(
    primary: Option<MemoryContext>,
    secondary: Option<MemoryContext>,
) -> Option<MemoryContext> {
    match (primary, secondary) {
        (None, s) => s,
        (p, None) => p,
        (Some(mut p), Some(s)) => {
            for item in s.items {
                let present = p
                    .items
                    .iter()
                    .any(|existing| existing.id == item.id || existing.content == item.content);
                if !present {
                    p.items.push(item);
                }
            }
            Some(p)
        }
    }
}

/// Union of skills by case-insensitive name; base skills keep their order and
/// win on collision.
pub fn merge_skills(
    primary: Option<SkillContext>,
    secondary: Option<SkillContext>,
) -> Option<SkillContext> {
    match (primary, secondary) {
        (None, s) => s,
        (p, None) => p,
        (Some(mut p), Some(s)) => {
            for skill in s.skills {
                let present = p
                    .skills
                    .iter()
                    .any(|existing| existing.name.eq_ignore_ascii_case(&skill.name));
                if !present {
                    p.skills.push(skill);
                }
            }
            Some(p)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryItem, Skill};
    use uuid::Uuid;

    fn item(content: &str) -> MemoryItem {
        MemoryItem {
            id: Uuid::new_v4(),
            content: content.to_string(),
        }
    }

    #[test]
    fn memory_merge_preserves_primary_and_appends_new() {
        let p = MemoryContext {
            items: vec![item("a"), item("b")],
        };
        let s = MemoryContext {
            items: vec![item("b"), item("c")],
        };
        let merged = merge_memory(Some(p), Some(s)).unwrap();
        let contents: Vec<&str> = merged.items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[test]
    fn memory_merge_is_identity_when_one_side_missing() {
        let p = MemoryContext {
            items: vec![item("a")],
        };
        assert_eq!(merge_memory(Some(p.clone()), None), Some(p.clone()));
        assert_eq!(merge_memory(None, Some(p.clone())), Some(p));
        assert_eq!(merge_memory(None, None), None);
    }

    #[test]
    fn skill_merge_unions_case_insensitively_base_first() {
        let p = SkillContext {
            skills: vec![Skill {
                name: "Review".into(),
                instructions: "base".into(),
            }],
        };
        let s = SkillContext {
            skills: vec![
                Skill {
                    name: "review".into(),
                    instructions: "workspace".into(),
                },
                Skill {
                    name: "deploy".into(),
                    instructions: "ws".into(),
                },
            ],
        };
        let merged = merge_skills(Some(p), Some(s)).unwrap();
        assert_eq!(merged.skills.len(), 2);
        assert_eq!(merged.skills[0].name, "Review");
        assert_eq!(merged.skills[0].instructions, "base");
        assert_eq!(merged.skills[1].name, "deploy");
    }
}
