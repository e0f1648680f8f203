// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming final-channel extraction.
//!
//! During streaming, the persistor needs the user-visible text of an
//! *in-progress* raw buffer on every throttled write.  Running the full
//! channel parser each time would be wasteful, so this module implements the
//! cheap pure rule: find the user-facing text, drop everything else.
//!
//! The function is deterministic and idempotent on already-extracted plain
//! text, and agrees with the full parser's final channel whenever the raw
//! text ends with a valid final block.

const FINAL_MARKER: &str = "<|channel|>final<|message|>";
const TERMINATORS: [&str; 4] = ["<|end|>", "<|return|>", "<|call|>", "<|channel|>"];
const RECIPIENT: &str = "<|recipient|>";

const TAG_PAIRS: [(&str, &str); 3] = [
    ("<think>", "</think>"),
    ("<commentary>", "</commentary>"),
    ("<tool_call>", "</tool_call>"),
];

/// Extract the user-visible text from in-progress raw model output.
pub fn extract_final_channel(raw: &str) -> String {
    // Harmony raw: take the substring after the *last* final marker.
    if let Some(pos) = raw.rfind(FINAL_MARKER) {
        let mut content = &raw[pos + FINAL_MARKER.len()..];
        if let Some(end) = TERMINATORS.iter().filter_map(|t| content.find(t)).min() {
            content = &content[..end];
        }
        if let Some(r) = content.find(RECIPIENT) {
            content = &content[..r];
        }
        return content.trim().to_string();
    }

    // Harmony prelude without a final block yet: nothing to show.
    if raw.contains("<|channel|>") || raw.contains("<|start|>") {
        return String::new();
    }

    // Tagged raw: strip complete and incomplete tagged blocks plus framing
    // markers; whatever remains is the reply text.
    let mut text = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        let next = TAG_PAIRS
            .iter()
            .filter_map(|(open, close)| rest.find(open).map(|p| (p, *open, *close)))
            .min_by_key(|(p, ..)| *p);
        let Some((pos, open, close)) = next else {
            text.push_str(rest);
            break;
        };
        text.push_str(&rest[..pos]);
        rest = &rest[pos + open.len()..];
        match rest.find(close) {
            Some(p) => rest = &rest[p + close.len()..],
            // Unterminated block swallows the remainder.
            None => break,
        }
    }

    let text = text.replace("<|im_end|>", "");
    let text = text.trim();
    let text = text.strip_prefix("<|im_start|>assistant\n").unwrap_or(text);
    text.trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through_trimmed() {
        assert_eq!(extract_final_channel("  Hello.  "), "Hello.");
    }

    #[test]
    fn final_marker_content_up_to_terminator() {
        let raw = "<|channel|>analysis<|message|>mull<|end|>\
                   <|channel|>final<|message|>Hi there<|return|>";
        assert_eq!(extract_final_channel(raw), "Hi there");
    }

    #[test]
    fn last_final_marker_wins() {
        let raw = "<|channel|>final<|message|>draft<|end|>\
                   <|channel|>final<|message|>real<|end|>";
        assert_eq!(extract_final_channel(raw), "real");
    }

    #[test]
    fn earliest_terminator_bounds_content() {
        let raw = "<|channel|>final<|message|>short<|channel|>analysis<|message|>more<|end|>";
        assert_eq!(extract_final_channel(raw), "short");
    }

    #[test]
    fn in_progress_final_returns_partial_text() {
        let raw = "<|channel|>final<|message|>Hel";
        assert_eq!(extract_final_channel(raw), "Hel");
    }

    #[test]
    fn prelude_without_final_is_empty() {
        assert_eq!(extract_final_channel("<|channel|>analysis<|message|>thinking"), "");
        assert_eq!(extract_final_channel("<|start|>assistant"), "");
    }

    #[test]
    fn recipient_suffix_is_stripped() {
        let raw = "<|channel|>final<|message|>Done.<|recipient|>user";
        assert_eq!(extract_final_channel(raw), "Done.");
    }

    #[test]
    fn complete_and_incomplete_tag_blocks_are_stripped() {
        assert_eq!(extract_final_channel("<think>x</think>Answer"), "Answer");
        assert_eq!(extract_final_channel("Answer<think>trailing"), "Answer");
        assert_eq!(
            extract_final_channel("<commentary>c</commentary>A<tool_call>{}</tool_call>B"),
            "AB"
        );
    }

    #[test]
    fn im_markers_are_stripped() {
        assert_eq!(
            extract_final_channel("<|im_start|>assistant\nHello<|im_end|>"),
            "Hello"
        );
    }

    #[test]
    fn idempotent_on_marker_free_text() {
        for raw in [
            "plain reply",
            "  padded  ",
            "<think>x</think>visible",
            "<|im_start|>assistant\nanswer<|im_end|>",
        ] {
            let once = extract_final_channel(raw);
            assert_eq!(extract_final_channel(&once), once, "input: {raw:?}");
        }
    }
}
