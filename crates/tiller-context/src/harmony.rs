// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parser for the model's structured output markers.
//!
//! Two dialects are recognized:
//!
//! - **Harmony**: `<|channel|>NAME [to=RECIPIENT]<|message|>CONTENT` blocks
//!   terminated by `<|end|>`, `<|return|>`, `<|call|>`, or the start of the
//!   next block.  Tool calls are commentary blocks addressed to
//!   `functions.<name>` whose content is the JSON argument payload.
//! - **Tagged**: `<think>…</think>`, `<commentary>…</commentary>`, and
//!   `<tool_call>…</tool_call>` blocks inside otherwise plain text, with
//!   `<|im_start|>` / `<|im_end|>` framing markers.
//!
//! Raw text without markers parses to a single final channel.

use serde_json::Value;
use uuid::Uuid;

use tiller_tools::ToolRequest;

use crate::{Channel, ChannelKind, ProcessedOutput};

const CHANNEL: &str = "<|channel|>";
const MESSAGE: &str = "<|message|>";
const START: &str = "<|start|>";
const END: &str = "<|end|>";
const RETURN: &str = "<|return|>";
const CALL: &str = "<|call|>";
const RECIPIENT: &str = "<|recipient|>";

const IM_START_ASSISTANT: &str = "<|im_start|>assistant\n";
const IM_END: &str = "<|im_end|>";

/// Parse raw model output into ordered channels plus tool calls.
pub fn parse_output(raw: &str) -> ProcessedOutput {
    let mut out = if raw.contains(CHANNEL) || raw.contains(START) {
        parse_harmony(raw)
    } else {
        parse_tagged(raw)
    };
    out.raw = raw.to_string();
    out
}

// ─── Harmony dialect ─────────────────────────────────────────────────────────

fn parse_harmony(raw: &str) -> ProcessedOutput {
    let mut out = ProcessedOutput::default();
    let mut order = 0u32;
    let mut rest = raw;

    while let Some(pos) = rest.find(CHANNEL) {
        rest = &rest[pos + CHANNEL.len()..];
        let Some(msg_pos) = rest.find(MESSAGE) else {
            // Header still streaming; nothing more to parse.
            break;
        };
        let header = &rest[..msg_pos];
        rest = &rest[msg_pos + MESSAGE.len()..];

        let (content, terminated, consumed) = read_content(rest);
        rest = &rest[consumed..];

        let recipient = header
            .split_whitespace()
            .find_map(|tok| tok.strip_prefix("to="))
            .map(str::to_string);
        let name = header.split_whitespace().next().unwrap_or("");

        let content = strip_recipient_suffix(content).trim().to_string();
        let mut channel = Channel {
            id: Uuid::new_v4(),
            kind: channel_kind(name, recipient.as_deref()),
            content,
            order,
            is_complete: terminated,
            recipient: recipient.clone(),
            associated_tool_id: None,
        };

        if channel.kind == ChannelKind::Tool {
            if let Some(request) = tool_request_from_channel(&channel) {
                channel.associated_tool_id = Some(request.id);
                out.tool_calls.push(request);
            }
        }

        out.channels.push(channel);
        order += 1;
    }

    // Later turns of the same message may append plain text after the last
    // terminated block.  Keep it as the final channel rather than dropping
    // it; marker fragments are not content.
    let trailing = rest.trim();
    let trailing = trailing
        .strip_prefix("<|start|>assistant")
        .map(str::trim)
        .unwrap_or(trailing);
    if !trailing.is_empty() && !trailing.contains("<|") {
        out.channels
            .push(Channel::new(ChannelKind::Final, trailing, order));
    }

    out
}

/// Read one channel's content.  Returns `(content, terminated, bytes_consumed)`
/// where `terminated` is false only when the content runs to end of input.
fn read_content(rest: &str) -> (&str, bool, usize) {
    let mut end = rest.len();
    let mut terminated = false;
    let mut skip = 0;
    for marker in [END, RETURN, CALL, CHANNEL, START] {
        if let Some(p) = rest.find(marker) {
            if p < end {
                end = p;
                terminated = true;
                // Explicit terminators are consumed; the next block's own
                // marker is left for the outer loop to find.
                skip = match marker {
                    CHANNEL | START => 0,
                    m => m.len(),
                };
            }
        }
    }
    (&rest[..end], terminated, end + skip)
}

fn channel_kind(name: &str, recipient: Option<&str>) -> ChannelKind {
    if recipient.is_some_and(|r| r.starts_with("functions.")) {
        return ChannelKind::Tool;
    }
    match name {
        "analysis" => ChannelKind::Analysis,
        "commentary" => ChannelKind::Commentary,
        "final" => ChannelKind::Final,
        _ => ChannelKind::Commentary,
    }
}

fn strip_recipient_suffix(content: &str) -> &str {
    match content.find(RECIPIENT) {
        Some(p) => &content[..p],
        None => content,
    }
}

fn tool_request_from_channel(channel: &Channel) -> Option<ToolRequest> {
    let recipient = channel.recipient.as_deref()?;
    let name = recipient.strip_prefix("functions.")?;
    if name.is_empty() {
        return None;
    }
    // Argument payloads are JSON when the model obeys the constraint marker;
    // anything else is preserved verbatim so the tool can report the problem.
    let arguments = serde_json::from_str(&channel.content)
        .unwrap_or_else(|_| Value::String(channel.content.clone()));
    Some(ToolRequest::new(name, arguments))
}

// ─── Tagged dialect ──────────────────────────────────────────────────────────

const TAG_BLOCKS: [(&str, &str, ChannelKind); 3] = [
    ("<think>", "</think>", ChannelKind::Analysis),
    ("<commentary>", "</commentary>", ChannelKind::Commentary),
    ("<tool_call>", "</tool_call>", ChannelKind::Tool),
];

fn parse_tagged(raw: &str) -> ProcessedOutput {
    let mut out = ProcessedOutput::default();
    let mut order = 0u32;
    let mut plain = String::new();
    let mut rest = raw;

    loop {
        // Earliest opening tag in the remaining text, if any.
        let next = TAG_BLOCKS
            .iter()
            .filter_map(|(open, close, kind)| rest.find(open).map(|p| (p, *open, *close, *kind)))
            .min_by_key(|(p, ..)| *p);

        let Some((pos, open, close, kind)) = next else {
            plain.push_str(rest);
            break;
        };

        plain.push_str(&rest[..pos]);
        rest = &rest[pos + open.len()..];

        let (content, is_complete) = match rest.find(close) {
            Some(p) => {
                let c = &rest[..p];
                rest = &rest[p + close.len()..];
                (c, true)
            }
            None => {
                let c = rest;
                rest = "";
                (c, false)
            }
        };

        let mut channel = Channel {
            id: Uuid::new_v4(),
            kind,
            content: content.trim().to_string(),
            order,
            is_complete,
            recipient: None,
            associated_tool_id: None,
        };
        if kind == ChannelKind::Tool && is_complete {
            if let Some(request) = tagged_tool_request(&channel.content) {
                channel.associated_tool_id = Some(request.id);
                out.tool_calls.push(request);
            }
        }
        out.channels.push(channel);
        order += 1;
    }

    let plain = plain
        .trim_start()
        .strip_prefix(IM_START_ASSISTANT)
        .unwrap_or(&plain)
        .replace(IM_END, "");
    let plain = plain.trim();
    if !plain.is_empty() {
        out.channels
            .push(Channel::new(ChannelKind::Final, plain, order));
    }

    out
}

/// `<tool_call>` payloads are `{"name": …, "arguments": …}` JSON objects.
fn tagged_tool_request(content: &str) -> Option<ToolRequest> {
    let v: Value = serde_json::from_str(content).ok()?;
    let name = v.get("name")?.as_str()?.to_string();
    let arguments = v.get("arguments").cloned().unwrap_or(Value::Null);
    Some(ToolRequest::new(name, arguments))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
