// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use uuid::Uuid;

use tiller_context::ProcessedOutput;
use tiller_model::{ChunkMetrics, SendableModel};
use tiller_tools::{ToolRequest, ToolResponse};

/// What a `generate` call should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the think/act/observe loop with the given tool allow-set.
    TextGeneration { tools: HashSet<String> },
    /// Single-shot image generation; bypasses the loop entirely.
    ImageGeneration { tools: HashSet<String> },
}

impl Action {
    pub fn text(tools: impl IntoIterator<Item = String>) -> Self {
        Self::TextGeneration {
            tools: tools.into_iter().collect(),
        }
    }

    pub fn tools(&self) -> &HashSet<String> {
        match self {
            Self::TextGeneration { tools } | Self::ImageGeneration { tools } => tools,
        }
    }
}

/// Immutable description of one `generate` call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub message_id: Uuid,
    pub chat_id: Uuid,
    pub model: SendableModel,
    pub action: Action,
    pub prompt: String,
}

/// Loop state, passed by value through the iteration controller and
/// transitioned only by the pure methods below.  Once `is_complete` is set,
/// every transition is a no-op.
#[derive(Debug, Clone)]
pub struct GenerationState {
    pub request: GenerationRequest,
    /// The prompt the next context build will use.  Starts as the request
    /// prompt; replaced by redirects and flush continuations.
    pub prompt: String,
    pub iteration_count: u32,
    pub tool_results: Vec<ToolResponse>,
    pub pending_tool_calls: Vec<ToolRequest>,
    pub last_output: Option<ProcessedOutput>,
    pub last_metrics: Option<ChunkMetrics>,
    pub context_utilization: Option<f32>,
    pub is_complete: bool,
    pub memory_flush_performed: bool,
}

impl GenerationState {
    pub fn new(request: GenerationRequest) -> Self {
        let prompt = request.prompt.clone();
        Self {
            request,
            prompt,
            iteration_count: 0,
            tool_results: Vec::new(),
            pending_tool_calls: Vec::new(),
            last_output: None,
            last_metrics: None,
            context_utilization: None,
            is_complete: false,
            memory_flush_performed: false,
        }
    }

    /// Record the result of one streamed turn.  Increments the iteration
    /// count — exactly once per loop turn, since every turn streams once.
    pub fn with_stream_complete(
        mut self,
        output: ProcessedOutput,
        metrics: Option<ChunkMetrics>,
    ) -> Self {
        if self.is_complete {
            return self;
        }
        self.iteration_count += 1;
        self.pending_tool_calls = output.tool_calls.clone();
        self.last_output = Some(output);
        if let Some(util) = metrics
            .as_ref()
            .and_then(|m| m.usage.as_ref())
            .and_then(|u| u.context_utilization)
        {
            self.context_utilization = Some(util);
        }
        if metrics.is_some() {
            self.last_metrics = metrics;
        }
        self
    }

    /// Adopt a batch of tool results and clear the pending calls.
    pub fn continue_with_tools(mut self, responses: Vec<ToolResponse>) -> Self {
        if self.is_complete {
            return self;
        }
        self.tool_results.extend(responses);
        self.pending_tool_calls.clear();
        self
    }

    /// Restart the next iteration with a new prompt; prior tool results do
    /// not carry over.
    pub fn continue_with_prompt(mut self, prompt: impl Into<String>) -> Self {
        if self.is_complete {
            return self;
        }
        self.prompt = prompt.into();
        self.tool_results.clear();
        self.pending_tool_calls.clear();
        self
    }

    pub fn mark_complete(mut self) -> Self {
        self.is_complete = true;
        self
    }

    pub fn mark_memory_flush_performed(mut self) -> Self {
        if self.is_complete {
            return self;
        }
        self.memory_flush_performed = true;
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_model::{LocationKind, ModelBackend, UsageMetrics};

    fn request() -> GenerationRequest {
        GenerationRequest {
            message_id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            model: SendableModel {
                id: Uuid::new_v4(),
                name: "m".into(),
                backend: ModelBackend::Gguf,
                location: "m.gguf".into(),
                location_kind: LocationKind::LocalFile,
                location_local: None,
                location_bookmark: None,
                metadata: None,
            },
            action: Action::text([]),
            prompt: "hello".into(),
        }
    }

    fn metrics_with_utilization(util: f32) -> ChunkMetrics {
        ChunkMetrics {
            usage: Some(UsageMetrics {
                generated_tokens: 1,
                prompt_tokens: 1,
                context_utilization: Some(util),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn iteration_count_increments_once_per_stream() {
        let s = GenerationState::new(request());
        assert_eq!(s.iteration_count, 0);
        let s = s.with_stream_complete(ProcessedOutput::default(), None);
        assert_eq!(s.iteration_count, 1);
        let s = s.with_stream_complete(ProcessedOutput::default(), None);
        assert_eq!(s.iteration_count, 2);
    }

    #[test]
    fn utilization_keeps_last_known_value() {
        let s = GenerationState::new(request())
            .with_stream_complete(ProcessedOutput::default(), Some(metrics_with_utilization(0.4)));
        assert_eq!(s.context_utilization, Some(0.4));
        // A turn without usage metrics must not erase the last reading.
        let s = s.with_stream_complete(ProcessedOutput::default(), None);
        assert_eq!(s.context_utilization, Some(0.4));
    }

    #[test]
    fn continue_with_prompt_resets_tool_results() {
        let req = ToolRequest::new("t", serde_json::json!({}));
        let s = GenerationState::new(request())
            .continue_with_tools(vec![ToolResponse::ok(&req, "r")]);
        assert_eq!(s.tool_results.len(), 1);
        let s = s.continue_with_prompt("new prompt");
        assert!(s.tool_results.is_empty());
        assert_eq!(s.prompt, "new prompt");
    }

    #[test]
    fn transitions_are_noops_after_completion() {
        let s = GenerationState::new(request()).mark_complete();
        let s = s.with_stream_complete(ProcessedOutput::default(), None);
        assert_eq!(s.iteration_count, 0);
        let s = s.continue_with_prompt("ignored");
        assert_eq!(s.prompt, "hello");
        let s = s.mark_memory_flush_performed();
        assert!(!s.memory_flush_performed);
        assert!(s.is_complete);
    }
}
