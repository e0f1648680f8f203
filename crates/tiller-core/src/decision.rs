// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tiller_config::Config;
use tiller_tools::ToolRequest;

use crate::{AgentError, GenerationState};

/// What the loop does after a streamed turn.
#[derive(Debug)]
pub enum Decision {
    /// Persist final metrics and terminate the loop.
    Complete,
    /// Drop accumulated tool results and re-prompt.
    ContinueWithNewPrompt(String),
    /// Invoke the external tool executor.
    ExecuteTools(Vec<ToolRequest>),
    /// Propagate; the run fails.
    Fail(AgentError),
}

impl Decision {
    /// Short label for `IterationCompleted` events and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Complete => "complete".to_string(),
            Self::ContinueWithNewPrompt(_) => "continue_with_new_prompt".to_string(),
            Self::ExecuteTools(reqs) => format!("execute_tools({})", reqs.len()),
            Self::Fail(e) => format!("error: {e}"),
        }
    }
}

/// One rule in the post-stream classification chain.  Returning `None`
/// passes through to the next handler.
pub trait DecisionHandler: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, state: &GenerationState) -> Option<Decision>;
}

/// Ordered handlers with short-circuit evaluation; `Complete` when all pass.
pub struct DecisionChain {
    handlers: Vec<Box<dyn DecisionHandler>>,
}

impl DecisionChain {
    pub fn new(handlers: Vec<Box<dyn DecisionHandler>>) -> Self {
        Self { handlers }
    }

    /// The baseline chain: iteration cap, tool calls, context pressure.
    /// Order matters — the cap must win even when tool calls are pending.
    pub fn from_config(config: &Config) -> Self {
        Self::new(vec![
            Box::new(IterationCapHandler {
                max_iterations: config.generation.default_max_iterations,
            }),
            Box::new(ToolCallsHandler),
            Box::new(ContextPressureHandler {
                threshold: config.compaction.utilization_threshold,
                flush_prompt: config.compaction.flush_prompt.clone(),
            }),
        ])
    }

    pub fn evaluate(&self, state: &GenerationState) -> Decision {
        for handler in &self.handlers {
            if let Some(decision) = handler.evaluate(state) {
                tracing::debug!(handler = handler.name(), decision = %decision.describe(), "decision");
                return decision;
            }
        }
        Decision::Complete
    }
}

pub struct IterationCapHandler {
    pub max_iterations: u32,
}

impl DecisionHandler for IterationCapHandler {
    fn name(&self) -> &str {
        "iteration_cap"
    }

    fn evaluate(&self, state: &GenerationState) -> Option<Decision> {
        (state.iteration_count >= self.max_iterations)
            .then(|| Decision::Fail(AgentError::TooManyIterations(self.max_iterations)))
    }
}

pub struct ToolCallsHandler;

impl DecisionHandler for ToolCallsHandler {
    fn name(&self) -> &str {
        "tool_calls_present"
    }

    fn evaluate(&self, state: &GenerationState) -> Option<Decision> {
        let output = state.last_output.as_ref()?;
        output
            .has_tool_calls()
            .then(|| Decision::ExecuteTools(state.pending_tool_calls.clone()))
    }
}

/// Requests a memory flush once per generation when the context window is
/// close to full.  If the window is still effectively exhausted after the
/// flush already ran, the run cannot recover and fails.
pub struct ContextPressureHandler {
    pub threshold: f32,
    pub flush_prompt: String,
}

/// Utilization at which a generation is unrecoverable even post-flush.
const HARD_UTILIZATION_LIMIT: f32 = 0.99;

impl DecisionHandler for ContextPressureHandler {
    fn name(&self) -> &str {
        "context_pressure_flush"
    }

    fn evaluate(&self, state: &GenerationState) -> Option<Decision> {
        let utilization = state.context_utilization?;
        if state.memory_flush_performed {
            return (utilization >= HARD_UTILIZATION_LIMIT)
                .then(|| Decision::Fail(AgentError::ContextLimitExceeded));
        }
        (utilization > self.threshold)
            .then(|| Decision::ContinueWithNewPrompt(self.flush_prompt.clone()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, GenerationRequest};
    use tiller_context::ProcessedOutput;
    use tiller_model::{
        ChunkMetrics, LocationKind, ModelBackend, SendableModel, UsageMetrics,
    };
    use uuid::Uuid;

    fn state() -> GenerationState {
        GenerationState::new(GenerationRequest {
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
            prompt: "p".into(),
        })
    }

    fn chain() -> DecisionChain {
        DecisionChain::from_config(&tiller_config::Config::default())
    }

    fn output_with_tool_call() -> ProcessedOutput {
        tiller_context::parse_output(
            r#"<|channel|>commentary to=functions.search<|message|>{"q":"x"}<|call|>"#,
        )
    }

    fn metrics(util: f32) -> ChunkMetrics {
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
    fn default_is_complete() {
        let s = state().with_stream_complete(ProcessedOutput::default(), None);
        assert!(matches!(chain().evaluate(&s), Decision::Complete));
    }

    #[test]
    fn tool_calls_win_over_context_pressure() {
        let s = state().with_stream_complete(output_with_tool_call(), Some(metrics(0.99)));
        match chain().evaluate(&s) {
            Decision::ExecuteTools(reqs) => assert_eq!(reqs[0].name, "search"),
            other => panic!("expected ExecuteTools, got {}", other.describe()),
        }
    }

    #[test]
    fn iteration_cap_beats_everything() {
        let mut s = state().with_stream_complete(output_with_tool_call(), None);
        s.iteration_count = 10;
        assert!(matches!(
            chain().evaluate(&s),
            Decision::Fail(AgentError::TooManyIterations(10))
        ));
    }

    #[test]
    fn context_pressure_fires_once() {
        let s = state().with_stream_complete(ProcessedOutput::default(), Some(metrics(0.95)));
        assert!(matches!(
            chain().evaluate(&s),
            Decision::ContinueWithNewPrompt(_)
        ));
        let s = s.mark_memory_flush_performed();
        assert!(matches!(chain().evaluate(&s), Decision::Complete));
    }

    #[test]
    fn exhausted_context_after_flush_is_unrecoverable() {
        let s = state()
            .with_stream_complete(ProcessedOutput::default(), Some(metrics(0.995)))
            .mark_memory_flush_performed();
        assert!(matches!(
            chain().evaluate(&s),
            Decision::Fail(AgentError::ContextLimitExceeded)
        ));
    }

    #[test]
    fn utilization_below_threshold_completes() {
        let s = state().with_stream_complete(ProcessedOutput::default(), Some(metrics(0.5)));
        assert!(matches!(chain().evaluate(&s), Decision::Complete));
    }

    #[test]
    fn handlers_can_be_reordered() {
        // A chain without the cap handler never fails on iteration count.
        let chain = DecisionChain::new(vec![Box::new(ToolCallsHandler)]);
        let mut s = state().with_stream_complete(ProcessedOutput::default(), None);
        s.iteration_count = 100;
        assert!(matches!(chain.evaluate(&s), Decision::Complete));
    }
}
