// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;
use uuid::Uuid;

/// Events emitted by the agent during a generation.
/// Consumers (CLI, UI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A generation began; first event of every run.
    GenerationStarted { run_id: Uuid },
    /// The run finished normally (including after a hard stop).
    GenerationCompleted { run_id: Uuid, total_duration_ms: u64 },
    /// The run failed with a non-cancellation error.
    GenerationFailed { run_id: Uuid, error: String },
    /// A text chunk streamed from the model.  Never throttled.
    TextDelta { text: String },
    /// A tool invocation is about to be dispatched.
    ToolStarted { request_id: Uuid, tool_name: String },
    /// Batch progress while tool results are collected.
    ToolProgress {
        request_id: Uuid,
        fraction: f32,
        status: String,
    },
    ToolCompleted {
        request_id: Uuid,
        result: String,
        duration_ms: u64,
    },
    ToolFailed { request_id: Uuid, error: String },
    /// One loop turn finished; `decision` describes what happens next.
    IterationCompleted { iteration: u32, decision: String },
    /// Snapshot of loop state, emitted before streaming and before tools run.
    StateUpdate {
        iteration: u32,
        is_executing_tools: bool,
        active_tools: Vec<String>,
        completed_tool_calls: usize,
        pending_tool_calls: usize,
    },
}

/// Serialized broadcast of [`AgentEvent`]s.
///
/// The outbound stream is stable for the lifetime of the agent: subscribers
/// stay valid across generations, and only per-run timers reset between runs.
/// Built on a bounded broadcast buffer; a subscriber that falls behind loses
/// oldest events rather than blocking the emitter.
pub struct EventEmitter {
    tx: broadcast::Sender<AgentEvent>,
    run_started: Mutex<Option<Instant>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            run_started: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> BroadcastStream<AgentEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Emit one event.  A send with no live subscribers is not an error.
    pub fn emit(&self, event: AgentEvent) {
        trace!(?event, "emit");
        let _ = self.tx.send(event);
    }

    /// Reset the per-run timer and emit `GenerationStarted`.
    pub fn begin_run(&self, run_id: Uuid) {
        *self.run_started.lock().unwrap() = Some(Instant::now());
        self.emit(AgentEvent::GenerationStarted { run_id });
    }

    /// Emit the successful terminal event; returns the run duration.
    pub fn complete_run(&self, run_id: Uuid) -> u64 {
        let total_duration_ms = self.run_elapsed_ms();
        self.emit(AgentEvent::GenerationCompleted {
            run_id,
            total_duration_ms,
        });
        total_duration_ms
    }

    /// Emit the failure terminal event.
    pub fn fail_run(&self, run_id: Uuid, error: &str) {
        self.emit(AgentEvent::GenerationFailed {
            run_id,
            error: error.to_string(),
        });
    }

    pub fn run_elapsed_ms(&self) -> u64 {
        self.run_started
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let emitter = EventEmitter::default();
        let mut rx = emitter.subscribe();
        let run = Uuid::new_v4();
        emitter.begin_run(run);
        emitter.emit(AgentEvent::TextDelta { text: "a".into() });
        emitter.emit(AgentEvent::TextDelta { text: "b".into() });
        emitter.complete_run(run);

        let mut texts = Vec::new();
        for _ in 0..4 {
            match rx.next().await.unwrap().unwrap() {
                AgentEvent::TextDelta { text } => texts.push(text),
                AgentEvent::GenerationStarted { run_id } => assert_eq!(run_id, run),
                AgentEvent::GenerationCompleted { run_id, .. } => assert_eq!(run_id, run),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn subscriber_survives_across_runs() {
        let emitter = EventEmitter::default();
        let mut rx = emitter.subscribe();
        for _ in 0..2 {
            let run = Uuid::new_v4();
            emitter.begin_run(run);
            emitter.complete_run(run);
        }
        let mut count = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), rx.next()).await
        {
            count += 1;
        }
        assert_eq!(count, 4, "both runs visible on the same subscription");
    }

    #[tokio::test]
    async fn emitting_without_subscribers_is_fine() {
        let emitter = EventEmitter::default();
        emitter.emit(AgentEvent::TextDelta { text: "x".into() });
    }
}
