// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use tiller_config::Config;
use tiller_context::{BuildParameters, ContextBuilder, Workspace};
use tiller_model::{
    ChunkMetrics, ImageGenerator, ModelDownloader, ModelInput,
};
use tiller_store::{ImageRecord, MessageRecord, MetricsRecord, Store};
use tiller_tools::{ScopedToolRequest, ToolRequest, ToolResponse, ToolScope, Tooling};

use crate::{
    error::is_cancellation, Action, AgentError, AgentEvent, ContextAssembler, Decision,
    DecisionChain, EventEmitter, GenerationRequest, GenerationState, MessagePersistor,
    ModelStateCoordinator, SessionRouter, SteeringCoordinator, SteeringMode, SteeringRequest,
    StreamAccumulator,
};

/// Collaborators injected at construction.  Everything optional really is:
/// a runtime without tooling answers text-only, one without a workspace
/// skips the file-backed merges.
pub struct AgentDeps {
    pub store: Arc<dyn Store>,
    pub builder: Arc<dyn ContextBuilder>,
    pub sessions: SessionRouter,
    pub image_generator: Arc<dyn ImageGenerator>,
    pub tooling: Option<Arc<dyn Tooling>>,
    pub workspace: Option<Arc<dyn Workspace>>,
    pub downloader: Option<Arc<dyn ModelDownloader>>,
}

/// The agent orchestrator: drives the think/act/observe loop for one active
/// chat, owning the model coordinator, steering mailbox, event stream,
/// persistence pipeline and decision chain for its lifetime.
pub struct Agent {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    coordinator: ModelStateCoordinator,
    persistor: MessagePersistor,
    assembler: ContextAssembler,
    steering: Arc<SteeringCoordinator>,
    emitter: Arc<EventEmitter>,
    decisions: DecisionChain,
    tooling: Option<Arc<dyn Tooling>>,
    current_chat: Mutex<Option<Uuid>>,
}

impl Agent {
    pub fn new(config: Arc<Config>, deps: AgentDeps) -> Self {
        let coordinator = ModelStateCoordinator::new(
            Arc::clone(&deps.store),
            deps.sessions,
            deps.image_generator,
            deps.downloader,
            config.memory.clone(),
        );
        let persistor = MessagePersistor::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.builder),
            Duration::from_millis(config.streaming.throttle_interval_ms),
            config.logging.debug.clone(),
        );
        let assembler = ContextAssembler::new(
            Arc::clone(&deps.store),
            deps.builder,
            deps.tooling.clone(),
            deps.workspace,
        );
        let decisions = DecisionChain::from_config(&config);
        Self {
            store: deps.store,
            coordinator,
            persistor,
            assembler,
            steering: Arc::new(SteeringCoordinator::new()),
            emitter: Arc::new(EventEmitter::default()),
            decisions,
            tooling: deps.tooling,
            current_chat: Mutex::new(None),
            config,
        }
    }

    /// Subscribe to the lifecycle/tool/stream event feed.  The stream is
    /// stable across generations and finishes only on teardown.
    pub fn subscribe(&self) -> BroadcastStream<AgentEvent> {
        self.emitter.subscribe()
    }

    pub fn steering(&self) -> Arc<SteeringCoordinator> {
        Arc::clone(&self.steering)
    }

    pub fn coordinator(&self) -> &ModelStateCoordinator {
        &self.coordinator
    }

    /// Make `chat_id` the active chat and preload its language model.
    pub async fn load(&self, chat_id: Uuid) -> anyhow::Result<()> {
        self.coordinator.load(chat_id).await?;
        *self.current_chat.lock().unwrap() = Some(chat_id);
        Ok(())
    }

    pub async fn unload(&self) -> anyhow::Result<()> {
        self.coordinator.unload().await?;
        *self.current_chat.lock().unwrap() = None;
        Ok(())
    }

    pub async fn stop(&self) {
        self.coordinator.stop().await;
    }

    /// Submit a steering request.  A hard stop additionally aborts the
    /// in-flight backend generation so the stream winds down promptly.
    pub async fn steer(&self, mode: SteeringMode) -> Uuid {
        let hard = matches!(mode, SteeringMode::HardStop);
        let id = self.steering.submit(mode);
        if hard {
            self.coordinator.stop().await;
        }
        id
    }

    /// Run one generation.  Emits exactly one `GenerationStarted` and
    /// exactly one terminal event; cooperative cancellation terminates the
    /// run as completed, any other error appends a failure note to the
    /// message and re-raises.
    pub async fn generate(&self, prompt: &str, action: Action) -> anyhow::Result<()> {
        let chat_id = self
            .current_chat
            .lock()
            .unwrap()
            .ok_or(AgentError::NoChatLoaded)?;

        let message = MessageRecord::new(chat_id, prompt);
        let message_id = message.id;
        self.persistor.create_message(message).await?;
        self.emitter.begin_run(message_id);

        let result = match &action {
            Action::TextGeneration { .. } => {
                self.run_loop(chat_id, message_id, prompt, action.clone()).await
            }
            Action::ImageGeneration { .. } => self.run_image(chat_id, message_id, prompt).await,
        };

        match result {
            Ok(()) => {
                self.emitter.complete_run(message_id);
                Ok(())
            }
            Err(e) if is_cancellation(&e) => {
                debug!("generation cancelled; terminating run as completed");
                self.emitter.complete_run(message_id);
                Ok(())
            }
            Err(e) => {
                self.persistor
                    .append_failure_note(message_id, &e.to_string())
                    .await;
                self.emitter.fail_run(message_id, &e.to_string());
                Err(e)
            }
        }
    }

    // ── The iteration controller ─────────────────────────────────────────────

    async fn run_loop(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        prompt: &str,
        action: Action,
    ) -> anyhow::Result<()> {
        let model = self
            .coordinator
            .loaded_model()
            .ok_or(AgentError::ModelNotLoaded)?;
        let request = GenerationRequest {
            message_id,
            chat_id,
            model: model.clone(),
            action,
            prompt: prompt.to_string(),
        };
        let mut state = GenerationState::new(request);
        let mut acc = self.persistor.begin(message_id, model);
        let run_started = Instant::now();

        while !state.is_complete {
            // Steering at the iteration boundary.
            if let Some(request) = self.steering.consume() {
                state = self.apply_steering(request, state).await;
                if state.is_complete {
                    break;
                }
            }

            let iteration = state.iteration_count;
            self.emit_state_update(&state, iteration, false, &[]);

            let params = self.assembler.assemble(&state).await?;
            let input = self.assembler.render(&params)?;
            acc.begin_turn();

            let metrics = match self.stream_turn(&mut acc, input).await {
                Ok(metrics) => metrics,
                Err(e) => {
                    if is_cancellation(&e) || self.steering.should_skip_remaining_tools() {
                        // A stop arrived mid-stream.  Commit what streamed
                        // and finish as completed; consuming the request
                        // guarantees no tool runs after it.
                        self.steering.consume();
                        state = state.mark_complete();
                        break;
                    }
                    return Err(e);
                }
            };

            let output = self.persistor.process_turn(&acc)?;
            state = state.with_stream_complete(output, metrics);

            let mut decision = self.decisions.evaluate(&state);
            // Steering between streaming and tool execution: a pending stop
            // suppresses the batch and is consumed with the turn.
            if matches!(decision, Decision::ExecuteTools(_))
                && self.steering.should_skip_remaining_tools()
            {
                self.steering.consume();
                decision = Decision::Complete;
            }
            self.emitter.emit(AgentEvent::IterationCompleted {
                iteration,
                decision: decision.describe(),
            });

            match decision {
                Decision::Complete => {
                    state = state.mark_complete();
                }
                Decision::ContinueWithNewPrompt(new_prompt) => {
                    let flush = new_prompt == self.config.compaction.flush_prompt;
                    state = state.continue_with_prompt(new_prompt);
                    if flush {
                        state = state.mark_memory_flush_performed();
                    }
                }
                Decision::ExecuteTools(requests) => {
                    let responses = self
                        .execute_tools(&state, iteration, &params, requests)
                        .await;
                    // Must land before the next iteration's stream begins.
                    if let Err(e) = self
                        .persistor
                        .persist_tool_responses(message_id, &responses)
                        .await
                    {
                        warn!(error = %e, "failed to persist tool responses");
                    }
                    state = state.continue_with_tools(responses);
                }
                Decision::Fail(e) => return Err(e.into()),
            }
        }

        // Terminal parse-and-persist runs unconditionally.
        if let Err(e) = self.persistor.finalize(&acc).await {
            warn!(error = %e, "terminal parse-and-persist failed");
        }
        if let Some(usage) = state.last_metrics.as_ref().and_then(|m| m.usage.as_ref()) {
            self.persistor
                .persist_metrics(MetricsRecord {
                    message_id,
                    generated_tokens: usage.generated_tokens,
                    prompt_tokens: usage.prompt_tokens,
                    context_utilization: state.context_utilization,
                    duration_ms: run_started.elapsed().as_millis() as u64,
                })
                .await;
        }
        Ok(())
    }

    /// Stream one turn, piping every chunk through the event feed
    /// (unthrottled) and the persistor (throttled).  Returns the last chunk
    /// metrics seen.
    async fn stream_turn(
        &self,
        acc: &mut StreamAccumulator,
        input: String,
    ) -> anyhow::Result<Option<ChunkMetrics>> {
        let mut stream = self.coordinator.stream(ModelInput::new(input)).await?;
        let mut last_metrics = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.text.is_empty() {
                self.emitter.emit(AgentEvent::TextDelta {
                    text: chunk.text.clone(),
                });
                self.persistor.on_delta(acc, &chunk.text).await;
            }
            if chunk.metrics.is_some() {
                last_metrics = chunk.metrics;
            }
        }
        Ok(last_metrics)
    }

    // ── Tool execution ───────────────────────────────────────────────────────

    async fn execute_tools(
        &self,
        state: &GenerationState,
        iteration: u32,
        params: &BuildParameters,
        requests: Vec<ToolRequest>,
    ) -> Vec<ToolResponse> {
        self.emit_state_update(state, iteration, true, &requests);

        let mut allowed_tool_names: Vec<String> =
            params.configuration.allowed_tools.iter().cloned().collect();
        allowed_tool_names.sort();
        let scope = ToolScope {
            chat_id: state.request.chat_id,
            message_id: state.request.message_id,
            has_tool_policy: params.configuration.has_tool_policy,
            allowed_tool_names,
        };

        for request in &requests {
            self.emitter.emit(AgentEvent::ToolStarted {
                request_id: request.id,
                tool_name: request.name.clone(),
            });
        }

        let Some(tooling) = &self.tooling else {
            let reason = AgentError::ToolingNotConfigured;
            return requests
                .iter()
                .map(|request| {
                    let response =
                        ToolResponse::err(request, format!("Error executing tool: {reason}"));
                    self.emitter.emit(AgentEvent::ToolFailed {
                        request_id: request.id,
                        error: response.result.clone(),
                    });
                    response
                })
                .collect();
        };

        let scoped: Vec<ScopedToolRequest> = requests
            .iter()
            .map(|request| ScopedToolRequest {
                request: request.clone(),
                scope: scope.clone(),
            })
            .collect();

        let started = Instant::now();
        let mut responses = tooling.execute_tools(scoped).await;
        // One measurement for the whole batch; every completion reports it.
        let duration_ms = started.elapsed().as_millis() as u64;

        // An executor that lost a request would leave a ToolStarted without
        // its terminal event; synthesize the missing responses.
        for request in &requests {
            if !responses.iter().any(|r| r.request_id == request.id) {
                warn!(tool = %request.name, "executor returned no response for request");
                responses.push(ToolResponse::err(
                    request,
                    "Error executing tool: no response from executor",
                ));
            }
        }

        let total = responses.len().max(1);
        for (index, response) in responses.iter().enumerate() {
            self.emitter.emit(AgentEvent::ToolProgress {
                request_id: response.request_id,
                fraction: (index + 1) as f32 / total as f32,
                status: response.tool_name.clone(),
            });
            match &response.error {
                Some(error) => self.emitter.emit(AgentEvent::ToolFailed {
                    request_id: response.request_id,
                    error: error.clone(),
                }),
                None => self.emitter.emit(AgentEvent::ToolCompleted {
                    request_id: response.request_id,
                    result: response.result.clone(),
                    duration_ms,
                }),
            }
        }
        responses
    }

    // ── Steering application ─────────────────────────────────────────────────

    async fn apply_steering(
        &self,
        request: SteeringRequest,
        state: GenerationState,
    ) -> GenerationState {
        debug!(mode = ?request.mode, "applying steering request");
        match request.mode {
            SteeringMode::Inactive => state,
            SteeringMode::HardStop => {
                self.coordinator.stop().await;
                state.mark_complete()
            }
            SteeringMode::SoftInterrupt => state.mark_complete(),
            SteeringMode::Redirect(prompt) => {
                let flush = prompt == self.config.compaction.flush_prompt;
                let state = state.continue_with_prompt(prompt);
                if flush {
                    state.mark_memory_flush_performed()
                } else {
                    state
                }
            }
        }
    }

    // ── Image pathway ────────────────────────────────────────────────────────

    /// Image generation bypasses the loop: fetch configuration, drive the
    /// generator stream, persist each frame that carries an image.
    async fn run_image(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        prompt: &str,
    ) -> anyhow::Result<()> {
        let model = self.store.image_model(chat_id).await?;
        let config = self.store.image_configuration(chat_id, prompt).await?;
        debug!(model = %model.name, steps = config.steps, "starting image generation");

        let mut stream = self.coordinator.generate_image(model, config).await?;
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            if let Some(image) = frame.image {
                let record = ImageRecord {
                    message_id,
                    png: image.png,
                    width: image.width,
                    height: image.height,
                    step: frame.step,
                };
                if let Err(e) = self.store.add_image_response(record).await {
                    warn!(error = %e, step = frame.step, "failed to persist image frame");
                }
            }
        }
        Ok(())
    }

    fn emit_state_update(
        &self,
        state: &GenerationState,
        iteration: u32,
        is_executing_tools: bool,
        active: &[ToolRequest],
    ) {
        self.emitter.emit(AgentEvent::StateUpdate {
            iteration,
            is_executing_tools,
            active_tools: active.iter().map(|r| r.display_name.clone()).collect(),
            completed_tool_calls: state.tool_results.len(),
            pending_tool_calls: state.pending_tool_calls.len(),
        });
    }
}
