// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod assemble;
mod coordinator;
mod decision;
mod error;
mod events;
mod extract;
mod persist;
mod state;
mod steering;

pub use agent::{Agent, AgentDeps};
pub use assemble::ContextAssembler;
pub use coordinator::{ModelStateCoordinator, SessionRouter};
pub use decision::{
    ContextPressureHandler, Decision, DecisionChain, DecisionHandler, IterationCapHandler,
    ToolCallsHandler,
};
pub use error::AgentError;
pub use events::{AgentEvent, EventEmitter};
pub use extract::extract_final_channel;
pub use persist::{MessagePersistor, StreamAccumulator};
pub use state::{Action, GenerationRequest, GenerationState};
pub use steering::{SteeringCoordinator, SteeringMode, SteeringRequest};
