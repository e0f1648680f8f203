// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod mock;
mod remote;
mod session;
mod sizing;
mod state;
mod types;

pub use mock::{ChannelSession, ScriptedImageGenerator, ScriptedSession};
pub use remote::RemoteSession;
pub use session::{
    ChunkStream, ImageGenerator, ImageProgressStream, LlmSession, ModelDownloader, ProgressStream,
    SessionConfig,
};
pub use sizing::{batch_size, context_size, preferred_batch_size, total_physical_memory};
pub use state::{RuntimeState, RuntimeTransition, TransitionError};
pub use types::{
    Chunk, ChunkMetrics, GeneratedImage, GenerationMetrics, ImageConfiguration, ImageProgress,
    LoadProgress, LocationKind, ModelBackend, ModelInput, ModelMetadata, SendableModel,
    TimingMetrics, UsageMetrics,
};
