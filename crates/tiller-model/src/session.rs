// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{
    Chunk, ImageConfiguration, ImageProgress, LoadProgress, ModelInput, SendableModel,
};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<Chunk>> + Send>>;
pub type ProgressStream = Pin<Box<dyn Stream<Item = anyhow::Result<LoadProgress>> + Send>>;
pub type ImageProgressStream = Pin<Box<dyn Stream<Item = anyhow::Result<ImageProgress>> + Send>>;

/// Everything a session needs to materialize one model.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: SendableModel,
    /// Resolved on-disk path for local backends; `None` for remote sessions.
    pub local_path: Option<PathBuf>,
    /// Tokens of context the backend should allocate.
    pub context_size: u32,
    /// Prompt-processing batch size, already clamped to `context_size`.
    pub batch_size: u32,
}

/// Uniform streaming interface over the text-generation backends.
///
/// Sessions are long-lived and shared behind `Arc`; one session instance
/// serves at most one loaded model at a time.  `stop()` must make an
/// in-flight `stream` terminate promptly — sessions signal cancellation by
/// ending the stream or yielding an error the caller classifies as
/// cancellation.
#[async_trait]
pub trait LlmSession: Send + Sync {
    /// Backend name for status display and logs.
    fn name(&self) -> &str;

    /// Materialize the model described by `config`, reporting progress.
    /// The returned stream must be drained; the load is complete when it ends.
    async fn preload(&self, config: SessionConfig) -> anyhow::Result<ProgressStream>;

    /// Stream one generation turn for the rendered prompt.
    async fn stream(&self, input: ModelInput) -> anyhow::Result<ChunkStream>;

    /// Release the loaded model.  No-op when nothing is loaded.
    async fn unload(&self);

    /// Abort the current generation, if any.
    async fn stop(&self);
}

/// Streaming interface over the image-generation backend.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn load(&self, model: &SendableModel) -> anyhow::Result<ProgressStream>;

    async fn generate(
        &self,
        model: &SendableModel,
        config: ImageConfiguration,
    ) -> anyhow::Result<ImageProgressStream>;

    async fn unload(&self, model: &SendableModel);

    /// Cooperative cancel, honoured between diffusion steps.
    async fn stop(&self, model: &SendableModel);
}

/// Resolves a remote repo identifier to a local path, downloading on miss.
#[async_trait]
pub trait ModelDownloader: Send + Sync {
    async fn resolve(&self, repo: &str) -> anyhow::Result<PathBuf>;
}
