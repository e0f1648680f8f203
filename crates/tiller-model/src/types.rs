// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Model descriptors ───────────────────────────────────────────────────────

/// Inference backend a model record is bound to.
///
/// `CoreMl` models are served through the same session as `Mlx` (both run on
/// the Apple compute stack); the distinction is kept on the record because the
/// downloader and the UI treat them differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    Mlx,
    Gguf,
    CoreMl,
    Remote,
}

/// Where `SendableModel::location` points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    /// A file on this machine, possibly user-chosen (see `location_bookmark`).
    LocalFile,
    /// A remote repo identifier to be resolved by the model downloader.
    RemoteRepo,
}

/// A chat's model record as handed out by the store.
///
/// "Sendable" because the record crosses actor boundaries by value; it never
/// references live backend state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendableModel {
    pub id: Uuid,
    pub name: String,
    pub backend: ModelBackend,
    /// Repo identifier or display path, depending on `location_kind`.
    pub location: String,
    pub location_kind: LocationKind,
    /// Resolved local path, when the model has already been materialized.
    pub location_local: Option<PathBuf>,
    /// Opaque security-scoped bookmark bytes for user-chosen file locations.
    /// Present only for `LocationKind::LocalFile` records the user picked
    /// through a file dialog; preferred over `location_local` when resolving.
    pub location_bookmark: Option<Vec<u8>>,
    pub metadata: Option<ModelMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Trained context length in tokens, when known.
    pub context_length: Option<u32>,
}

// ─── Streaming chunk types ───────────────────────────────────────────────────

/// Rendered prompt handed to a session for one generation turn.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub text: String,
    pub max_tokens: Option<u32>,
}

impl ModelInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            max_tokens: None,
        }
    }
}

/// One streamed fragment of model output.  `metrics` typically arrives on the
/// final chunk only, but sessions are free to attach it to any chunk; the
/// consumer keeps the last one seen.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub text: String,
    pub metrics: Option<ChunkMetrics>,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetrics {
    pub timing: Option<TimingMetrics>,
    pub usage: Option<UsageMetrics>,
    pub generation: Option<GenerationMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingMetrics {
    pub prompt_ms: u64,
    pub generation_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub generated_tokens: u32,
    pub prompt_tokens: u32,
    /// Fraction of the model's context window occupied after this turn.
    pub context_utilization: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub tokens_per_second: Option<f64>,
    pub finish_reason: Option<String>,
}

/// Progress report emitted while a backend materializes a model.
#[derive(Debug, Clone)]
pub struct LoadProgress {
    /// Completion fraction in `[0, 1]`.
    pub fraction: f32,
    pub message: Option<String>,
}

// ─── Image generation types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfiguration {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub seed: Option<u64>,
}

/// One diffusion step report.  `image` is populated only on steps that
/// rendered an intermediate (or final) frame; steps without a frame still
/// advance the progress display.
#[derive(Debug, Clone)]
pub struct ImageProgress {
    pub step: u32,
    pub total_steps: u32,
    pub image: Option<GeneratedImage>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    /// PNG-encoded frame.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_serde_round_trip() {
        for b in [
            ModelBackend::Mlx,
            ModelBackend::Gguf,
            ModelBackend::CoreMl,
            ModelBackend::Remote,
        ] {
            let s = serde_json::to_string(&b).unwrap();
            let back: ModelBackend = serde_json::from_str(&s).unwrap();
            assert_eq!(b, back);
        }
    }

    #[test]
    fn chunk_text_constructor_has_no_metrics() {
        let c = Chunk::text("hi");
        assert_eq!(c.text, "hi");
        assert!(c.metrics.is_none());
    }
}
