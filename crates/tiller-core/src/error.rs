// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use thiserror::Error;

use tiller_model::TransitionError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("context limit exceeded and memory already flushed")]
    ContextLimitExceeded,

    #[error("model record has an empty location")]
    EmptyModelLocation,

    #[error("model location is not a usable path or URL: {0}")]
    InvalidModelLocation(String),

    #[error("model file missing at {}", .0.display())]
    ModelFileMissing(PathBuf),

    #[error("model location could not be resolved")]
    ModelLocationNotResolved,

    #[error("model is not downloaded and no downloader is configured")]
    ModelNotDownloaded,

    #[error("no model is loaded")]
    ModelNotLoaded,

    #[error("no chat loaded; call load() before generate()")]
    NoChatLoaded,

    #[error("model uses the remote backend but no remote session is configured")]
    RemoteSessionNotConfigured,

    #[error("tool execution requested but no tool executor is configured")]
    ToolingNotConfigured,

    // Surfaced verbatim in the message's failure note.
    #[error("Maximum iterations reached.")]
    TooManyIterations(u32),

    #[error(transparent)]
    InvalidStateTransition(#[from] TransitionError),

    #[error("generation cancelled")]
    Cancelled,
}

/// Cooperative cancellation is not a user-visible failure: a hard stop makes
/// the backend abort its stream, and that abort must terminate the run as
/// *completed*.  Backends signal it either with [`AgentError::Cancelled`] or
/// with an error message containing "cancelled".
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    if matches!(err.downcast_ref::<AgentError>(), Some(AgentError::Cancelled)) {
        return true;
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("cancelled") || msg.contains("canceled")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
