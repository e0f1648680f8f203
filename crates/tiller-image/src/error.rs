// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("could not encode frame: {0}")]
    Encode(String),

    #[error("image generation cancelled at step {0}")]
    Cancelled(u32),
}
