// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Placeholder image generation.
//!
//! Stands in for a real diffusion backend: each "step" renders a vertical
//! gradient frame that converges on the configured end color, so consumers
//! exercise the full streamed-progress and persistence pipeline with
//! deterministic output.  Frames are PNG-encoded with the `image` crate.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tiller_config::PlaceholderImageConfig;
use tiller_model::{
    GeneratedImage, ImageConfiguration, ImageGenerator, ImageProgress, ImageProgressStream,
    LoadProgress, ProgressStream, SendableModel,
};

pub use error::ImageError;

mod error;

pub struct PlaceholderImageGenerator {
    config: PlaceholderImageConfig,
    stopped: Arc<AtomicBool>,
}

impl PlaceholderImageGenerator {
    pub fn new(config: PlaceholderImageConfig) -> Self {
        Self {
            config,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn frame_size(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.config.default_size
        } else {
            requested
        }
    }
}

#[async_trait]
impl ImageGenerator for PlaceholderImageGenerator {
    async fn load(&self, model: &SendableModel) -> anyhow::Result<ProgressStream> {
        debug!(model = %model.name, "placeholder image model ready");
        self.stopped.store(false, Ordering::SeqCst);
        let done = [Ok(LoadProgress {
            fraction: 1.0,
            message: None,
        })];
        Ok(Box::pin(futures::stream::iter(done)))
    }

    async fn generate(
        &self,
        _model: &SendableModel,
        config: ImageConfiguration,
    ) -> anyhow::Result<ImageProgressStream> {
        let width = self.frame_size(config.width);
        let height = self.frame_size(config.height);
        let total_steps = config.steps.max(1);
        let start = self.config.gradient_start.clone();
        let end_blue = self.config.gradient_end_blue;
        let stopped = Arc::clone(&self.stopped);

        // Frames are rendered lazily so a stop request between steps takes
        // effect before the next frame is computed.
        let stream = futures::stream::unfold(0u32, move |step| {
            let start = start.clone();
            let stopped = Arc::clone(&stopped);
            async move {
                if step >= total_steps {
                    return None;
                }
                if stopped.load(Ordering::SeqCst) {
                    return Some((
                        Err(ImageError::Cancelled(step).into()),
                        total_steps,
                    ));
                }
                let progress = (step + 1) as f32 / total_steps as f32;
                let frame = render_gradient_frame(
                    width,
                    height,
                    (start.r, start.g, start.b),
                    end_blue,
                    progress,
                );
                let item = frame.map(|png| ImageProgress {
                    step: step + 1,
                    total_steps,
                    image: Some(GeneratedImage { png, width, height }),
                });
                Some((item.map_err(Into::into), step + 1))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn unload(&self, model: &SendableModel) {
        debug!(model = %model.name, "placeholder image model unloaded");
    }

    async fn stop(&self, _model: &SendableModel) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Render one PNG frame: a vertical gradient from the start color toward
/// `(r, g, end_blue)`, scaled by how far the generation has progressed.
fn render_gradient_frame(
    width: u32,
    height: u32,
    start: (u8, u8, u8),
    end_blue: u8,
    progress: f32,
) -> Result<Vec<u8>, ImageError> {
    let (r0, g0, b0) = start;
    let img = image::RgbImage::from_fn(width, height, |_x, y| {
        let t = y as f32 / height.max(1) as f32 * progress;
        let blue = b0 as f32 + (end_blue as f32 - b0 as f32) * t;
        image::Rgb([r0, g0, blue.round().clamp(0.0, 255.0) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
