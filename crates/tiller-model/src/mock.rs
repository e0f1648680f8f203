// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    Chunk, ChunkStream, ImageConfiguration, ImageGenerator, ImageProgress, ImageProgressStream,
    LlmSession, LoadProgress, ModelInput, ProgressStream, SendableModel, SessionConfig,
};

/// A pre-scripted session.  Each call to `stream` pops the next chunk script
/// from the front of the queue, so tests can specify exact multi-turn
/// sequences without a real backend.
pub struct ScriptedSession {
    scripts: Mutex<VecDeque<Vec<Chunk>>>,
    stopped: Arc<AtomicBool>,
    /// The last `ModelInput` seen by this session.  Written on each
    /// `stream()` call so tests can inspect what was sent.
    pub last_input: Mutex<Option<ModelInput>>,
    /// All prompts seen, in call order.
    pub inputs: Mutex<Vec<String>>,
    pub preload_calls: AtomicUsize,
    pub unload_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    preload_error: Option<String>,
}

impl ScriptedSession {
    /// Build a session from an ordered list of per-call chunk scripts.
    pub fn new(scripts: Vec<Vec<Chunk>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            stopped: Arc::new(AtomicBool::new(false)),
            last_input: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
            preload_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            preload_error: None,
        }
    }

    /// Convenience: session whose every turn is a single text chunk.
    pub fn always_text(text: impl Into<String>) -> Self {
        let t = text.into();
        // A generous repeat count so multi-iteration tests never run dry.
        Self::new(vec![vec![Chunk::text(t)]; 16])
    }

    /// Session whose `preload` fails with the given message.
    pub fn failing_preload(msg: impl Into<String>) -> Self {
        let mut s = Self::new(vec![]);
        s.preload_error = Some(msg.into());
        s
    }
}

#[async_trait]
impl LlmSession for ScriptedSession {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn preload(&self, _config: SessionConfig) -> anyhow::Result<ProgressStream> {
        self.preload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = &self.preload_error {
            anyhow::bail!("{msg}");
        }
        self.stopped.store(false, Ordering::SeqCst);
        let frames = [
            Ok(LoadProgress {
                fraction: 0.5,
                message: None,
            }),
            Ok(LoadProgress {
                fraction: 1.0,
                message: None,
            }),
        ];
        Ok(Box::pin(futures::stream::iter(frames)))
    }

    async fn stream(&self, input: ModelInput) -> anyhow::Result<ChunkStream> {
        self.inputs.lock().unwrap().push(input.text.clone());
        *self.last_input.lock().unwrap() = Some(input);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let stopped = Arc::clone(&self.stopped);
        let s = futures::stream::iter(script.into_iter().map(Ok)).map(move |item| {
            if stopped.load(Ordering::SeqCst) {
                Err(anyhow::anyhow!("generation cancelled"))
            } else {
                item
            }
        });
        Ok(Box::pin(s))
    }

    async fn unload(&self) {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// A session whose chunk stream is fed live by the test through a channel.
///
/// Use this when the test must interleave actions (steering, assertions)
/// between chunks.  `stop()` injects a cancellation error into the active
/// stream so an in-flight generation terminates promptly even while the test
/// still holds its sender.
pub struct ChannelSession {
    /// Weak so the channel closes as soon as the test drops its sender.
    current_tx: Mutex<Option<mpsc::WeakSender<anyhow::Result<Chunk>>>>,
    pending_rx: Mutex<VecDeque<mpsc::Receiver<anyhow::Result<Chunk>>>>,
    pub stop_calls: AtomicUsize,
}

impl ChannelSession {
    pub fn new() -> Self {
        Self {
            current_tx: Mutex::new(None),
            pending_rx: Mutex::new(VecDeque::new()),
            stop_calls: AtomicUsize::new(0),
        }
    }

    /// Queue one upcoming `stream()` call and return the sender feeding it.
    pub fn push_stream(&self) -> mpsc::Sender<anyhow::Result<Chunk>> {
        let (tx, rx) = mpsc::channel(64);
        self.pending_rx.lock().unwrap().push_back(rx);
        *self.current_tx.lock().unwrap() = Some(tx.downgrade());
        tx
    }
}

impl Default for ChannelSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmSession for ChannelSession {
    fn name(&self) -> &str {
        "channel-mock"
    }

    async fn preload(&self, _config: SessionConfig) -> anyhow::Result<ProgressStream> {
        let done = [Ok(LoadProgress {
            fraction: 1.0,
            message: None,
        })];
        Ok(Box::pin(futures::stream::iter(done)))
    }

    async fn stream(&self, _input: ModelInput) -> anyhow::Result<ChunkStream> {
        let rx = self
            .pending_rx
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no stream queued on ChannelSession"))?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn unload(&self) {}

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        // Inject cancellation so the in-flight stream ends even though the
        // test still holds a sender clone.
        let weak = self.current_tx.lock().unwrap().take();
        if let Some(tx) = weak.and_then(|w| w.upgrade()) {
            let _ = tx.try_send(Err(anyhow::anyhow!("generation cancelled")));
        }
    }
}

/// Pre-scripted image generator.
pub struct ScriptedImageGenerator {
    frames: Mutex<Vec<ImageProgress>>,
    pub load_calls: AtomicUsize,
    pub unload_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl ScriptedImageGenerator {
    pub fn new(frames: Vec<ImageProgress>) -> Self {
        Self {
            frames: Mutex::new(frames),
            load_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageGenerator for ScriptedImageGenerator {
    async fn load(&self, _model: &SendableModel) -> anyhow::Result<ProgressStream> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let done = [Ok(LoadProgress {
            fraction: 1.0,
            message: None,
        })];
        Ok(Box::pin(futures::stream::iter(done)))
    }

    async fn generate(
        &self,
        _model: &SendableModel,
        _config: ImageConfiguration,
    ) -> anyhow::Result<ImageProgressStream> {
        let frames = std::mem::take(&mut *self.frames.lock().unwrap());
        Ok(Box::pin(futures::stream::iter(frames.into_iter().map(Ok))))
    }

    async fn unload(&self, _model: &SendableModel) {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&self, _model: &SendableModel) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
