// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    Chunk, ChunkMetrics, ChunkStream, GenerationMetrics, LlmSession, LoadProgress, ModelInput,
    ProgressStream, SessionConfig, TimingMetrics, UsageMetrics,
};

/// `LlmSession` over an OpenAI-compatible `/v1/completions` endpoint.
///
/// The orchestrator hands sessions a fully rendered prompt string, so the
/// text-completions wire format is used rather than chat completions.  Both
/// the OpenAI response shape (`choices[0].text`) and the llama.cpp native
/// shape (`content` + `timings`) are accepted.
pub struct RemoteSession {
    base_url: String,
    api_key: Option<String>,
    model: std::sync::Mutex<Option<String>>,
    client: reqwest::Client,
    stopped: Arc<AtomicBool>,
}

impl RemoteSession {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            api_key,
            model: std::sync::Mutex::new(None),
            client: reqwest::Client::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/completions", self.base_url)
    }
}

#[async_trait]
impl LlmSession for RemoteSession {
    fn name(&self) -> &str {
        "remote"
    }

    async fn preload(&self, config: SessionConfig) -> anyhow::Result<ProgressStream> {
        // Remote endpoints hold the weights; "loading" is only recording which
        // model name subsequent requests should carry.
        *self.model.lock().unwrap() = Some(config.model.name.clone());
        self.stopped.store(false, Ordering::SeqCst);
        let progress = LoadProgress {
            fraction: 1.0,
            message: Some(format!("remote session ready: {}", config.model.name)),
        };
        Ok(Box::pin(futures::stream::iter([Ok(progress)])))
    }

    async fn stream(&self, input: ModelInput) -> anyhow::Result<ChunkStream> {
        let model = self
            .model
            .lock()
            .unwrap()
            .clone()
            .context("remote session has no model loaded")?;
        self.stopped.store(false, Ordering::SeqCst);

        let mut body = json!({
            "model": model,
            "prompt": input.text,
            "stream": true,
        });
        if let Some(max) = input.max_tokens {
            body["max_tokens"] = json!(max);
        }

        debug!(model = %model, url = %self.completions_url(), "sending completion request");

        let mut http_req = self.client.post(self.completions_url()).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await.context("remote request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("remote endpoint error {status}: {text}");
        }

        let stopped = Arc::clone(&self.stopped);
        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit chunks only for complete lines.
        let chunk_stream = byte_stream
            .scan(String::new(), move |buf, chunk| {
                if stopped.load(Ordering::SeqCst) {
                    return std::future::ready(Some(vec![Err(anyhow::anyhow!(
                        "generation cancelled"
                    ))]));
                }
                let chunks: Vec<anyhow::Result<Chunk>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(chunks))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }

    async fn unload(&self) {
        *self.model.lock().unwrap() = None;
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by the
/// next TCP chunk.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<Chunk>> {
    let mut chunks = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(c) = parse_sse_data_line(&line) {
            chunks.push(c);
        }
    }
    chunks
}

/// Parse a single complete SSE `data:` line into a [`Chunk`].
///
/// Returns `None` for empty lines, comment lines, the `[DONE]` terminator,
/// and unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<Chunk>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

fn parse_sse_chunk(v: &Value) -> Chunk {
    // OpenAI text completions: choices[0].text
    let text = v["choices"][0]["text"]
        .as_str()
        // llama.cpp native /completion: top-level `content`
        .or_else(|| v["content"].as_str())
        .unwrap_or("")
        .to_string();

    let mut metrics: Option<ChunkMetrics> = None;

    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        metrics.get_or_insert_with(Default::default).usage = Some(UsageMetrics {
            generated_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            context_utilization: None,
        });
    }

    // llama.cpp performance metrics (top-level `timings` object).  These
    // arrive in the final SSE chunk and carry generation speed.
    if let Some(timings) = v.get("timings") {
        let m = metrics.get_or_insert_with(Default::default);
        m.timing = Some(TimingMetrics {
            prompt_ms: timings["prompt_ms"].as_f64().unwrap_or(0.0) as u64,
            generation_ms: timings["predicted_ms"].as_f64().unwrap_or(0.0) as u64,
        });
        m.generation = Some(GenerationMetrics {
            tokens_per_second: timings["predicted_per_second"].as_f64(),
            finish_reason: v["choices"][0]["finish_reason"]
                .as_str()
                .map(str::to_string),
        });
        if m.usage.is_none() {
            m.usage = Some(UsageMetrics {
                generated_tokens: timings["predicted_n"].as_u64().unwrap_or(0) as u32,
                prompt_tokens: timings["prompt_n"].as_u64().unwrap_or(0) as u32,
                context_utilization: None,
            });
        }
    }

    Chunk { text, metrics }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
