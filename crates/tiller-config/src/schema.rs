// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub placeholder_image: PlaceholderImageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Remote model session endpoint.  Only consulted when a chat's model
    /// uses the `remote` backend; local backends ignore this section.
    #[serde(default)]
    pub remote: Option<RemoteSessionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Minimum interval between persistent writes of in-progress model
    /// output.  Event emission is never throttled; only database writes are.
    #[serde(default = "default_throttle_interval_ms")]
    pub throttle_interval_ms: u64,
}

fn default_throttle_interval_ms() -> u64 {
    150
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            throttle_interval_ms: default_throttle_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard ceiling on loop turns within one `generate` call.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    10
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Sentinel prompt that redirects the next iteration into a memory
    /// flush.  A `Redirect` steering request carrying exactly this string is
    /// treated as a flush, and the context-pressure handler issues it when
    /// utilization crosses `utilization_threshold`.
    #[serde(default = "default_flush_prompt")]
    pub flush_prompt: String,
    /// Context-window utilization (0.0–1.0) above which a memory flush is
    /// requested, once per generation.
    #[serde(default = "default_utilization_threshold")]
    pub utilization_threshold: f32,
}

fn default_flush_prompt() -> String {
    "Summarize the conversation so far into durable memory, then continue.".to_string()
}

fn default_utilization_threshold() -> f32 {
    0.85
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            flush_prompt: default_flush_prompt(),
            utilization_threshold: default_utilization_threshold(),
        }
    }
}

/// Batch-size ladder keyed on total physical memory.
///
/// `< 8 GiB → small`, `< 16 GiB → medium`, `< 32 GiB → large`,
/// `≥ 32 GiB → large × 2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_small_batch")]
    pub small_batch_size: u32,
    #[serde(default = "default_medium_batch")]
    pub medium_batch_size: u32,
    #[serde(default = "default_large_batch")]
    pub large_batch_size: u32,
}

fn default_small_batch() -> u32 {
    512
}
fn default_medium_batch() -> u32 {
    1024
}
fn default_large_batch() -> u32 {
    2048
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            small_batch_size: default_small_batch(),
            medium_batch_size: default_medium_batch(),
            large_batch_size: default_large_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderImageConfig {
    /// Square edge length in pixels of generated placeholder frames.
    #[serde(default = "default_image_size")]
    pub default_size: u32,
    #[serde(default)]
    pub gradient_start: GradientStart,
    /// Blue component the gradient converges to at the bottom edge.
    #[serde(default = "default_gradient_end_blue")]
    pub gradient_end_blue: u8,
}

fn default_image_size() -> u32 {
    512
}

fn default_gradient_end_blue() -> u8 {
    200
}

impl Default for PlaceholderImageConfig {
    fn default() -> Self {
        Self {
            default_size: default_image_size(),
            gradient_start: GradientStart::default(),
            gradient_end_blue: default_gradient_end_blue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientStart {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Default for GradientStart {
    fn default() -> Self {
        Self { r: 30, g: 30, b: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Target prefix used for the default env-filter directive.
    #[serde(default = "default_subsystem")]
    pub subsystem: String,
    #[serde(default)]
    pub debug: DebugLogConfig,
}

fn default_subsystem() -> String {
    "tiller".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            subsystem: default_subsystem(),
            debug: DebugLogConfig::default(),
        }
    }
}

/// Truncation limits for debug logging of streamed model output.  Chunks can
/// be arbitrarily large; logging them whole would drown the log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugLogConfig {
    #[serde(default = "default_chunk_limit")]
    pub token_chunk_size_limit: usize,
    #[serde(default = "default_preview_length")]
    pub text_preview_length: usize,
}

fn default_chunk_limit() -> usize {
    48
}
fn default_preview_length() -> usize {
    80
}

impl Default for DebugLogConfig {
    fn default() -> Self {
        Self {
            token_chunk_size_limit: default_chunk_limit(),
            text_preview_length: default_preview_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSessionConfig {
    /// Base URL of an OpenAI-compatible completion endpoint,
    /// e.g. `http://localhost:8080/v1`.
    pub base_url: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer `api_key_env` in config files to avoid
    /// secrets in version-controlled files.
    pub api_key: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.streaming.throttle_interval_ms, 150);
        assert_eq!(c.generation.default_max_iterations, 10);
        assert_eq!(c.memory.small_batch_size, 512);
        assert_eq!(c.memory.medium_batch_size, 1024);
        assert_eq!(c.memory.large_batch_size, 2048);
        assert_eq!(c.placeholder_image.default_size, 512);
        assert_eq!(c.logging.subsystem, "tiller");
        assert!(c.remote.is_none());
    }

    #[test]
    fn partial_yaml_fills_missing_sections_with_defaults() {
        let yaml = "generation:\n  default_max_iterations: 3\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.generation.default_max_iterations, 3);
        assert_eq!(c.streaming.throttle_interval_ms, 150);
    }

    #[test]
    fn remote_section_parses() {
        let yaml = "remote:\n  base_url: http://localhost:8080/v1\n  api_key_env: TILLER_KEY\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        let remote = c.remote.expect("remote section");
        assert_eq!(remote.base_url, "http://localhost:8080/v1");
        assert_eq!(remote.api_key_env.as_deref(), Some("TILLER_KEY"));
    }

    #[test]
    fn flush_prompt_is_nonempty_by_default() {
        assert!(!Config::default().compaction.flush_prompt.is_empty());
    }
}
