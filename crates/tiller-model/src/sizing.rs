// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tiller_config::MemoryConfig;

use crate::ModelMetadata;

const GIB: u64 = 1024 * 1024 * 1024;

/// Context tokens to allocate for a model.  Falls back to 2048 when the
/// record carries no metadata, and never returns zero.
pub fn context_size(metadata: Option<&ModelMetadata>) -> u32 {
    metadata
        .and_then(|m| m.context_length)
        .unwrap_or(2048)
        .max(1)
}

/// Preferred prompt-processing batch size for a machine with
/// `total_memory_bytes` of physical RAM.
///
/// `< 8 GiB → small`, `< 16 GiB → medium`, `< 32 GiB → large`,
/// `≥ 32 GiB → large × 2`.
pub fn preferred_batch_size(total_memory_bytes: u64, memory: &MemoryConfig) -> u32 {
    if total_memory_bytes < 8 * GIB {
        memory.small_batch_size
    } else if total_memory_bytes < 16 * GIB {
        memory.medium_batch_size
    } else if total_memory_bytes < 32 * GIB {
        memory.large_batch_size
    } else {
        memory.large_batch_size.saturating_mul(2)
    }
}

/// A batch larger than the context window buys nothing.
pub fn batch_size(preferred: u32, context_size: u32) -> u32 {
    preferred.min(context_size)
}

/// Total physical memory of this machine in bytes.
pub fn total_physical_memory() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_size_defaults_to_2048() {
        assert_eq!(context_size(None), 2048);
        assert_eq!(context_size(Some(&ModelMetadata::default())), 2048);
    }

    #[test]
    fn context_size_never_zero() {
        let meta = ModelMetadata {
            context_length: Some(0),
        };
        assert_eq!(context_size(Some(&meta)), 1);
    }

    #[test]
    fn context_size_uses_metadata() {
        let meta = ModelMetadata {
            context_length: Some(8192),
        };
        assert_eq!(context_size(Some(&meta)), 8192);
    }

    #[test]
    fn batch_tiers_follow_memory_ladder() {
        let mem = MemoryConfig::default();
        assert_eq!(preferred_batch_size(4 * GIB, &mem), 512);
        assert_eq!(preferred_batch_size(8 * GIB, &mem), 1024);
        assert_eq!(preferred_batch_size(12 * GIB, &mem), 1024);
        assert_eq!(preferred_batch_size(16 * GIB, &mem), 2048);
        assert_eq!(preferred_batch_size(31 * GIB, &mem), 2048);
        assert_eq!(preferred_batch_size(32 * GIB, &mem), 4096);
        assert_eq!(preferred_batch_size(128 * GIB, &mem), 4096);
    }

    #[test]
    fn batch_size_clamped_to_context() {
        assert_eq!(batch_size(4096, 1024), 1024);
        assert_eq!(batch_size(512, 8192), 512);
    }
}
