// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/tiller/config.yaml"));
    paths.push(PathBuf::from("/etc/tiller/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/tiller/config.yaml"));
        paths.push(home.join(".config/tiller/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("tiller/config.yaml"));
        paths.push(cfg.join("tiller/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".tiller/config.yaml"));
    paths.push(PathBuf::from(".tiller/config.yml"));
    paths.push(PathBuf::from("tiller.yaml"));
    paths.push(PathBuf::from("tiller.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(p)?);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn explicit_path_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "streaming:\n  throttle_interval_ms: 50").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.streaming.throttle_interval_ms, 50);
        // Untouched sections keep defaults.
        assert_eq!(cfg.generation.default_max_iterations, 10);
    }

    #[test]
    fn missing_files_yield_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.streaming.throttle_interval_ms, 150);
    }

    #[test]
    fn merge_replaces_scalars_and_unions_maps() {
        let mut base: serde_yaml::Value =
            serde_yaml::from_str("a: 1\nnested:\n  x: 1\n").unwrap();
        let layer: serde_yaml::Value =
            serde_yaml::from_str("a: 2\nnested:\n  y: 3\n").unwrap();
        merge_yaml(&mut base, layer);
        assert_eq!(base["a"], serde_yaml::Value::from(2));
        assert_eq!(base["nested"]["x"], serde_yaml::Value::from(1));
        assert_eq!(base["nested"]["y"], serde_yaml::Value::from(3));
    }
}
