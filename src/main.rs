// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use tiller_config::Config;
use tiller_context::{ContextConfiguration, FileWorkspace, HarmonyContextBuilder};
use tiller_core::{Action, Agent, AgentDeps, AgentEvent, SessionRouter, SteeringMode};
use tiller_image::PlaceholderImageGenerator;
use tiller_model::{
    LocationKind, LlmSession, ModelBackend, RemoteSession, SendableModel,
};
use tiller_store::{ChatRecord, MemoryStore};
use tiller_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(tiller_config::load(cli.config.as_deref())?);
    init_logging(cli.verbose, &config.logging.subsystem);

    if let Some(Commands::ShowConfig) = &cli.command {
        println!("{}", serde_yaml::to_string(&*config).unwrap_or_default());
        return Ok(());
    }

    let Some(prompt) = cli.prompt.clone() else {
        anyhow::bail!("no prompt given; run `tiller --help`");
    };

    run_once(&cli, config, &prompt).await
}

async fn run_once(cli: &Cli, config: Arc<Config>, prompt: &str) -> anyhow::Result<()> {
    let endpoint = cli
        .endpoint
        .clone()
        .or_else(|| config.remote.as_ref().map(|r| r.base_url.clone()))
        .context("no endpoint configured; pass --endpoint or set remote.base_url")?;
    let api_key = config.remote.as_ref().and_then(|r| {
        r.api_key
            .clone()
            .or_else(|| r.api_key_env.as_ref().and_then(|v| std::env::var(v).ok()))
    });

    // This single-process build serves every backend kind through the
    // configured endpoint; local MLX/GGUF engines plug in here when linked.
    let remote: Arc<dyn LlmSession> = Arc::new(RemoteSession::new(endpoint, api_key));
    let sessions = SessionRouter {
        gguf: Arc::clone(&remote),
        mlx: Arc::clone(&remote),
        remote: Some(remote),
    };

    let store = Arc::new(MemoryStore::new());
    let chat_id = store.insert_chat(seed_chat(&cli.model));

    let mut registry = ToolRegistry::new();
    registry.register_semantic_search();

    let workspace_root = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let deps = AgentDeps {
        store,
        builder: Arc::new(HarmonyContextBuilder),
        sessions,
        image_generator: Arc::new(PlaceholderImageGenerator::new(
            config.placeholder_image.clone(),
        )),
        tooling: Some(Arc::new(registry)),
        workspace: Some(Arc::new(FileWorkspace::new(workspace_root))),
        downloader: None,
    };
    let agent = Arc::new(Agent::new(config, deps));

    // Print the event feed as it streams.
    let mut events = agent.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(Ok(event)) = events.next().await {
            match event {
                AgentEvent::TextDelta { text } => {
                    print!("{text}");
                    use std::io::Write as _;
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::ToolStarted { tool_name, .. } => {
                    eprintln!("\n[tool] {tool_name} …");
                }
                AgentEvent::ToolCompleted { duration_ms, .. } => {
                    eprintln!("[tool] done in {duration_ms} ms");
                }
                AgentEvent::ToolFailed { error, .. } => {
                    eprintln!("[tool] failed: {error}");
                }
                AgentEvent::GenerationCompleted {
                    total_duration_ms, ..
                } => {
                    eprintln!("\n[done] {total_duration_ms} ms");
                    break;
                }
                AgentEvent::GenerationFailed { error, .. } => {
                    eprintln!("\n[failed] {error}");
                    break;
                }
                _ => {}
            }
        }
    });

    agent.load(chat_id).await?;

    let action = if cli.image {
        Action::ImageGeneration {
            tools: HashSet::new(),
        }
    } else {
        Action::TextGeneration {
            tools: HashSet::from(["semantic_search".to_string()]),
        }
    };

    // Ctrl-C becomes a hard stop so partial output is committed.
    let run = agent.generate(prompt, action);
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[interrupt] stopping generation");
                agent.steer(SteeringMode::HardStop).await;
            }
        }
    };

    let _ = printer.await;
    result
}

fn seed_chat(model_name: &str) -> ChatRecord {
    let model = SendableModel {
        id: uuid::Uuid::new_v4(),
        name: model_name.to_string(),
        backend: ModelBackend::Remote,
        location: String::new(),
        location_kind: LocationKind::RemoteRepo,
        location_local: None,
        location_bookmark: None,
        metadata: None,
    };
    let context = ContextConfiguration {
        system_instruction: "You are tiller, a concise on-device assistant.".to_string(),
        ..Default::default()
    };
    let mut chat = ChatRecord::new(model.clone(), context);
    chat.image_model = Some(model);
    chat
}

fn init_logging(verbose: bool, subsystem: &str) {
    if !verbose && std::env::var_os("TILLER_LOG").is_none() {
        return;
    }
    let default_directive = if verbose {
        format!("{subsystem}=debug,tiller_core=debug,tiller_model=debug")
    } else {
        format!("{subsystem}=info")
    };
    let filter =
        EnvFilter::try_from_env("TILLER_LOG").unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
