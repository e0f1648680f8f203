// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use tiller_config::MemoryConfig;
use tiller_model::{
    batch_size, context_size, preferred_batch_size, total_physical_memory, Chunk, ChunkStream,
    ImageConfiguration, ImageGenerator, ImageProgressStream, LlmSession, LocationKind,
    ModelBackend, ModelDownloader, ModelInput, RuntimeState, RuntimeTransition, SendableModel,
    SessionConfig,
};
use tiller_store::Store;

use crate::AgentError;

/// Routes a model record to the session that can serve it.
pub struct SessionRouter {
    pub gguf: Arc<dyn LlmSession>,
    /// Serves both `mlx` and `coreml` records.
    pub mlx: Arc<dyn LlmSession>,
    pub remote: Option<Arc<dyn LlmSession>>,
}

impl SessionRouter {
    fn route(&self, backend: ModelBackend) -> Result<Arc<dyn LlmSession>, AgentError> {
        match backend {
            ModelBackend::Gguf => Ok(Arc::clone(&self.gguf)),
            ModelBackend::Mlx | ModelBackend::CoreMl => Ok(Arc::clone(&self.mlx)),
            ModelBackend::Remote => self
                .remote
                .clone()
                .ok_or(AgentError::RemoteSessionNotConfigured),
        }
    }
}

/// Security-scoped access to a user-chosen model file.  Held for as long as
/// the model is loaded; the platform grant is released on drop.
struct ScopedAccess {
    path: PathBuf,
}

impl ScopedAccess {
    /// Bookmark bytes are an opaque UTF-8 path token on this platform.
    fn resolve(bookmark: &[u8]) -> Result<(PathBuf, ScopedAccess), AgentError> {
        let path = std::str::from_utf8(bookmark)
            .map_err(|_| AgentError::ModelLocationNotResolved)?
            .trim();
        if path.is_empty() {
            return Err(AgentError::ModelLocationNotResolved);
        }
        let path = PathBuf::from(path);
        debug!(path = %path.display(), "acquired security-scoped access");
        Ok((path.clone(), ScopedAccess { path }))
    }
}

impl Drop for ScopedAccess {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "released security-scoped access");
    }
}

struct LoadedModel {
    model: SendableModel,
    session: Arc<dyn LlmSession>,
    _scoped: Option<ScopedAccess>,
}

/// State shared with the detached tasks that outlive a method call (stream
/// forwarding, teardown).
struct Shared {
    state: Mutex<RuntimeState>,
    store: Arc<dyn Store>,
    active_image: Mutex<Option<SendableModel>>,
}

impl Shared {
    /// Apply a transition in memory, then record it durably best-effort.
    /// Invalid transitions reject before any side effect.
    async fn transition(
        &self,
        model_id: Uuid,
        transition: RuntimeTransition,
    ) -> Result<(), tiller_model::TransitionError> {
        {
            let mut state = self.state.lock().unwrap();
            *state = state.apply(transition)?;
        }
        if let Err(e) = self.store.transition_runtime_state(model_id, transition).await {
            warn!(error = %e, ?transition, "failed to record runtime transition");
        }
        Ok(())
    }
}

/// Exclusive owner of at most one loaded model across text and image
/// generation.  Switching kinds always unloads first.
pub struct ModelStateCoordinator {
    shared: Arc<Shared>,
    sessions: SessionRouter,
    image_generator: Arc<dyn ImageGenerator>,
    downloader: Option<Arc<dyn ModelDownloader>>,
    memory_config: MemoryConfig,
    loaded: Mutex<Option<LoadedModel>>,
}

impl ModelStateCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: SessionRouter,
        image_generator: Arc<dyn ImageGenerator>,
        downloader: Option<Arc<dyn ModelDownloader>>,
        memory_config: MemoryConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RuntimeState::NotLoaded),
                store,
                active_image: Mutex::new(None),
            }),
            sessions,
            image_generator,
            downloader,
            memory_config,
            loaded: Mutex::new(None),
        }
    }

    pub fn runtime_state(&self) -> RuntimeState {
        *self.shared.state.lock().unwrap()
    }

    pub fn loaded_model(&self) -> Option<SendableModel> {
        self.loaded.lock().unwrap().as_ref().map(|l| l.model.clone())
    }

    /// Load the chat's current language model, replacing any different one.
    pub async fn load(&self, chat_id: Uuid) -> anyhow::Result<()> {
        let model = self.shared.store.language_model(chat_id).await?;

        let already_loaded = self
            .loaded
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|l| l.model.id == model.id);
        if already_loaded && self.runtime_state() == RuntimeState::Loaded {
            debug!(model = %model.name, "model already loaded");
            return Ok(());
        }

        self.unload().await?;
        self.shared
            .transition(model.id, RuntimeTransition::Load)
            .await?;

        match self.preload(&model).await {
            Ok(loaded) => {
                *self.loaded.lock().unwrap() = Some(loaded);
                self.shared
                    .transition(model.id, RuntimeTransition::CompleteLoad)
                    .await?;
                Ok(())
            }
            Err(e) => {
                if let Err(te) = self
                    .shared
                    .transition(model.id, RuntimeTransition::FailLoad)
                    .await
                {
                    warn!(error = %te, "fail-load transition rejected");
                }
                // A stale local binding is useless; drop it so the next load
                // re-resolves from scratch.
                if matches!(
                    e.downcast_ref::<AgentError>(),
                    Some(AgentError::ModelFileMissing(_))
                ) {
                    if let Err(de) = self.shared.store.delete_model_location(model.id).await {
                        warn!(error = %de, "failed to delete stale model location");
                    }
                }
                Err(e)
            }
        }
    }

    async fn preload(&self, model: &SendableModel) -> anyhow::Result<LoadedModel> {
        let session = self.sessions.route(model.backend)?;
        let (local_path, scoped) = self.resolve_location(model).await?;

        let context_size = context_size(model.metadata.as_ref());
        let preferred = preferred_batch_size(total_physical_memory(), &self.memory_config);
        let batch_size = batch_size(preferred, context_size);
        debug!(
            model = %model.name,
            backend = session.name(),
            context_size,
            batch_size,
            "preloading model"
        );

        let config = SessionConfig {
            model: model.clone(),
            local_path,
            context_size,
            batch_size,
        };
        let mut progress = session.preload(config).await?;
        while let Some(p) = progress.next().await {
            let p = p?;
            debug!(fraction = p.fraction, "model load progress");
        }

        Ok(LoadedModel {
            model: model.clone(),
            session,
            _scoped: scoped,
        })
    }

    /// Resolve the on-disk path for a local model, acquiring scoped access
    /// when the record carries a bookmark.  Remote backends need no path.
    async fn resolve_location(
        &self,
        model: &SendableModel,
    ) -> anyhow::Result<(Option<PathBuf>, Option<ScopedAccess>)> {
        if model.backend == ModelBackend::Remote {
            return Ok((None, None));
        }
        match model.location_kind {
            LocationKind::LocalFile => {
                if let Some(bookmark) = &model.location_bookmark {
                    let (path, scoped) = ScopedAccess::resolve(bookmark)?;
                    if !path.is_file() {
                        // `scoped` drops here: access acquired for a failed
                        // load is released immediately.
                        return Err(AgentError::ModelFileMissing(path).into());
                    }
                    Ok((Some(path), Some(scoped)))
                } else {
                    let path = match model.location_local.clone() {
                        Some(path) => path,
                        // The display location doubles as the path for
                        // records created before resolution; `file://` URLs
                        // are accepted, any other scheme is not a file.
                        None => {
                            let location = model.location.as_str();
                            if let Some(stripped) = location.strip_prefix("file://") {
                                PathBuf::from(stripped)
                            } else if location.contains("://") {
                                return Err(
                                    AgentError::InvalidModelLocation(location.to_string()).into()
                                );
                            } else {
                                PathBuf::from(location)
                            }
                        }
                    };
                    if path.as_os_str().is_empty() {
                        return Err(AgentError::EmptyModelLocation.into());
                    }
                    if !path.is_file() {
                        return Err(AgentError::ModelFileMissing(path).into());
                    }
                    Ok((Some(path), None))
                }
            }
            LocationKind::RemoteRepo => {
                if let Some(local) = &model.location_local {
                    if local.is_file() {
                        return Ok((Some(local.clone()), None));
                    }
                }
                if model.location.is_empty() {
                    return Err(AgentError::EmptyModelLocation.into());
                }
                match &self.downloader {
                    Some(downloader) => {
                        let path = downloader.resolve(&model.location).await?;
                        if !path.is_file() {
                            return Err(AgentError::ModelLocationNotResolved.into());
                        }
                        Ok((Some(path), None))
                    }
                    None => Err(AgentError::ModelNotDownloaded.into()),
                }
            }
        }
    }

    /// Release the loaded model.  No-op when idle.
    pub async fn unload(&self) -> anyhow::Result<()> {
        let loaded = self.loaded.lock().unwrap().take();
        let Some(loaded) = loaded else {
            return Ok(());
        };
        loaded.session.unload().await;
        if let Err(e) = self
            .shared
            .transition(loaded.model.id, RuntimeTransition::Unload)
            .await
        {
            warn!(error = %e, "unload transition rejected; resetting");
            let _ = self
                .shared
                .transition(loaded.model.id, RuntimeTransition::Reset)
                .await;
        }
        Ok(())
    }

    /// Stream one generation turn from the loaded model.
    ///
    /// Transitions `Loaded → Generating` up front.  A detached forwarder
    /// records `stopGeneration` when the backend stream finishes (normally,
    /// with an error, or because the consumer went away) and only then closes
    /// the outbound stream, so a drained consumer observes the `Loaded`
    /// state again.
    pub async fn stream(&self, input: ModelInput) -> anyhow::Result<ChunkStream> {
        let (session, model_id) = {
            let guard = self.loaded.lock().unwrap();
            let loaded = guard.as_ref().ok_or(AgentError::ModelNotLoaded)?;
            (Arc::clone(&loaded.session), loaded.model.id)
        };
        self.shared
            .transition(model_id, RuntimeTransition::StartGeneration)
            .await?;

        let inner = match session.stream(input).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self
                    .shared
                    .transition(model_id, RuntimeTransition::StopGeneration)
                    .await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel::<anyhow::Result<Chunk>>(32);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut inner = inner;
            while let Some(item) = inner.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            if let Err(e) = shared
                .transition(model_id, RuntimeTransition::StopGeneration)
                .await
            {
                warn!(error = %e, "stop transition after stream end rejected");
            }
            drop(tx);
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Abort the in-flight generation, if any.  The stream forwarder records
    /// the `stopGeneration` transition once the backend winds down.
    pub async fn stop(&self) {
        let session = self
            .loaded
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| Arc::clone(&l.session));
        if let Some(session) = session {
            session.stop().await;
        }
        let image = self.shared.active_image.lock().unwrap().clone();
        if let Some(model) = image {
            self.image_generator.stop(&model).await;
        }
    }

    /// One-shot image generation: unload any current model, load the image
    /// model, stream progress, unload again when the stream ends.
    pub async fn generate_image(
        &self,
        model: SendableModel,
        config: ImageConfiguration,
    ) -> anyhow::Result<ImageProgressStream> {
        self.unload().await?;
        self.shared
            .transition(model.id, RuntimeTransition::Load)
            .await?;

        let mut load = match self.image_generator.load(&model).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self
                    .shared
                    .transition(model.id, RuntimeTransition::FailLoad)
                    .await;
                return Err(e);
            }
        };
        while let Some(p) = load.next().await {
            match p {
                Ok(p) => debug!(fraction = p.fraction, "image model load progress"),
                Err(e) => {
                    let _ = self
                        .shared
                        .transition(model.id, RuntimeTransition::FailLoad)
                        .await;
                    return Err(e);
                }
            }
        }
        self.shared
            .transition(model.id, RuntimeTransition::CompleteLoad)
            .await?;
        *self.shared.active_image.lock().unwrap() = Some(model.clone());

        let inner = self.image_generator.generate(&model, config).await?;
        self.shared
            .transition(model.id, RuntimeTransition::StartGeneration)
            .await?;

        let (tx, rx) = mpsc::channel(32);
        let shared = Arc::clone(&self.shared);
        let generator = Arc::clone(&self.image_generator);
        tokio::spawn(async move {
            let mut inner = inner;
            while let Some(item) = inner.next().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            let _ = shared
                .transition(model.id, RuntimeTransition::StopGeneration)
                .await;
            generator.unload(&model).await;
            let _ = shared
                .transition(model.id, RuntimeTransition::Unload)
                .await;
            *shared.active_image.lock().unwrap() = None;
            drop(tx);
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Explicit teardown: best-effort stop and unload.
    pub async fn close(&self) {
        self.stop().await;
        if let Err(e) = self.unload().await {
            warn!(error = %e, "unload during close failed");
        }
    }
}

impl Drop for ModelStateCoordinator {
    /// Cleanup must not rely on the destructor being async: schedule a
    /// detached best-effort teardown when a runtime is available.
    fn drop(&mut self) {
        let loaded = self.loaded.lock().unwrap().take();
        let Some(loaded) = loaded else { return };
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    loaded.session.stop().await;
                    loaded.session.unload().await;
                    let _ = shared
                        .transition(loaded.model.id, RuntimeTransition::Unload)
                        .await;
                });
            }
            Err(_) => warn!("coordinator dropped outside a runtime; skipping model teardown"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tiller_context::ContextConfiguration;
    use tiller_model::{ScriptedImageGenerator, ScriptedSession};
    use tiller_store::{ChatRecord, MemoryStore};

    fn model_with_file(file: &tempfile::NamedTempFile) -> SendableModel {
        SendableModel {
            id: Uuid::new_v4(),
            name: "test-model".into(),
            backend: ModelBackend::Gguf,
            location: file.path().display().to_string(),
            location_kind: LocationKind::LocalFile,
            location_local: Some(file.path().to_path_buf()),
            location_bookmark: None,
            metadata: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        session: Arc<ScriptedSession>,
        coordinator: ModelStateCoordinator,
        chat_id: Uuid,
        _file: tempfile::NamedTempFile,
    }

    fn fixture_with(session: ScriptedSession) -> Fixture {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"gguf").unwrap();
        let model = model_with_file(&file);
        let store = Arc::new(MemoryStore::new());
        let chat_id = store.insert_chat(ChatRecord::new(model, ContextConfiguration::default()));
        let session = Arc::new(session);
        let sessions = SessionRouter {
            gguf: session.clone(),
            mlx: Arc::new(ScriptedSession::new(vec![])),
            remote: None,
        };
        let coordinator = ModelStateCoordinator::new(
            store.clone(),
            sessions,
            Arc::new(ScriptedImageGenerator::new(vec![])),
            None,
            MemoryConfig::default(),
        );
        Fixture {
            store,
            session,
            coordinator,
            chat_id,
            _file: file,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedSession::always_text("ok"))
    }

    #[tokio::test]
    async fn load_transitions_through_loading_to_loaded() {
        let f = fixture();
        f.coordinator.load(f.chat_id).await.unwrap();
        assert_eq!(f.coordinator.runtime_state(), RuntimeState::Loaded);
        let transitions: Vec<_> = f.store.transitions().into_iter().map(|(_, t)| t).collect();
        assert_eq!(
            transitions,
            vec![RuntimeTransition::Load, RuntimeTransition::CompleteLoad]
        );
        assert_eq!(
            f.session.preload_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn reloading_same_model_is_a_noop() {
        let f = fixture();
        f.coordinator.load(f.chat_id).await.unwrap();
        f.coordinator.load(f.chat_id).await.unwrap();
        assert_eq!(
            f.session.preload_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn missing_file_fails_load_and_deletes_location() {
        let f = fixture();
        // Invalidate the stored path.
        let stale = {
            let mut m = f.store.language_model(f.chat_id).await.unwrap();
            m.location_local = Some(PathBuf::from("/nonexistent/model.gguf"));
            m
        };
        let store2 = Arc::new(MemoryStore::new());
        let chat2 = store2.insert_chat(ChatRecord::new(stale, ContextConfiguration::default()));
        let coordinator = ModelStateCoordinator::new(
            store2.clone(),
            SessionRouter {
                gguf: f.session.clone(),
                mlx: Arc::new(ScriptedSession::new(vec![])),
                remote: None,
            },
            Arc::new(ScriptedImageGenerator::new(vec![])),
            None,
            MemoryConfig::default(),
        );

        let err = coordinator.load(chat2).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::ModelFileMissing(_))
        ));
        assert_eq!(coordinator.runtime_state(), RuntimeState::Error);
        assert_eq!(store2.deleted_locations().len(), 1);
        let transitions: Vec<_> = store2.transitions().into_iter().map(|(_, t)| t).collect();
        assert_eq!(
            transitions,
            vec![RuntimeTransition::Load, RuntimeTransition::FailLoad]
        );
    }

    #[tokio::test]
    async fn stream_without_load_is_model_not_loaded() {
        let f = fixture();
        let err = match f.coordinator.stream(ModelInput::new("hi")).await {
            Err(e) => e,
            Ok(_) => panic!("expected stream() to fail when model is not loaded"),
        };
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::ModelNotLoaded)
        ));
    }

    #[tokio::test]
    async fn stream_records_start_and_stop_generation() {
        let f = fixture();
        f.coordinator.load(f.chat_id).await.unwrap();
        let mut stream = f.coordinator.stream(ModelInput::new("hi")).await.unwrap();
        assert_eq!(f.coordinator.runtime_state(), RuntimeState::Generating);
        while stream.next().await.is_some() {}
        // The forwarder records stopGeneration before closing the stream.
        assert_eq!(f.coordinator.runtime_state(), RuntimeState::Loaded);
        let transitions: Vec<_> = f.store.transitions().into_iter().map(|(_, t)| t).collect();
        assert!(transitions.ends_with(&[
            RuntimeTransition::StartGeneration,
            RuntimeTransition::StopGeneration
        ]));
    }

    #[tokio::test]
    async fn remote_backend_without_session_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        let mut model = model_with_file(&file);
        model.backend = ModelBackend::Remote;
        let store = Arc::new(MemoryStore::new());
        let chat_id = store.insert_chat(ChatRecord::new(model, ContextConfiguration::default()));
        let coordinator = ModelStateCoordinator::new(
            store,
            SessionRouter {
                gguf: Arc::new(ScriptedSession::new(vec![])),
                mlx: Arc::new(ScriptedSession::new(vec![])),
                remote: None,
            },
            Arc::new(ScriptedImageGenerator::new(vec![])),
            None,
            MemoryConfig::default(),
        );
        let err = coordinator.load(chat_id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::RemoteSessionNotConfigured)
        ));
    }

    #[tokio::test]
    async fn bookmark_resolution_verifies_existence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        let mut model = model_with_file(&file);
        model.location_bookmark = Some(file.path().display().to_string().into_bytes());
        model.location_local = None;
        let store = Arc::new(MemoryStore::new());
        let chat_id = store.insert_chat(ChatRecord::new(model, ContextConfiguration::default()));
        let coordinator = ModelStateCoordinator::new(
            store,
            SessionRouter {
                gguf: Arc::new(ScriptedSession::always_text("ok")),
                mlx: Arc::new(ScriptedSession::new(vec![])),
                remote: None,
            },
            Arc::new(ScriptedImageGenerator::new(vec![])),
            None,
            MemoryConfig::default(),
        );
        coordinator.load(chat_id).await.unwrap();
        assert_eq!(coordinator.runtime_state(), RuntimeState::Loaded);
    }

    #[tokio::test]
    async fn non_file_url_location_is_invalid() {
        let model = SendableModel {
            id: Uuid::new_v4(),
            name: "odd".into(),
            backend: ModelBackend::Gguf,
            location: "https://example.com/model.gguf".into(),
            location_kind: LocationKind::LocalFile,
            location_local: None,
            location_bookmark: None,
            metadata: None,
        };
        let store = Arc::new(MemoryStore::new());
        let chat_id = store.insert_chat(ChatRecord::new(model, ContextConfiguration::default()));
        let coordinator = ModelStateCoordinator::new(
            store,
            SessionRouter {
                gguf: Arc::new(ScriptedSession::new(vec![])),
                mlx: Arc::new(ScriptedSession::new(vec![])),
                remote: None,
            },
            Arc::new(ScriptedImageGenerator::new(vec![])),
            None,
            MemoryConfig::default(),
        );
        let err = coordinator.load(chat_id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::InvalidModelLocation(_))
        ));
    }

    #[tokio::test]
    async fn unload_when_idle_is_a_noop() {
        let f = fixture();
        f.coordinator.unload().await.unwrap();
        assert_eq!(f.coordinator.runtime_state(), RuntimeState::NotLoaded);
        assert!(f.store.transitions().is_empty());
    }

    #[tokio::test]
    async fn remote_repo_without_downloader_is_not_downloaded() {
        let model = SendableModel {
            id: Uuid::new_v4(),
            name: "repo-model".into(),
            backend: ModelBackend::Gguf,
            location: "org/repo".into(),
            location_kind: LocationKind::RemoteRepo,
            location_local: None,
            location_bookmark: None,
            metadata: None,
        };
        let store = Arc::new(MemoryStore::new());
        let chat_id = store.insert_chat(ChatRecord::new(model, ContextConfiguration::default()));
        let coordinator = ModelStateCoordinator::new(
            store,
            SessionRouter {
                gguf: Arc::new(ScriptedSession::new(vec![])),
                mlx: Arc::new(ScriptedSession::new(vec![])),
                remote: None,
            },
            Arc::new(ScriptedImageGenerator::new(vec![])),
            None,
            MemoryConfig::default(),
        );
        let err = coordinator.load(chat_id).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::ModelNotDownloaded)
        ));
    }
}
