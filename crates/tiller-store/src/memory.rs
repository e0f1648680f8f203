// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use tiller_context::{Channel, ChannelKind, ContextConfiguration, ProcessedOutput};
use tiller_model::{ImageConfiguration, RuntimeTransition, SendableModel};
use tiller_tools::ToolResponse;

use crate::{ChatRecord, ImageRecord, MessageRecord, MetricsRecord, Store, StoreError};

/// In-memory [`Store`] used by the binary's single-process mode and the test
/// suite.  All state lives behind one mutex; commands are short and never
/// await while holding it.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// When set, streaming-path writes fail.  Lets tests exercise the
    /// log-and-continue policy of the persistence pipeline.
    fail_streaming_writes: AtomicBool,
}

#[derive(Default)]
struct Inner {
    chats: HashMap<Uuid, ChatRecord>,
    messages: HashMap<Uuid, MessageRecord>,
    transitions: Vec<(Uuid, RuntimeTransition)>,
    metrics: Vec<MetricsRecord>,
    images: Vec<ImageRecord>,
    deleted_locations: Vec<Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_chat(&self, chat: ChatRecord) -> Uuid {
        let id = chat.id;
        self.inner.lock().unwrap().chats.insert(id, chat);
        id
    }

    pub fn set_fail_streaming_writes(&self, fail: bool) {
        self.fail_streaming_writes.store(fail, Ordering::SeqCst);
    }

    // ── Test/CLI accessors ───────────────────────────────────────────────────

    pub fn message(&self, message_id: Uuid) -> Option<MessageRecord> {
        self.inner.lock().unwrap().messages.get(&message_id).cloned()
    }

    pub fn transitions(&self) -> Vec<(Uuid, RuntimeTransition)> {
        self.inner.lock().unwrap().transitions.clone()
    }

    pub fn metrics(&self) -> Vec<MetricsRecord> {
        self.inner.lock().unwrap().metrics.clone()
    }

    pub fn images(&self) -> Vec<ImageRecord> {
        self.inner.lock().unwrap().images.clone()
    }

    pub fn deleted_locations(&self) -> Vec<Uuid> {
        self.inner.lock().unwrap().deleted_locations.clone()
    }

    fn chat<T>(
        &self,
        chat_id: Uuid,
        f: impl FnOnce(&ChatRecord) -> T,
    ) -> anyhow::Result<T> {
        let inner = self.inner.lock().unwrap();
        let chat = inner
            .chats
            .get(&chat_id)
            .ok_or(StoreError::ChatNotFound(chat_id))?;
        Ok(f(chat))
    }

    fn message_mut<T>(
        &self,
        message_id: Uuid,
        f: impl FnOnce(&mut MessageRecord) -> T,
    ) -> anyhow::Result<T> {
        let mut inner = self.inner.lock().unwrap();
        let msg = inner
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        Ok(f(msg))
    }

    fn check_streaming_write(&self) -> anyhow::Result<()> {
        if self.fail_streaming_writes.load(Ordering::SeqCst) {
            anyhow::bail!("injected streaming write failure");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn language_model(&self, chat_id: Uuid) -> anyhow::Result<SendableModel> {
        self.chat(chat_id, |c| c.language_model.clone())
    }

    async fn image_model(&self, chat_id: Uuid) -> anyhow::Result<SendableModel> {
        self.chat(chat_id, |c| c.image_model.clone())?
            .ok_or_else(|| StoreError::NoImageModel(chat_id).into())
    }

    async fn image_configuration(
        &self,
        chat_id: Uuid,
        prompt: &str,
    ) -> anyhow::Result<ImageConfiguration> {
        let mut config = self.chat(chat_id, |c| c.image_settings.clone())?.unwrap_or(
            ImageConfiguration {
                prompt: String::new(),
                width: 512,
                height: 512,
                steps: 4,
                seed: None,
            },
        );
        config.prompt = prompt.to_string();
        Ok(config)
    }

    async fn has_attachments(&self, chat_id: Uuid) -> anyhow::Result<bool> {
        self.chat(chat_id, |c| !c.attachments.is_empty())
    }

    async fn attachment_file_titles(&self, chat_id: Uuid) -> anyhow::Result<Vec<String>> {
        self.chat(chat_id, |c| c.attachments.clone())
    }

    async fn fetch_context_data(&self, chat_id: Uuid) -> anyhow::Result<ContextConfiguration> {
        let mut config = self.chat(chat_id, |c| c.context.clone())?;
        // Expose the chat history as context messages, oldest first.
        let inner = self.inner.lock().unwrap();
        let mut messages: Vec<&MessageRecord> = inner
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .collect();
        messages.sort_by_key(|m| m.created_at);
        config.context_messages = messages
            .into_iter()
            .map(|m| tiller_context::ContextMessage {
                message_id: m.id,
                user_input: m.user_input.clone(),
                assistant_output: m
                    .channels
                    .iter()
                    .rev()
                    .find(|c| c.kind == ChannelKind::Final)
                    .map(|c| c.content.clone()),
            })
            .collect();
        Ok(config)
    }

    async fn transition_runtime_state(
        &self,
        model_id: Uuid,
        transition: RuntimeTransition,
    ) -> anyhow::Result<()> {
        debug!(%model_id, ?transition, "recording runtime transition");
        self.inner
            .lock()
            .unwrap()
            .transitions
            .push((model_id, transition));
        Ok(())
    }

    async fn delete_model_location(&self, model_id: Uuid) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.deleted_locations.push(model_id);
        for chat in inner.chats.values_mut() {
            if chat.language_model.id == model_id {
                chat.language_model.location_local = None;
                chat.language_model.location_bookmark = None;
            }
        }
        Ok(())
    }

    async fn create_message(&self, message: MessageRecord) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .insert(message.id, message);
        Ok(())
    }

    async fn update_processed_output(
        &self,
        message_id: Uuid,
        output: &ProcessedOutput,
    ) -> anyhow::Result<()> {
        self.check_streaming_write()?;
        self.message_mut(message_id, |m| {
            m.channels = output.channels.clone();
        })
    }

    async fn update_streaming_final_channel(
        &self,
        message_id: Uuid,
        content: &str,
        is_complete: bool,
    ) -> anyhow::Result<()> {
        self.check_streaming_write()?;
        self.message_mut(message_id, |m| {
            match m
                .channels
                .iter_mut()
                .rev()
                .find(|c| c.kind == ChannelKind::Final)
            {
                Some(ch) => {
                    // The channel keeps the id assigned by the first parse.
                    ch.content = content.to_string();
                    ch.is_complete = is_complete;
                }
                None => {
                    let order = m.channels.len() as u32;
                    let mut ch = Channel::new(ChannelKind::Final, content, order);
                    ch.is_complete = is_complete;
                    m.channels.push(ch);
                }
            }
        })
    }

    async fn append_final_channel_content(
        &self,
        message_id: Uuid,
        content: &str,
    ) -> anyhow::Result<()> {
        self.message_mut(message_id, |m| {
            match m
                .channels
                .iter_mut()
                .rev()
                .find(|c| c.kind == ChannelKind::Final)
            {
                Some(ch) => {
                    if !ch.content.is_empty() {
                        ch.content.push_str("\n\n");
                    }
                    ch.content.push_str(content);
                    ch.is_complete = true;
                }
                None => {
                    let order = m.channels.len() as u32;
                    m.channels.push(Channel::new(ChannelKind::Final, content, order));
                }
            }
        })
    }

    async fn update_tool_responses(
        &self,
        message_id: Uuid,
        responses: &[ToolResponse],
    ) -> anyhow::Result<()> {
        self.message_mut(message_id, |m| {
            m.tool_responses.extend_from_slice(responses);
        })
    }

    async fn add_metrics(&self, metrics: MetricsRecord) -> anyhow::Result<()> {
        self.inner.lock().unwrap().metrics.push(metrics);
        Ok(())
    }

    async fn add_image_response(&self, image: ImageRecord) -> anyhow::Result<()> {
        self.inner.lock().unwrap().images.push(image);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_model::{LocationKind, ModelBackend};

    fn model() -> SendableModel {
        SendableModel {
            id: Uuid::new_v4(),
            name: "m".into(),
            backend: ModelBackend::Gguf,
            location: "m.gguf".into(),
            location_kind: LocationKind::LocalFile,
            location_local: Some("/tmp/m.gguf".into()),
            location_bookmark: None,
            metadata: None,
        }
    }

    fn seeded_store() -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let chat = ChatRecord::new(model(), ContextConfiguration::default());
        let id = store.insert_chat(chat);
        (store, id)
    }

    #[tokio::test]
    async fn unknown_chat_is_an_error() {
        let store = MemoryStore::new();
        assert!(store.language_model(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn streaming_final_channel_keeps_id_across_updates() {
        let (store, chat_id) = seeded_store();
        let msg = MessageRecord::new(chat_id, "hi");
        let msg_id = msg.id;
        store.create_message(msg).await.unwrap();

        store
            .update_streaming_final_channel(msg_id, "Hel", false)
            .await
            .unwrap();
        let first_id = store.message(msg_id).unwrap().channels[0].id;

        store
            .update_streaming_final_channel(msg_id, "Hello", true)
            .await
            .unwrap();
        let m = store.message(msg_id).unwrap();
        assert_eq!(m.channels.len(), 1);
        assert_eq!(m.channels[0].id, first_id);
        assert_eq!(m.channels[0].content, "Hello");
        assert!(m.channels[0].is_complete);
    }

    #[tokio::test]
    async fn append_preserves_prior_final_content() {
        let (store, chat_id) = seeded_store();
        let msg = MessageRecord::new(chat_id, "hi");
        let msg_id = msg.id;
        store.create_message(msg).await.unwrap();
        store
            .update_streaming_final_channel(msg_id, "partial", false)
            .await
            .unwrap();
        store
            .append_final_channel_content(msg_id, "**Generation failed**")
            .await
            .unwrap();
        let m = store.message(msg_id).unwrap();
        assert_eq!(m.channels[0].content, "partial\n\n**Generation failed**");
    }

    #[tokio::test]
    async fn delete_model_location_clears_chat_binding() {
        let (store, chat_id) = seeded_store();
        let model_id = store.language_model(chat_id).await.unwrap().id;
        store.delete_model_location(model_id).await.unwrap();
        let m = store.language_model(chat_id).await.unwrap();
        assert!(m.location_local.is_none());
        assert!(m.location_bookmark.is_none());
        assert_eq!(store.deleted_locations(), vec![model_id]);
    }

    #[tokio::test]
    async fn injected_write_failures_surface_on_streaming_paths() {
        let (store, chat_id) = seeded_store();
        let msg = MessageRecord::new(chat_id, "hi");
        let msg_id = msg.id;
        store.create_message(msg).await.unwrap();
        store.set_fail_streaming_writes(true);
        assert!(store
            .update_streaming_final_channel(msg_id, "x", false)
            .await
            .is_err());
        store.set_fail_streaming_writes(false);
        assert!(store
            .update_streaming_final_channel(msg_id, "x", false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn context_data_includes_chat_history_in_order() {
        let (store, chat_id) = seeded_store();
        let mut first = MessageRecord::new(chat_id, "one");
        first.channels.push(Channel::new(ChannelKind::Final, "1", 0));
        let mut second = MessageRecord::new(chat_id, "two");
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        store.create_message(first).await.unwrap();
        store.create_message(second).await.unwrap();
        let cfg = store.fetch_context_data(chat_id).await.unwrap();
        assert_eq!(cfg.context_messages.len(), 2);
        assert_eq!(cfg.context_messages[0].user_input, "one");
        assert_eq!(
            cfg.context_messages[0].assistant_output.as_deref(),
            Some("1")
        );
        assert_eq!(cfg.context_messages[1].user_input, "two");
    }
}
