// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use tiller_config::DebugLogConfig;
use tiller_context::{Channel, ChannelKind, ContextBuilder, ProcessedOutput};
use tiller_model::SendableModel;
use tiller_store::{MessageRecord, MetricsRecord, Store};
use tiller_tools::ToolResponse;

use crate::extract_final_channel;

/// Per-message streaming accumulator.
///
/// Raw model text accumulates across all iterations of one generation; the
/// first persisted write runs the full parser to materialize stable channel
/// IDs, later throttled writes update only the user-facing final channel.
pub struct StreamAccumulator {
    message_id: Uuid,
    model: SendableModel,
    raw: String,
    /// Byte offset where the current turn's output starts.
    turn_start: usize,
    last_write: Option<Instant>,
    /// `(kind, id)` per channel of the first full parse, in order.
    first_parse_ids: Option<Vec<(ChannelKind, Uuid)>>,
}

impl StreamAccumulator {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The raw text streamed since the last `begin_turn`.
    pub fn turn_raw(&self) -> &str {
        &self.raw[self.turn_start..]
    }

    /// Mark the start of a new loop turn.
    pub fn begin_turn(&mut self) {
        self.turn_start = self.raw.len();
    }

    pub fn has_output(&self) -> bool {
        !self.raw.is_empty()
    }
}

/// Durable write surface for messages, channels, tool results, metrics and
/// images.  Writes on the streaming path are throttled on a monotonic clock
/// and tolerate transient failures: they log and let raw text keep
/// accumulating, because the terminal parse persists everything again.
pub struct MessagePersistor {
    store: Arc<dyn Store>,
    builder: Arc<dyn ContextBuilder>,
    throttle: Duration,
    debug_log: DebugLogConfig,
}

impl MessagePersistor {
    pub fn new(
        store: Arc<dyn Store>,
        builder: Arc<dyn ContextBuilder>,
        throttle: Duration,
        debug_log: DebugLogConfig,
    ) -> Self {
        Self {
            store,
            builder,
            throttle,
            debug_log,
        }
    }

    pub async fn create_message(&self, message: MessageRecord) -> anyhow::Result<()> {
        self.store.create_message(message).await
    }

    pub fn begin(&self, message_id: Uuid, model: SendableModel) -> StreamAccumulator {
        StreamAccumulator {
            message_id,
            model,
            raw: String::new(),
            turn_start: 0,
            last_write: None,
            first_parse_ids: None,
        }
    }

    /// Accumulate one streamed delta and perform a throttled persistent
    /// write when due.
    pub async fn on_delta(&self, acc: &mut StreamAccumulator, delta: &str) {
        if delta.len() <= self.debug_log.token_chunk_size_limit {
            debug!(chunk = %preview(delta, self.debug_log.text_preview_length), "delta");
        } else {
            debug!(len = delta.len(), "delta (oversized chunk elided)");
        }
        acc.raw.push_str(delta);

        let now = Instant::now();
        let due = acc
            .last_write
            .map_or(true, |last| now.duration_since(last) >= self.throttle);
        if !due {
            return;
        }
        acc.last_write = Some(now);

        if acc.first_parse_ids.is_none() {
            // First persistent update: full parse so channel IDs exist and
            // stay stable for the rest of the message's life.
            match self.builder.process(&acc.raw, &acc.model) {
                Ok(output) => {
                    if let Err(e) = self
                        .store
                        .update_processed_output(acc.message_id, &output)
                        .await
                    {
                        warn!(error = %e, "streaming parse write failed; will retry at end");
                        return;
                    }
                    acc.first_parse_ids = Some(
                        output.channels.iter().map(|c| (c.kind, c.id)).collect(),
                    );
                }
                Err(e) => warn!(error = %e, "streaming parse failed"),
            }
        } else {
            // Steady-state: write only the user-facing text, skipping the
            // parser entirely.
            let content = extract_final_channel(&acc.raw);
            if let Err(e) = self
                .store
                .update_streaming_final_channel(acc.message_id, &content, false)
                .await
            {
                warn!(error = %e, "streaming final-channel write failed");
            }
        }
    }

    /// Parse the given turn's raw output without touching the store.
    pub fn process_turn(&self, acc: &StreamAccumulator) -> anyhow::Result<ProcessedOutput> {
        self.builder.process(acc.turn_raw(), &acc.model)
    }

    /// Terminal parse-and-persist, performed unconditionally when the run
    /// completes.  Channel IDs from the first streaming parse are preserved.
    pub async fn finalize(&self, acc: &StreamAccumulator) -> anyhow::Result<ProcessedOutput> {
        let mut output = self.builder.process(&acc.raw, &acc.model)?;
        if let Some(ids) = &acc.first_parse_ids {
            reconcile_channel_ids(&mut output.channels, ids);
        }
        self.store
            .update_processed_output(acc.message_id, &output)
            .await?;
        self.store
            .update_streaming_final_channel(acc.message_id, output.final_text(), true)
            .await?;
        Ok(output)
    }

    /// Persisted before the next iteration's stream begins.
    pub async fn persist_tool_responses(
        &self,
        message_id: Uuid,
        responses: &[ToolResponse],
    ) -> anyhow::Result<()> {
        self.store.update_tool_responses(message_id, responses).await
    }

    pub async fn persist_metrics(&self, metrics: MetricsRecord) {
        if let Err(e) = self.store.add_metrics(metrics).await {
            warn!(error = %e, "failed to persist generation metrics");
        }
    }

    /// Append the human-readable failure note, preserving prior output.
    /// A failure here is logged, never thrown.
    pub async fn append_failure_note(&self, message_id: Uuid, error_message: &str) {
        let note = if error_message.is_empty() {
            "**Generation failed**".to_string()
        } else {
            format!("**Generation failed**\n\n{error_message}")
        };
        if let Err(e) = self
            .store
            .append_final_channel_content(message_id, &note)
            .await
        {
            warn!(error = %e, "failed to persist terminal error note");
        }
    }
}

/// Re-attach the ids minted by the first parse to a fresh parse of the same
/// message: the Nth channel of a kind keeps the Nth id recorded for that
/// kind.  Channels that appeared later keep their fresh ids.
fn reconcile_channel_ids(fresh: &mut [Channel], first: &[(ChannelKind, Uuid)]) {
    let mut used = vec![false; first.len()];
    for channel in fresh.iter_mut() {
        let found = first
            .iter()
            .enumerate()
            .find(|(i, (kind, _))| !used[*i] && *kind == channel.kind);
        if let Some((i, (_, id))) = found {
            used[i] = true;
            channel.id = *id;
        }
    }
}

fn preview(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_context::HarmonyContextBuilder;
    use tiller_model::{LocationKind, ModelBackend};
    use tiller_store::{ChatRecord, MemoryStore};

    fn model() -> SendableModel {
        SendableModel {
            id: Uuid::new_v4(),
            name: "m".into(),
            backend: ModelBackend::Gguf,
            location: "m.gguf".into(),
            location_kind: LocationKind::LocalFile,
            location_local: None,
            location_bookmark: None,
            metadata: None,
        }
    }

    async fn fixture() -> (Arc<MemoryStore>, MessagePersistor, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let chat_id = store.insert_chat(ChatRecord::new(
            model(),
            tiller_context::ContextConfiguration::default(),
        ));
        let persistor = MessagePersistor::new(
            store.clone(),
            Arc::new(HarmonyContextBuilder),
            Duration::from_millis(0),
            DebugLogConfig::default(),
        );
        let message = MessageRecord::new(chat_id, "hi");
        let message_id = message.id;
        persistor.create_message(message).await.unwrap();
        (store, persistor, message_id)
    }

    #[tokio::test]
    async fn first_write_parses_then_streams_final_only() {
        let (store, persistor, message_id) = fixture().await;
        let mut acc = persistor.begin(message_id, model());

        persistor.on_delta(&mut acc, "Hel").await;
        let first = store.message(message_id).unwrap();
        assert_eq!(first.channels.len(), 1);
        let channel_id = first.channels[0].id;

        persistor.on_delta(&mut acc, "lo").await;
        let second = store.message(message_id).unwrap();
        assert_eq!(second.channels[0].id, channel_id);
        assert_eq!(second.channels[0].content, "Hello");
        assert!(!second.channels[0].is_complete);

        let output = persistor.finalize(&acc).await.unwrap();
        assert_eq!(output.final_text(), "Hello");
        let done = store.message(message_id).unwrap();
        assert_eq!(done.channels[0].id, channel_id, "id stable through finalize");
        assert!(done.channels[0].is_complete);
    }

    #[tokio::test]
    async fn throttle_suppresses_intermediate_writes() {
        let (store, _, message_id) = fixture().await;
        let persistor = MessagePersistor::new(
            store.clone(),
            Arc::new(HarmonyContextBuilder),
            Duration::from_secs(3600),
            DebugLogConfig::default(),
        );
        let mut acc = persistor.begin(message_id, model());
        persistor.on_delta(&mut acc, "a").await; // first write is always due
        persistor.on_delta(&mut acc, "b").await; // throttled away
        let m = store.message(message_id).unwrap();
        assert_eq!(m.channels[0].content, "a");
        // Raw text still accumulated; the terminal parse catches up.
        persistor.finalize(&acc).await.unwrap();
        let m = store.message(message_id).unwrap();
        assert_eq!(m.channels[0].content, "ab");
    }

    #[tokio::test]
    async fn write_failures_are_swallowed_and_recovered_by_finalize() {
        let (store, persistor, message_id) = fixture().await;
        let mut acc = persistor.begin(message_id, model());
        store.set_fail_streaming_writes(true);
        persistor.on_delta(&mut acc, "Hello").await;
        assert!(store.message(message_id).unwrap().channels.is_empty());
        store.set_fail_streaming_writes(false);
        persistor.finalize(&acc).await.unwrap();
        assert_eq!(
            store.message(message_id).unwrap().channels[0].content,
            "Hello"
        );
    }

    #[tokio::test]
    async fn turn_tracking_isolates_each_iteration() {
        let (_, persistor, message_id) = fixture().await;
        let mut acc = persistor.begin(message_id, model());
        persistor.on_delta(&mut acc, "turn one").await;
        let first = persistor.process_turn(&acc).unwrap();
        assert_eq!(first.final_text(), "turn one");

        acc.begin_turn();
        persistor.on_delta(&mut acc, "turn two").await;
        let second = persistor.process_turn(&acc).unwrap();
        assert_eq!(second.final_text(), "turn two");
        assert_eq!(acc.raw(), "turn oneturn two");
    }

    #[test]
    fn reconcile_matches_by_kind_occurrence() {
        let first_id = Uuid::new_v4();
        let second_id = Uuid::new_v4();
        let recorded = vec![
            (ChannelKind::Analysis, first_id),
            (ChannelKind::Final, second_id),
        ];
        let mut fresh = vec![
            Channel::new(ChannelKind::Analysis, "think", 0),
            Channel::new(ChannelKind::Final, "hi", 1),
            Channel::new(ChannelKind::Final, "extra", 2),
        ];
        let extra_fresh_id = fresh[2].id;
        reconcile_channel_ids(&mut fresh, &recorded);
        assert_eq!(fresh[0].id, first_id);
        assert_eq!(fresh[1].id, second_id);
        assert_eq!(fresh[2].id, extra_fresh_id, "new channels keep fresh ids");
    }
}
