// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use tokio::sync::Notify;
use uuid::Uuid;

/// Out-of-band caller control for a running generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SteeringMode {
    /// No-op; consuming it changes nothing.
    Inactive,
    /// Abort the current stream and finish the run as completed.
    HardStop,
    /// Finish after the current stream/decision boundary; no more tools.
    SoftInterrupt,
    /// Replace the next iteration's prompt.
    Redirect(String),
}

#[derive(Debug, Clone)]
pub struct SteeringRequest {
    pub id: Uuid,
    pub mode: SteeringMode,
}

/// Single-slot interrupt mailbox.
///
/// The most recent `submit` supersedes any unread prior request; the request
/// id is minted when the empty slot is first filled and survives mode
/// replacement, so one "interrupt" keeps its identity until consumed.
#[derive(Default)]
pub struct SteeringCoordinator {
    slot: Mutex<Option<SteeringRequest>>,
    notify: Notify,
}

impl SteeringCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot with `mode` and wake any waiter.  Returns the id of
    /// the pending request.
    pub fn submit(&self, mode: SteeringMode) -> Uuid {
        let mut slot = self.slot.lock().unwrap();
        let id = match slot.as_ref() {
            Some(existing) => existing.id,
            None => Uuid::new_v4(),
        };
        *slot = Some(SteeringRequest { id, mode });
        drop(slot);
        self.notify.notify_waiters();
        id
    }

    /// Atomic take-and-clear.
    pub fn consume(&self) -> Option<SteeringRequest> {
        self.slot.lock().unwrap().take()
    }

    /// True while the slot holds a stop request; does not consume.
    pub fn should_skip_remaining_tools(&self) -> bool {
        matches!(
            self.slot.lock().unwrap().as_ref().map(|r| &r.mode),
            Some(SteeringMode::HardStop) | Some(SteeringMode::SoftInterrupt)
        )
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap() = None;
    }

    /// Wait until a request is pending.  Returns immediately if one already is.
    pub async fn wait_for_request(&self) {
        loop {
            if self.slot.lock().unwrap().is_some() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_submit_supersedes_but_keeps_id() {
        let s = SteeringCoordinator::new();
        let id1 = s.submit(SteeringMode::SoftInterrupt);
        let id2 = s.submit(SteeringMode::HardStop);
        assert_eq!(id1, id2);
        let req = s.consume().unwrap();
        assert_eq!(req.id, id1);
        assert_eq!(req.mode, SteeringMode::HardStop);
    }

    #[test]
    fn consume_clears_the_slot() {
        let s = SteeringCoordinator::new();
        s.submit(SteeringMode::HardStop);
        assert!(s.consume().is_some());
        assert!(s.consume().is_none());
    }

    #[test]
    fn fresh_id_after_consume() {
        let s = SteeringCoordinator::new();
        let id1 = s.submit(SteeringMode::HardStop);
        s.consume();
        let id2 = s.submit(SteeringMode::HardStop);
        assert_ne!(id1, id2);
    }

    #[test]
    fn skip_tools_only_for_stop_modes() {
        let s = SteeringCoordinator::new();
        assert!(!s.should_skip_remaining_tools());
        s.submit(SteeringMode::Redirect("x".into()));
        assert!(!s.should_skip_remaining_tools());
        s.submit(SteeringMode::SoftInterrupt);
        assert!(s.should_skip_remaining_tools());
        s.submit(SteeringMode::HardStop);
        assert!(s.should_skip_remaining_tools());
        // Peeking must not consume.
        assert!(s.consume().is_some());
    }

    #[tokio::test]
    async fn wait_for_request_wakes_on_submit() {
        let s = std::sync::Arc::new(SteeringCoordinator::new());
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_for_request().await })
        };
        tokio::task::yield_now().await;
        s.submit(SteeringMode::HardStop);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
