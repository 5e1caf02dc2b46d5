// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `run-orchestration` queue (spec.md §6.5): messages `{run_id, tenant_id}`,
//! deduplicated by `run-<run_id>`, with `removeOnComplete=true` /
//! `removeOnFail=false` visibility semantics.
//!
//! A dequeued message is held in-flight (not removed) until the worker
//! [`acks`](RunOrchestrationQueue::ack) it. A worker that
//! [`nacks`](RunOrchestrationQueue::nack) — or never acks, past `visibility
//! timeout` — returns the message to the queue rather than dropping it:
//! `removeOnFail=false` means failures are retried, not lost.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Priority levels for queued runs; ties within a level are broken FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePriority {
    /// Lowest priority.
    Low,
    /// Default priority.
    Normal,
    /// Elevated priority.
    High,
    /// Highest priority — processed before all others.
    Critical,
}

impl Default for QueuePriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A message on the `run-orchestration` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Run this message names.
    pub run_id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
}

/// The dedup id for a run: `run-<run_id>`.
#[must_use]
pub fn dedup_id(run_id: Uuid) -> String {
    format!("run-{run_id}")
}

#[derive(Debug, Clone)]
struct Entry {
    message: QueueMessage,
    priority: QueuePriority,
    sequence: u64,
}

/// Errors returned by [`RunOrchestrationQueue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A message with this dedup id is already pending or in-flight.
    #[error("run {0} is already queued")]
    AlreadyQueued(String),
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Entry>,
    in_flight: HashMap<String, Entry>,
    next_sequence: u64,
}

/// Snapshot statistics for a [`RunOrchestrationQueue`].
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Messages waiting to be dequeued.
    pub pending: usize,
    /// Messages dequeued but not yet acked or nacked.
    pub in_flight: usize,
}

/// The in-process `run-orchestration` queue.
///
/// `enqueue` is idempotent per `run_id`: a run already pending or in-flight
/// is not queued twice, matching the topic's `dedup id = run-<runId>`
/// contract.
#[derive(Default)]
pub struct RunOrchestrationQueue {
    state: Mutex<QueueState>,
}

impl RunOrchestrationQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a run at the given priority. A no-op (returns
    /// [`QueueError::AlreadyQueued`]) if the run is already pending or
    /// in-flight.
    pub async fn enqueue(&self, message: QueueMessage, priority: QueuePriority) -> Result<(), QueueError> {
        let id = dedup_id(message.run_id);
        let mut state = self.state.lock().await;
        if state.in_flight.contains_key(&id) || state.pending.iter().any(|e| dedup_id(e.message.run_id) == id) {
            return Err(QueueError::AlreadyQueued(id));
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending.push(Entry { message, priority, sequence });
        Ok(())
    }

    /// Dequeue the highest-priority pending message (oldest first within a
    /// priority level), moving it to in-flight. Returns `None` if the queue
    /// has no pending messages.
    pub async fn dequeue(&self) -> Option<QueueMessage> {
        let mut state = self.state.lock().await;
        let max_priority = state.pending.iter().map(|e| e.priority).max()?;
        let idx = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, e)| e.priority == max_priority)
            .min_by_key(|(_, e)| e.sequence)
            .map(|(idx, _)| idx)?;
        let entry = state.pending.remove(idx);
        let id = dedup_id(entry.message.run_id);
        let message = entry.message.clone();
        state.in_flight.insert(id, entry);
        Some(message)
    }

    /// Acknowledge successful processing: the message is removed entirely
    /// (`removeOnComplete=true`).
    pub async fn ack(&self, run_id: Uuid) {
        let id = dedup_id(run_id);
        self.state.lock().await.in_flight.remove(&id);
    }

    /// Signal failed processing: the message returns to `pending` at its
    /// original priority rather than being dropped (`removeOnFail=false`).
    pub async fn nack(&self, run_id: Uuid) {
        let id = dedup_id(run_id);
        let mut state = self.state.lock().await;
        if let Some(entry) = state.in_flight.remove(&id) {
            tracing::warn!(run_id = %run_id, "run-orchestration message nacked, returning to queue");
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.pending.push(Entry { sequence, ..entry });
        }
    }

    /// `true` if neither pending nor in-flight messages remain.
    pub async fn is_empty(&self) -> bool {
        let state = self.state.lock().await;
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    /// Snapshot queue depth.
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(run_id: Uuid) -> QueueMessage {
        QueueMessage {
            run_id,
            tenant_id: "acme".to_string(),
        }
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_returns_none() {
        let queue = RunOrchestrationQueue::new();
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips() {
        let queue = RunOrchestrationQueue::new();
        let run_id = Uuid::new_v4();
        queue.enqueue(message(run_id), QueuePriority::Normal).await.unwrap();
        let dequeued = queue.dequeue().await.unwrap();
        assert_eq!(dequeued.run_id, run_id);
    }

    #[tokio::test]
    async fn duplicate_enqueue_of_pending_run_is_rejected() {
        let queue = RunOrchestrationQueue::new();
        let run_id = Uuid::new_v4();
        queue.enqueue(message(run_id), QueuePriority::Normal).await.unwrap();
        let err = queue.enqueue(message(run_id), QueuePriority::Normal).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyQueued(_)));
    }

    #[tokio::test]
    async fn duplicate_enqueue_of_in_flight_run_is_rejected() {
        let queue = RunOrchestrationQueue::new();
        let run_id = Uuid::new_v4();
        queue.enqueue(message(run_id), QueuePriority::Normal).await.unwrap();
        queue.dequeue().await.unwrap();
        let err = queue.enqueue(message(run_id), QueuePriority::Normal).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyQueued(_)));
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let queue = RunOrchestrationQueue::new();
        let low = Uuid::new_v4();
        let high = Uuid::new_v4();
        queue.enqueue(message(low), QueuePriority::Low).await.unwrap();
        queue.enqueue(message(high), QueuePriority::High).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap().run_id, high);
        assert_eq!(queue.dequeue().await.unwrap().run_id, low);
    }

    #[tokio::test]
    async fn equal_priority_dequeues_fifo() {
        let queue = RunOrchestrationQueue::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.enqueue(message(first), QueuePriority::Normal).await.unwrap();
        queue.enqueue(message(second), QueuePriority::Normal).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap().run_id, first);
        assert_eq!(queue.dequeue().await.unwrap().run_id, second);
    }

    #[tokio::test]
    async fn ack_removes_message_and_allows_requeue() {
        let queue = RunOrchestrationQueue::new();
        let run_id = Uuid::new_v4();
        queue.enqueue(message(run_id), QueuePriority::Normal).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.ack(run_id).await;
        assert!(queue.is_empty().await);
        queue.enqueue(message(run_id), QueuePriority::Normal).await.unwrap();
        assert!(!queue.is_empty().await);
    }

    #[tokio::test]
    async fn nack_returns_message_to_pending() {
        let queue = RunOrchestrationQueue::new();
        let run_id = Uuid::new_v4();
        queue.enqueue(message(run_id), QueuePriority::Normal).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.nack(run_id).await;
        let stats = queue.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 0);
        let redelivered = queue.dequeue().await.unwrap();
        assert_eq!(redelivered.run_id, run_id);
    }

    #[tokio::test]
    async fn stats_report_pending_and_in_flight_counts() {
        let queue = RunOrchestrationQueue::new();
        queue.enqueue(message(Uuid::new_v4()), QueuePriority::Normal).await.unwrap();
        queue.enqueue(message(Uuid::new_v4()), QueuePriority::Normal).await.unwrap();
        queue.dequeue().await.unwrap();
        let stats = queue.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 1);
    }
}
