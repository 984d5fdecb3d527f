//! Bounded per-peer delivery queue with a configurable overflow policy.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::ConfigError;
use crate::message::Message;

/// What happens when a message is offered to a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the incoming message; queued content is kept.
    DropNewest,
    /// Evict the single oldest queued message to make room.
    #[default]
    DropOldest,
    /// Suspend the producer until the sender loop frees a slot.
    Block,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_newest" => Ok(OverflowPolicy::DropNewest),
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "block" => Ok(OverflowPolicy::Block),
            _ => Err(ConfigError::Invalid {
                key: "overflow_policy",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    DroppedNewest,
    DroppedOldest,
    Closed,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Message>,
    closed: bool,
}

/// FIFO of outbound messages for one peer.
pub struct PeerQueue {
    state: Mutex<QueueState>,
    limit: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl PeerQueue {
    pub fn new(limit: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            limit: limit.max(1),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer `message` to the queue, applying the overflow policy when full.
    pub async fn push(&self, message: Message) -> Enqueued {
        let mut message = Some(message);
        loop {
            let space = self.not_full.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                if state.closed {
                    return Enqueued::Closed;
                }
                if state.items.len() < self.limit {
                    state.items.extend(message.take());
                    drop(state);
                    self.not_empty.notify_one();
                    return Enqueued::Queued;
                }
                match self.policy {
                    OverflowPolicy::DropNewest => return Enqueued::DroppedNewest,
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.extend(message.take());
                        drop(state);
                        self.not_empty.notify_one();
                        return Enqueued::DroppedOldest;
                    }
                    OverflowPolicy::Block => {}
                }
            }
            space.await;
        }
    }

    /// Take the oldest message, waiting while the queue is empty. `None` once
    /// the queue is closed and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let ready = self.not_empty.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(message) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Refuse further pushes and wake every waiter. Queued messages can still
    /// be popped.
    pub fn close(&self) {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}
