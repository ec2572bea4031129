// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Flow events and per-conversation subscriptions.
//!
//! Every event carries its conversation id and is delivered only to the
//! subscribers of that conversation. Dropping a [`FlowSubscription`] removes
//! it from the hub, so a closed call stops receiving events even if it never
//! unsubscribed explicitly.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::flows::definition::TransferType;
use crate::flows::state::FlowLifecycle;
use crate::utils::helpers::next_handle_id;

/// Side effect requested by a node, executed by the call session.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowAction {
    Speak {
        text: String,
    },
    Listen {
        prompt: Option<String>,
        timeout_ms: u64,
        store_as: String,
    },
    Transfer {
        destination: String,
        transfer_type: TransferType,
        message: Option<String>,
    },
    End {
        outcome: String,
        message: Option<String>,
    },
    PlayUrl {
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowEventKind {
    Speak {
        text: String,
    },
    Listen {
        prompt: Option<String>,
        timeout_ms: u64,
        store_as: String,
    },
    Transfer {
        destination: String,
        transfer_type: TransferType,
        message: Option<String>,
    },
    End {
        outcome: String,
        message: Option<String>,
    },
    PlayUrl {
        url: String,
    },
    Error {
        message: String,
    },
    NodeEntered {
        node_id: String,
        node_type: &'static str,
    },
    NodeCompleted {
        node_id: String,
        success: bool,
    },
    VariableSet {
        name: String,
        value: Value,
    },
    StateChanged {
        from: FlowLifecycle,
        to: FlowLifecycle,
    },
}

impl From<FlowAction> for FlowEventKind {
    fn from(action: FlowAction) -> Self {
        match action {
            FlowAction::Speak { text } => Self::Speak { text },
            FlowAction::Listen {
                prompt,
                timeout_ms,
                store_as,
            } => Self::Listen {
                prompt,
                timeout_ms,
                store_as,
            },
            FlowAction::Transfer {
                destination,
                transfer_type,
                message,
            } => Self::Transfer {
                destination,
                transfer_type,
                message,
            },
            FlowAction::End { outcome, message } => Self::End { outcome, message },
            FlowAction::PlayUrl { url } => Self::PlayUrl { url },
        }
    }
}

impl FlowEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Speak { .. } => "speak",
            Self::Listen { .. } => "listen",
            Self::Transfer { .. } => "transfer",
            Self::End { .. } => "end",
            Self::PlayUrl { .. } => "play_url",
            Self::Error { .. } => "error",
            Self::NodeEntered { .. } => "node_entered",
            Self::NodeCompleted { .. } => "node_completed",
            Self::VariableSet { .. } => "variable_set",
            Self::StateChanged { .. } => "state_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowEvent {
    pub conversation_id: String,
    pub kind: FlowEventKind,
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowEvent({}, {})", self.conversation_id, self.kind.name())
    }
}

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<FlowEvent>)>>;

#[derive(Default)]
struct HubInner {
    subscribers: Mutex<Subscribers>,
}

impl HubInner {
    fn remove(&self, conversation_id: &str, id: u64) {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subs.get_mut(conversation_id) {
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.is_empty() {
                subs.remove(conversation_id);
            }
        }
    }
}

/// Fan-out of flow events keyed by conversation id.
#[derive(Clone, Default)]
pub struct FlowEventHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for FlowEventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conversations = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("FlowEventHub")
            .field("conversations", &conversations)
            .finish()
    }
}

impl FlowEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conversation_id: &str) -> FlowSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = next_handle_id();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.to_string())
            .or_default()
            .push((id, tx));
        FlowSubscription {
            conversation_id: conversation_id.to_string(),
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `kind` to the subscribers of `conversation_id`.
    ///
    /// Returns the number of subscribers reached. Subscribers whose receiver
    /// is gone are pruned.
    pub fn emit(&self, conversation_id: &str, kind: FlowEventKind) -> usize {
        let mut subs = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = subs.get_mut(conversation_id) else {
            return 0;
        };
        let event = FlowEvent {
            conversation_id: conversation_id.to_string(),
            kind,
        };
        list.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        let delivered = list.len();
        if delivered == 0 {
            subs.remove(conversation_id);
        }
        delivered
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .map_or(0, Vec::len)
    }
}

/// Receiving end of a conversation's events.
pub struct FlowSubscription {
    conversation_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<FlowEvent>,
    hub: Weak<HubInner>,
}

impl fmt::Debug for FlowSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowSubscription")
            .field("conversation_id", &self.conversation_id)
            .field("id", &self.id)
            .finish()
    }
}

impl FlowSubscription {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<FlowEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FlowEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued so far.
    pub fn drain(&mut self) -> Vec<FlowEvent> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    /// Explicitly stop receiving; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for FlowSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(&self.conversation_id, self.id);
        }
    }
}
