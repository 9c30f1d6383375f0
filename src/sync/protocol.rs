//! In-process delivery of committed messages and the frames exchanged over a
//! conversation WebSocket.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ChatResult;
use crate::model::{ConversationId, Message, MessageId};

/// Fan-out of committed messages. Implementations must only be called
/// after the message is durable.
pub trait Publisher: Send + Sync {
    fn publish(&self, message: &Message) -> ChatResult<()>;
}

/// In-process per-conversation broadcast channels.
#[derive(Clone)]
pub struct DeliveryHub {
    channels: Arc<DashMap<ConversationId, broadcast::Sender<Arc<Message>>>>,
    capacity: usize,
}

impl DeliveryHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Attach to a conversation's channel. Callers authorize first.
    pub fn subscribe(&self, conversation_id: ConversationId) -> Subscription {
        let receiver = self
            .channels
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        tracing::debug!(%conversation_id, "subscriber attached");

        Subscription {
            conversation_id,
            receiver: Some(receiver),
            channels: self.channels.clone(),
        }
    }

    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.channels
            .get(&conversation_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }
}

impl Default for DeliveryHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Publisher for DeliveryHub {
    fn publish(&self, message: &Message) -> ChatResult<()> {
        if let Some(sender) = self.channels.get(&message.conversation_id) {
            // No receivers is not an error: nobody is listening right now.
            let delivered = sender.send(Arc::new(message.clone())).unwrap_or(0);
            tracing::debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                delivered,
                "published message"
            );
        }
        Ok(())
    }
}

/// A live attachment to one conversation. Dropping it releases the
/// registration; the channel goes away with its last subscriber.
pub struct Subscription {
    conversation_id: ConversationId,
    receiver: Option<broadcast::Receiver<Arc<Message>>>,
    channels: Arc<DashMap<ConversationId, broadcast::Sender<Arc<Message>>>>,
}

/// What a subscriber sees next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Arc<Message>),
    /// The subscriber fell behind and `skipped` messages were dropped from
    /// its buffer. Recover by listing from the last seen cursor.
    Lagged { skipped: u64 },
    Closed,
}

impl Subscription {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub async fn recv(&mut self) -> Delivery {
        let Some(receiver) = self.receiver.as_mut() else {
            return Delivery::Closed;
        };
        match receiver.recv().await {
            Ok(message) => Delivery::Message(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Delivery::Lagged { skipped },
            Err(broadcast::error::RecvError::Closed) => Delivery::Closed,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.receiver.take());
        self.channels
            .remove_if(&self.conversation_id, |_, sender| sender.receiver_count() == 0);
        tracing::debug!(conversation_id = %self.conversation_id, "subscriber released");
    }
}

/// Frames sent by the server over a conversation WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message { message: Message },
    Ack { message_id: MessageId, cursor: String },
    Error {
        code: String,
        message: String,
        /// Client id of the send this error answers, when there is one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
}

/// Frames a client may send over a conversation WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Send {
        body: String,
        #[serde(default)]
        client_message_id: Option<MessageId>,
    },
}

impl ClientFrame {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            ClientFrame::Send {
                client_message_id, ..
            } => *client_message_id,
        }
    }
}
