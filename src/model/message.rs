use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId, UserId};
use crate::error::ChatError;

/// Total order of messages within a conversation.
///
/// `created_at_ms` comes from the wall clock (clamped so it never goes
/// backwards inside a conversation) and `seq` is the store's insertion
/// sequence, so messages written in the same millisecond still sort the
/// same way for every reader. The derived `Ord` compares fields in
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderKey {
    pub created_at_ms: i64,
    pub seq: i64,
}

impl OrderKey {
    pub fn new(created_at_ms: i64, seq: i64) -> Self {
        Self { created_at_ms, seq }
    }
}

/// Cursor form: `<created_at_ms>-<seq>`.
impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.created_at_ms, self.seq)
    }
}

impl FromStr for OrderKey {
    type Err = ChatError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ChatError::InvalidCursor(raw.to_string());
        let (ms, seq) = raw.trim().split_once('-').ok_or_else(invalid)?;
        let created_at_ms = ms.parse::<i64>().map_err(|_| invalid())?;
        let seq = seq.parse::<i64>().map_err(|_| invalid())?;
        if created_at_ms < 0 || seq < 0 {
            return Err(invalid());
        }
        Ok(Self { created_at_ms, seq })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub order_key: OrderKey,
}

impl Message {
    pub fn cursor(&self) -> String {
        self.order_key.to_string()
    }
}

/// A validated message waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at_ms: i64,
}

impl NewMessage {
    /// Trims the body and rejects empty or oversized text.
    pub fn validated(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: &str,
        max_body_chars: usize,
        id: Option<MessageId>,
    ) -> Result<Self, ChatError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if body.chars().count() > max_body_chars {
            return Err(ChatError::MessageTooLong {
                max: max_body_chars,
            });
        }

        Ok(Self {
            id: id.unwrap_or_default(),
            conversation_id,
            sender_id,
            body: body.to_string(),
            created_at_ms: Utc::now().timestamp_millis(),
        })
    }
}

/// One page of a conversation's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Pass back as `after` to continue; unchanged when the page is empty.
    pub next_cursor: Option<OrderKey>,
}

/// Last message a participant has read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarker {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub last_read: OrderKey,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}
