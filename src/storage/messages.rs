use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::db::{parse_column, Database};
use crate::error::{ChatError, ChatResult};
use crate::model::message::millis_to_datetime;
use crate::model::{ConversationId, Message, NewMessage, OrderKey, ReadMarker, UserId};

const MESSAGE_COLUMNS: &str = "seq, id, conversation_id, sender_id, body, created_at_ms";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let seq: i64 = row.get(0)?;
    let created_at_ms: i64 = row.get(5)?;
    Ok(Message {
        id: parse_column(1, row.get(1)?)?,
        conversation_id: parse_column(2, row.get(2)?)?,
        sender_id: parse_column(3, row.get(3)?)?,
        body: row.get(4)?,
        created_at: millis_to_datetime(created_at_ms),
        order_key: OrderKey::new(created_at_ms, seq),
    })
}

impl Database {
    /// Append inside one IMMEDIATE transaction and run `on_commit` after the
    /// commit, still holding the connection. Writers are serialized by that
    /// lock, so hooks observe messages in commit order.
    ///
    /// Re-appending an id that is already stored returns the stored message
    /// and skips the hook.
    pub fn append_message(
        &self,
        input: &NewMessage,
        on_commit: &dyn Fn(&Message),
    ) -> ChatResult<Message> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing_sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let existing = tx
            .query_row(&existing_sql, params![input.id.to_string()], message_from_row)
            .optional()?;
        if let Some(existing) = existing {
            // A client id may only be replayed by its original sender in its
            // original conversation.
            if existing.conversation_id != input.conversation_id
                || existing.sender_id != input.sender_id
            {
                return Err(ChatError::Forbidden);
            }
            return Ok(existing);
        }

        let newest: Option<i64> = tx.query_row(
            "SELECT MAX(created_at_ms) FROM messages WHERE conversation_id = ?1",
            params![input.conversation_id.to_string()],
            |row| row.get(0),
        )?;
        let created_at_ms = newest.map_or(input.created_at_ms, |n| n.max(input.created_at_ms));

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, body, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                input.id.to_string(),
                input.conversation_id.to_string(),
                input.sender_id.as_str(),
                input.body,
                created_at_ms,
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        let message = Message {
            id: input.id,
            conversation_id: input.conversation_id,
            sender_id: input.sender_id.clone(),
            body: input.body.clone(),
            created_at: millis_to_datetime(created_at_ms),
            order_key: OrderKey::new(created_at_ms, seq),
        };
        on_commit(&message);

        Ok(message)
    }

    /// Messages strictly after `after`, ascending by order key.
    pub fn messages_after(
        &self,
        conversation_id: ConversationId,
        after: Option<OrderKey>,
        limit: usize,
    ) -> ChatResult<Vec<Message>> {
        let conn = self.conn.lock();
        let after = after.unwrap_or(OrderKey::new(i64::MIN, i64::MIN));

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
               AND (created_at_ms > ?2 OR (created_at_ms = ?2 AND seq > ?3))
             ORDER BY created_at_ms ASC, seq ASC
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                conversation_id.to_string(),
                after.created_at_ms,
                after.seq,
                limit as i64
            ],
            message_from_row,
        )?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn last_message(&self, conversation_id: ConversationId) -> ChatResult<Option<Message>> {
        let conn = self.conn.lock();

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at_ms DESC, seq DESC
             LIMIT 1"
        );
        let found = conn
            .query_row(&sql, params![conversation_id.to_string()], message_from_row)
            .optional()?;

        Ok(found)
    }

    /// Last write wins, even if it moves the marker backwards.
    pub fn set_read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
        up_to: OrderKey,
    ) -> ChatResult<ReadMarker> {
        let conn = self.conn.lock();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO read_markers (conversation_id, user_id, last_read_ms, last_read_seq, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                last_read_ms = excluded.last_read_ms,
                last_read_seq = excluded.last_read_seq,
                updated_at_ms = excluded.updated_at_ms",
            params![
                conversation_id.to_string(),
                user_id.as_str(),
                up_to.created_at_ms,
                up_to.seq,
                now.timestamp_millis(),
            ],
        )?;

        Ok(ReadMarker {
            conversation_id,
            user_id: user_id.clone(),
            last_read: up_to,
            updated_at: millis_to_datetime(now.timestamp_millis()),
        })
    }

    pub fn read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
    ) -> ChatResult<Option<ReadMarker>> {
        let conn = self.conn.lock();

        let found = conn
            .query_row(
                "SELECT last_read_ms, last_read_seq, updated_at_ms FROM read_markers
                 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.as_str()],
                |row| {
                    Ok(ReadMarker {
                        conversation_id,
                        user_id: user_id.clone(),
                        last_read: OrderKey::new(row.get(0)?, row.get(1)?),
                        updated_at: millis_to_datetime(row.get(2)?),
                    })
                },
            )
            .optional()?;

        Ok(found)
    }

    /// Messages from the other participant after the user's read marker.
    pub fn unread_count(&self, conversation_id: ConversationId, user_id: &UserId) -> ChatResult<u64> {
        let conn = self.conn.lock();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages m
             LEFT JOIN read_markers r
               ON r.conversation_id = m.conversation_id AND r.user_id = ?2
             WHERE m.conversation_id = ?1
               AND m.sender_id <> ?2
               AND (r.user_id IS NULL
                    OR m.created_at_ms > r.last_read_ms
                    OR (m.created_at_ms = r.last_read_ms AND m.seq > r.last_read_seq))",
            params![conversation_id.to_string(), user_id.as_str()],
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }
}
