use rusqlite::{params, OptionalExtension, Row};

use super::db::{is_check_violation, is_unique_violation, parse_column, Database};
use crate::error::{ChatError, ChatResult};
use crate::model::message::millis_to_datetime;
use crate::model::{Conversation, ConversationId, InsertOutcome, ListingId, UserId};

const CONVERSATION_COLUMNS: &str = "id, listing_id, buyer_id, seller_id, created_at_ms";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: parse_column(0, row.get(0)?)?,
        listing_id: parse_column(1, row.get(1)?)?,
        buyer_id: parse_column(2, row.get(2)?)?,
        seller_id: parse_column(3, row.get(3)?)?,
        created_at: millis_to_datetime(row.get(4)?),
    })
}

impl Database {
    pub fn find_conversation(
        &self,
        listing_id: &ListingId,
        buyer_id: &UserId,
        seller_id: &UserId,
    ) -> ChatResult<Option<Conversation>> {
        let conn = self.conn.lock();

        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE listing_id = ?1 AND buyer_id = ?2 AND seller_id = ?3"
        );
        let found = conn
            .query_row(
                &sql,
                params![listing_id.as_str(), buyer_id.as_str(), seller_id.as_str()],
                conversation_from_row,
            )
            .optional()?;

        Ok(found)
    }

    /// Insert guarded by the `(listing, buyer, seller)` uniqueness
    /// constraint. A lost race comes back as [`InsertOutcome::Conflict`].
    pub fn insert_conversation(&self, conversation: &Conversation) -> ChatResult<InsertOutcome> {
        let conn = self.conn.lock();

        let result = conn.execute(
            "INSERT INTO conversations (id, listing_id, buyer_id, seller_id, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation.id.to_string(),
                conversation.listing_id.as_str(),
                conversation.buyer_id.as_str(),
                conversation.seller_id.as_str(),
                conversation.created_at.timestamp_millis(),
            ],
        );

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(conversation.clone())),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::Conflict),
            Err(err) if is_check_violation(&err) => Err(ChatError::InvalidParticipants(
                "buyer and seller must differ".to_string(),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_conversation(&self, id: ConversationId) -> ChatResult<Option<Conversation>> {
        let conn = self.conn.lock();

        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
        let found = conn
            .query_row(&sql, params![id.to_string()], conversation_from_row)
            .optional()?;

        Ok(found)
    }

    /// Conversations the user takes part in, most recent activity first.
    pub fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT c.id, c.listing_id, c.buyer_id, c.seller_id, c.created_at_ms,
                    COALESCE(
                        (SELECT MAX(m.created_at_ms) FROM messages m WHERE m.conversation_id = c.id),
                        c.created_at_ms
                    ) AS last_activity
             FROM conversations c
             WHERE c.buyer_id = ?1 OR c.seller_id = ?1
             ORDER BY last_activity DESC, c.id ASC",
        )?;
        let rows = stmt.query_map(params![user_id.as_str()], conversation_from_row)?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_conversations(
        &self,
        listing_id: &ListingId,
        buyer_id: &UserId,
        seller_id: &UserId,
    ) -> ChatResult<u64> {
        let conn = self.conn.lock();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations
             WHERE listing_id = ?1 AND buyer_id = ?2 AND seller_id = ?3",
            params![listing_id.as_str(), buyer_id.as_str(), seller_id.as_str()],
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }
}
