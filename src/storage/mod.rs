pub mod conversations;
pub mod db;
pub mod messages;

use anyhow::{Context, Result};
use std::path::Path;

pub use db::Database;

use crate::config::{ChatConfig, CONFIG_FILE, DATA_DIR};
use crate::error::ChatResult;
use crate::model::{
    Conversation, ConversationId, InsertOutcome, ListingId, Message, NewMessage, OrderKey,
    ReadMarker, UserId,
};

/// Durable conversation and message storage.
///
/// Methods are blocking; async callers run them on the blocking pool.
pub trait ChatStore: Send + Sync {
    fn find_conversation(
        &self,
        listing_id: &ListingId,
        buyer_id: &UserId,
        seller_id: &UserId,
    ) -> ChatResult<Option<Conversation>>;

    fn insert_conversation(&self, conversation: &Conversation) -> ChatResult<InsertOutcome>;

    fn get_conversation(&self, id: ConversationId) -> ChatResult<Option<Conversation>>;

    fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>>;

    /// Durably append and call `on_commit` once the write is committed.
    fn append_message(&self, input: &NewMessage, on_commit: &dyn Fn(&Message))
        -> ChatResult<Message>;

    fn messages_after(
        &self,
        conversation_id: ConversationId,
        after: Option<OrderKey>,
        limit: usize,
    ) -> ChatResult<Vec<Message>>;

    fn last_message(&self, conversation_id: ConversationId) -> ChatResult<Option<Message>>;

    fn set_read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
        up_to: OrderKey,
    ) -> ChatResult<ReadMarker>;

    fn unread_count(&self, conversation_id: ConversationId, user_id: &UserId) -> ChatResult<u64>;
}

impl ChatStore for Database {
    fn find_conversation(
        &self,
        listing_id: &ListingId,
        buyer_id: &UserId,
        seller_id: &UserId,
    ) -> ChatResult<Option<Conversation>> {
        Database::find_conversation(self, listing_id, buyer_id, seller_id)
    }

    fn insert_conversation(&self, conversation: &Conversation) -> ChatResult<InsertOutcome> {
        Database::insert_conversation(self, conversation)
    }

    fn get_conversation(&self, id: ConversationId) -> ChatResult<Option<Conversation>> {
        Database::get_conversation(self, id)
    }

    fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        Database::conversations_for(self, user_id)
    }

    fn append_message(
        &self,
        input: &NewMessage,
        on_commit: &dyn Fn(&Message),
    ) -> ChatResult<Message> {
        Database::append_message(self, input, on_commit)
    }

    fn messages_after(
        &self,
        conversation_id: ConversationId,
        after: Option<OrderKey>,
        limit: usize,
    ) -> ChatResult<Vec<Message>> {
        Database::messages_after(self, conversation_id, after, limit)
    }

    fn last_message(&self, conversation_id: ConversationId) -> ChatResult<Option<Message>> {
        Database::last_message(self, conversation_id)
    }

    fn set_read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
        up_to: OrderKey,
    ) -> ChatResult<ReadMarker> {
        Database::set_read_marker(self, conversation_id, user_id, up_to)
    }

    fn unread_count(&self, conversation_id: ConversationId, user_id: &UserId) -> ChatResult<u64> {
        Database::unread_count(self, conversation_id, user_id)
    }
}

/// Create the data directory, the schema, and a default `config.toml`.
/// An existing config file is left untouched.
pub async fn init(root: &Path) -> Result<ChatConfig> {
    let data_dir = root.join(DATA_DIR);
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let config_path = data_dir.join(CONFIG_FILE);
    if !tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
        let defaults = ChatConfig::default();
        tokio::fs::write(&config_path, defaults.to_toml()?).await?;
    }

    let config = ChatConfig::load(root)?;
    open_database(&config.database_path).await?;

    Ok(config)
}

/// Open the database file and make sure the schema exists.
pub async fn open_database(path: &Path) -> Result<Database> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&path)?;
        db.initialize()?;
        anyhow::Ok(db)
    })
    .await
    .context("failed to join database task")?
}
