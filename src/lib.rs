//! # market-chat
//!
//! Listing-scoped buyer/seller messaging for a student marketplace.
//!
//! ## Features
//!
//! - **One conversation per (listing, buyer, seller)**: concurrent "contact
//!   seller" clicks converge on a single conversation through a storage
//!   uniqueness constraint
//! - **Ordered append-only log**: every reader sees the same message order,
//!   and cursors resume without gaps or duplicates
//! - **Realtime delivery**: committed messages fan out to per-conversation
//!   subscribers over WebSocket
//! - **Inbox views**: counterpart profile, listing summary, last message and
//!   unread count, with placeholders when directory data is missing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use market_chat::config::ChatConfig;
//! use market_chat::model::{ListingId, UserId};
//! use market_chat::{ChatService, Database};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let db = Database::in_memory()?;
//!     db.initialize()?;
//!     let service = ChatService::new(db, &ChatConfig::default());
//!
//!     let buyer = UserId::parse("buyer-1")?;
//!     let listing = ListingId::parse("listing-42")?;
//!     let conversation = service
//!         .start_conversation(&buyer, &listing, None)
//!         .await?
//!         .conversation;
//!     service
//!         .send_message(conversation.id, &buyer, "Is this still available?", None)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod config;
pub mod directory;
pub mod error;
pub mod model;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export main types for library consumers
pub use chat::ChatService;
pub use config::ChatConfig;
pub use error::{ChatError, ChatResult, RetryPolicy};
pub use storage::{ChatStore, Database};
pub use sync::{DeliveryHub, Publisher, Subscription};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
