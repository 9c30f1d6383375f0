//! Client-facing messaging operations.
//!
//! [`ChatService`] is the only entry point the rest of the application uses:
//! every call authorizes the caller, runs blocking storage work off the async
//! runtime, and retries transient storage failures under the configured
//! [`RetryPolicy`].

mod assembler;
mod guard;
mod resolver;

use std::sync::Arc;

use futures::{stream, Stream, StreamExt, TryStreamExt};

use crate::config::{ChatConfig, LimitSettings};
use crate::directory::{ListingDirectory, ProfileDirectory};
use crate::error::{with_retry, ChatError, ChatResult, RetryPolicy};
use crate::model::{
    ConversationId, ConversationView, ListingId, Message, MessageId, MessagePage, NewMessage,
    OrderKey, ReadMarker, Resolution, UserId,
};
use crate::storage::{ChatStore, Database};
use crate::sync::{DeliveryHub, Publisher, Subscription};

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    listings: Arc<dyn ListingDirectory>,
    profiles: Arc<dyn ProfileDirectory>,
    publisher: Arc<dyn Publisher>,
    hub: DeliveryHub,
    retry: RetryPolicy,
    limits: LimitSettings,
}

impl ChatService {
    /// Wire everything to one SQLite database and an in-process hub.
    pub fn new(db: Database, config: &ChatConfig) -> Self {
        let db = Arc::new(db);
        let hub = DeliveryHub::new(config.delivery.channel_capacity);
        Self {
            store: db.clone(),
            listings: db.clone(),
            profiles: db,
            publisher: Arc::new(hub.clone()),
            hub,
            retry: RetryPolicy::from(&config.retry),
            limits: config.limits.clone(),
        }
    }

    /// Assemble from arbitrary backends.
    pub fn from_parts(
        store: Arc<dyn ChatStore>,
        listings: Arc<dyn ListingDirectory>,
        profiles: Arc<dyn ProfileDirectory>,
        hub: DeliveryHub,
    ) -> Self {
        Self {
            store,
            listings,
            profiles,
            publisher: Arc::new(hub.clone()),
            hub,
            retry: RetryPolicy::default(),
            limits: LimitSettings::default(),
        }
    }

    /// Replace the publisher that runs on commit. Subscriptions still come
    /// from the hub.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_limits(mut self, limits: LimitSettings) -> Self {
        self.limits = limits;
        self
    }

    pub fn hub(&self) -> &DeliveryHub {
        &self.hub
    }

    pub fn limits(&self) -> &LimitSettings {
        &self.limits
    }

    /// Create-or-fetch the conversation for an explicit triple.
    pub async fn resolve_conversation(
        &self,
        listing_id: &ListingId,
        buyer_id: &UserId,
        seller_id: &UserId,
    ) -> ChatResult<Resolution> {
        with_retry(&self.retry, "resolve_conversation", || {
            let store = self.store.clone();
            let listings = self.listings.clone();
            let (listing_id, buyer_id, seller_id) =
                (listing_id.clone(), buyer_id.clone(), seller_id.clone());
            blocking(move || {
                resolver::resolve(
                    store.as_ref(),
                    listings.as_ref(),
                    &listing_id,
                    &buyer_id,
                    &seller_id,
                )
            })
        })
        .await
    }

    /// "Contact seller": start or resume the caller's conversation about a
    /// listing. The listing owner must name the buyer as `counterpart`.
    pub async fn start_conversation(
        &self,
        caller: &UserId,
        listing_id: &ListingId,
        counterpart: Option<&UserId>,
    ) -> ChatResult<Resolution> {
        with_retry(&self.retry, "start_conversation", || {
            let store = self.store.clone();
            let listings = self.listings.clone();
            let caller = caller.clone();
            let listing_id = listing_id.clone();
            let counterpart = counterpart.cloned();
            blocking(move || {
                let listing = listings
                    .listing(&listing_id)?
                    .ok_or_else(|| ChatError::ListingNotFound(listing_id.to_string()))?;
                let (buyer_id, seller_id) =
                    resolver::participants_for(&caller, &listing, counterpart.as_ref())?;
                resolver::resolve(
                    store.as_ref(),
                    listings.as_ref(),
                    &listing_id,
                    &buyer_id,
                    &seller_id,
                )
            })
        })
        .await
    }

    /// Every conversation the caller takes part in, latest activity first.
    pub async fn list_conversations(&self, caller: &UserId) -> ChatResult<Vec<ConversationView>> {
        with_retry(&self.retry, "list_conversations", || {
            let (store, listings, profiles) = self.backends();
            let caller = caller.clone();
            blocking(move || {
                store
                    .conversations_for(&caller)?
                    .into_iter()
                    .map(|conversation| {
                        assembler::assemble(
                            store.as_ref(),
                            listings.as_ref(),
                            profiles.as_ref(),
                            conversation,
                            &caller,
                        )
                    })
                    .collect()
            })
        })
        .await
    }

    pub async fn open_conversation(
        &self,
        conversation_id: ConversationId,
        caller: &UserId,
    ) -> ChatResult<ConversationView> {
        with_retry(&self.retry, "open_conversation", || {
            let (store, listings, profiles) = self.backends();
            let caller = caller.clone();
            blocking(move || {
                let conversation = guard::authorize(store.as_ref(), conversation_id, &caller)?;
                assembler::assemble(
                    store.as_ref(),
                    listings.as_ref(),
                    profiles.as_ref(),
                    conversation,
                    &caller,
                )
            })
        })
        .await
    }

    /// Append a message. Returns once the message is durable; delivery to
    /// subscribers is best effort and never fails the send.
    ///
    /// Passing the same `client_message_id` again returns the stored message
    /// instead of appending a duplicate.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender: &UserId,
        body: &str,
        client_message_id: Option<MessageId>,
    ) -> ChatResult<Message> {
        // One id for every attempt, so a retried append stays idempotent.
        let message_id = client_message_id.unwrap_or_default();
        let max_body_chars = self.limits.max_body_chars;

        let message = with_retry(&self.retry, "send_message", || {
            let store = self.store.clone();
            let publisher = self.publisher.clone();
            let sender = sender.clone();
            let body = body.to_string();
            blocking(move || {
                guard::authorize(store.as_ref(), conversation_id, &sender)?;
                let input = NewMessage::validated(
                    conversation_id,
                    sender,
                    &body,
                    max_body_chars,
                    Some(message_id),
                )?;
                store.append_message(&input, &|message| {
                    if let Err(err) = publisher.publish(message) {
                        tracing::warn!(
                            conversation_id = %message.conversation_id,
                            message_id = %message.id,
                            error = %err,
                            "publish failed after commit; subscribers will catch up from the store"
                        );
                    }
                })
            })
        })
        .await?;

        tracing::debug!(
            %conversation_id,
            message_id = %message.id,
            cursor = %message.order_key,
            "message appended"
        );
        Ok(message)
    }

    /// One page of history strictly after `after`.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        requester: &UserId,
        after: Option<OrderKey>,
        limit: Option<usize>,
    ) -> ChatResult<MessagePage> {
        let limit = self.page_limit(limit);

        let messages = with_retry(&self.retry, "list_messages", || {
            let store = self.store.clone();
            let requester = requester.clone();
            blocking(move || {
                guard::authorize(store.as_ref(), conversation_id, &requester)?;
                store.messages_after(conversation_id, after, limit)
            })
        })
        .await?;

        let next_cursor = messages.last().map(|m| m.order_key).or(after);
        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    /// Lazily page through history from `after`. Each page re-checks
    /// authorization; the stream can be dropped and restarted from the last
    /// message's order key.
    pub fn message_stream(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
        after: Option<OrderKey>,
    ) -> impl Stream<Item = ChatResult<Message>> + Send + 'static {
        let service = self.clone();
        let page_size = self.page_limit(None);

        stream::try_unfold(
            (service, requester, after, false),
            move |(service, requester, cursor, exhausted)| async move {
                if exhausted {
                    return Ok::<_, ChatError>(None);
                }
                let page = service
                    .list_messages(conversation_id, &requester, cursor, Some(page_size))
                    .await?;
                if page.messages.is_empty() {
                    return Ok(None);
                }
                let exhausted = page.messages.len() < page_size;
                let next = page.next_cursor;
                Ok(Some((page.messages, (service, requester, next, exhausted))))
            },
        )
        .map_ok(|messages| stream::iter(messages.into_iter().map(Ok::<_, ChatError>)))
        .try_flatten()
        .boxed()
    }

    /// Attach to live deliveries for a conversation the caller belongs to.
    pub async fn subscribe(
        &self,
        conversation_id: ConversationId,
        caller: &UserId,
    ) -> ChatResult<Subscription> {
        with_retry(&self.retry, "subscribe", || {
            let store = self.store.clone();
            let caller = caller.clone();
            blocking(move || guard::authorize(store.as_ref(), conversation_id, &caller))
        })
        .await?;

        Ok(self.hub.subscribe(conversation_id))
    }

    /// Record how far the caller has read. Last write wins.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        caller: &UserId,
        up_to: OrderKey,
    ) -> ChatResult<ReadMarker> {
        with_retry(&self.retry, "mark_read", || {
            let store = self.store.clone();
            let caller = caller.clone();
            blocking(move || {
                guard::authorize(store.as_ref(), conversation_id, &caller)?;
                store.set_read_marker(conversation_id, &caller, up_to)
            })
        })
        .await
    }

    fn page_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.limits.page_size)
            .clamp(1, self.limits.max_page_size.max(1))
    }

    fn backends(
        &self,
    ) -> (
        Arc<dyn ChatStore>,
        Arc<dyn ListingDirectory>,
        Arc<dyn ProfileDirectory>,
    ) {
        (
            self.store.clone(),
            self.listings.clone(),
            self.profiles.clone(),
        )
    }
}

async fn blocking<T, F>(work: F) -> ChatResult<T>
where
    F: FnOnce() -> ChatResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}
