use chrono::Utc;

use crate::directory::{ListingDirectory, ListingRecord};
use crate::error::{ChatError, ChatResult};
use crate::model::message::millis_to_datetime;
use crate::model::{Conversation, ConversationId, InsertOutcome, ListingId, Resolution, UserId};
use crate::storage::ChatStore;

/// Create-or-fetch the conversation for `(listing, buyer, seller)`.
///
/// An existing conversation is returned as-is. The listing is only consulted
/// when a new conversation has to be created.
pub(crate) fn resolve(
    store: &dyn ChatStore,
    listings: &dyn ListingDirectory,
    listing_id: &ListingId,
    buyer_id: &UserId,
    seller_id: &UserId,
) -> ChatResult<Resolution> {
    if buyer_id == seller_id {
        return Err(ChatError::InvalidParticipants(
            "a user cannot open a conversation with themselves".to_string(),
        ));
    }

    if let Some(conversation) = store.find_conversation(listing_id, buyer_id, seller_id)? {
        return Ok(Resolution {
            conversation,
            created: false,
        });
    }

    let listing = listings
        .listing(listing_id)?
        .ok_or_else(|| ChatError::ListingNotFound(listing_id.to_string()))?;
    if listing.owner_id != *seller_id {
        return Err(ChatError::InvalidParticipants(format!(
            "{seller_id} does not own listing {listing_id}"
        )));
    }

    create(store, listing_id, buyer_id, seller_id)
}

/// Insert a new conversation, and on a lost race re-read the winner's row.
fn create(
    store: &dyn ChatStore,
    listing_id: &ListingId,
    buyer_id: &UserId,
    seller_id: &UserId,
) -> ChatResult<Resolution> {
    let candidate = Conversation {
        id: ConversationId::new(),
        listing_id: listing_id.clone(),
        buyer_id: buyer_id.clone(),
        seller_id: seller_id.clone(),
        // Stored with millisecond precision.
        created_at: millis_to_datetime(Utc::now().timestamp_millis()),
    };

    match store.insert_conversation(&candidate)? {
        InsertOutcome::Inserted(conversation) => {
            tracing::info!(
                conversation_id = %conversation.id,
                listing_id = %listing_id,
                buyer_id = %buyer_id,
                seller_id = %seller_id,
                "conversation started"
            );
            Ok(Resolution {
                conversation,
                created: true,
            })
        }
        InsertOutcome::Conflict => {
            tracing::debug!(%listing_id, %buyer_id, %seller_id, "lost creation race, re-reading");
            store
                .find_conversation(listing_id, buyer_id, seller_id)?
                .map(|conversation| Resolution {
                    conversation,
                    created: false,
                })
                .ok_or_else(|| {
                    ChatError::StorageUnavailable(
                        "conversation missing after uniqueness conflict".to_string(),
                    )
                })
        }
    }
}

/// Work out `(buyer, seller)` for a contact action by `caller` on `listing`.
///
/// A non-owner is always the buyer. The owner may resume a conversation with
/// a specific buyer, who must then be named as the counterpart.
pub(crate) fn participants_for(
    caller: &UserId,
    listing: &ListingRecord,
    counterpart: Option<&UserId>,
) -> ChatResult<(UserId, UserId)> {
    if *caller == listing.owner_id {
        return match counterpart {
            Some(buyer) if *buyer != listing.owner_id => Ok((buyer.clone(), caller.clone())),
            Some(_) => Err(ChatError::InvalidParticipants(
                "you cannot contact yourself about your own listing".to_string(),
            )),
            None => Err(ChatError::InvalidParticipants(
                "the listing owner must name the buyer".to_string(),
            )),
        };
    }

    match counterpart {
        Some(other) if *other != listing.owner_id => Err(ChatError::InvalidParticipants(format!(
            "{other} does not own listing {}",
            listing.id
        ))),
        _ => Ok((caller.clone(), listing.owner_id.clone())),
    }
}
