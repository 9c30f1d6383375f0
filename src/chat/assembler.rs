use crate::directory::{ListingDirectory, ProfileDirectory};
use crate::error::{ChatError, ChatResult};
use crate::model::{
    Conversation, ConversationView, ListingId, ListingSummary, ProfileSummary, UserId,
};
use crate::storage::ChatStore;

/// Join a conversation with display summaries for `viewer`.
///
/// Directory misses and directory errors become placeholders; only store
/// failures fail the view.
pub(crate) fn assemble(
    store: &dyn ChatStore,
    listings: &dyn ListingDirectory,
    profiles: &dyn ProfileDirectory,
    conversation: Conversation,
    viewer: &UserId,
) -> ChatResult<ConversationView> {
    let viewer_role = conversation.role_of(viewer).ok_or(ChatError::Forbidden)?;

    let last_message = store.last_message(conversation.id)?;
    let unread_count = store.unread_count(conversation.id, viewer)?;

    Ok(ConversationView {
        viewer_role,
        buyer: profile_summary(profiles, &conversation.buyer_id),
        seller: profile_summary(profiles, &conversation.seller_id),
        listing: listing_summary(listings, &conversation.listing_id),
        last_message,
        unread_count,
        conversation,
    })
}

fn profile_summary(profiles: &dyn ProfileDirectory, user_id: &UserId) -> ProfileSummary {
    let record = match profiles.profile(user_id) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(%user_id, error = %err, "profile lookup failed, using placeholder");
            None
        }
    };

    let Some(record) = record else {
        return ProfileSummary::placeholder(user_id.clone());
    };

    let name = record
        .full_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    let avatar_url = record.avatar_url.filter(|url| !url.trim().is_empty());

    match name {
        Some(display_name) => ProfileSummary {
            user_id: user_id.clone(),
            display_name,
            avatar_url,
            complete: true,
        },
        None => ProfileSummary {
            avatar_url,
            ..ProfileSummary::placeholder(user_id.clone())
        },
    }
}

fn listing_summary(listings: &dyn ListingDirectory, listing_id: &ListingId) -> ListingSummary {
    let record = match listings.listing(listing_id) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(%listing_id, error = %err, "listing lookup failed, using placeholder");
            None
        }
    };

    match record {
        Some(listing) => {
            let placeholder = ListingSummary::placeholder(listing_id.clone());
            ListingSummary {
                listing_id: listing_id.clone(),
                title: Some(listing.title)
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or(placeholder.title),
                category: listing
                    .category
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or(placeholder.category),
                thumbnail_url: listing.images.into_iter().next(),
                available: true,
            }
        }
        None => ListingSummary::placeholder(listing_id.clone()),
    }
}
