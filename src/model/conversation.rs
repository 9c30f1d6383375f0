use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, ListingId, UserId};

/// A two-party channel between a buyer and a seller about one listing.
/// Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Buyer,
    Seller,
}

impl Conversation {
    pub fn role_of(&self, user: &UserId) -> Option<ParticipantRole> {
        if *user == self.buyer_id {
            Some(ParticipantRole::Buyer)
        } else if *user == self.seller_id {
            Some(ParticipantRole::Seller)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        self.role_of(user).is_some()
    }

    pub fn counterpart_of(&self, user: &UserId) -> Option<&UserId> {
        match self.role_of(user)? {
            ParticipantRole::Buyer => Some(&self.seller_id),
            ParticipantRole::Seller => Some(&self.buyer_id),
        }
    }
}

/// Outcome of create-or-fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub conversation: Conversation,
    /// `true` only for the caller whose insert won.
    pub created: bool,
}

/// Result of a raw insert attempt against the uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Conversation),
    /// Another writer already owns the `(listing, buyer, seller)` triple.
    Conflict,
}
