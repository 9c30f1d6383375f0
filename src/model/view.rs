use serde::{Deserialize, Serialize};

use super::conversation::{Conversation, ParticipantRole};
use super::ids::{ListingId, UserId};
use super::message::Message;

pub const PLACEHOLDER_DISPLAY_NAME: &str = "Marketplace user";
pub const PLACEHOLDER_LISTING_TITLE: &str = "Listing unavailable";
pub const PLACEHOLDER_CATEGORY: &str = "Uncategorized";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// `false` when the name is a placeholder.
    pub complete: bool,
}

impl ProfileSummary {
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: PLACEHOLDER_DISPLAY_NAME.to_string(),
            avatar_url: None,
            complete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub listing_id: ListingId,
    pub title: String,
    pub category: String,
    pub thumbnail_url: Option<String>,
    /// `false` when the listing was removed and the fields are placeholders.
    pub available: bool,
}

impl ListingSummary {
    pub fn placeholder(listing_id: ListingId) -> Self {
        Self {
            listing_id,
            title: PLACEHOLDER_LISTING_TITLE.to_string(),
            category: PLACEHOLDER_CATEGORY.to_string(),
            thumbnail_url: None,
            available: false,
        }
    }
}

/// Display-ready conversation as seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub viewer_role: ParticipantRole,
    pub buyer: ProfileSummary,
    pub seller: ProfileSummary,
    pub listing: ListingSummary,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

impl ConversationView {
    pub fn counterpart(&self) -> &ProfileSummary {
        match self.viewer_role {
            ParticipantRole::Buyer => &self.seller,
            ParticipantRole::Seller => &self.buyer,
        }
    }
}
