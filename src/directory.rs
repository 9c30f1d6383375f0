//! Read-only views of the external listing and profile stores.
//!
//! The messaging core only needs a listing's owner and summary, and a
//! profile's name and avatar. Everything else about those records belongs
//! to the surrounding application.

use serde::{Deserialize, Serialize};

use crate::error::ChatResult;
use crate::model::{ListingId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: ListingId,
    pub owner_id: UserId,
    pub title: String,
    pub category: Option<String>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: UserId,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

pub trait ListingDirectory: Send + Sync {
    fn listing(&self, id: &ListingId) -> ChatResult<Option<ListingRecord>>;
}

/// Never consulted for authorization.
pub trait ProfileDirectory: Send + Sync {
    fn profile(&self, id: &UserId) -> ChatResult<Option<ProfileRecord>>;
}
