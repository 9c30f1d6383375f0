pub mod conversation;
pub mod ids;
pub mod message;
pub mod view;

pub use conversation::{Conversation, InsertOutcome, ParticipantRole, Resolution};
pub use ids::{ConversationId, ListingId, MessageId, UserId};
pub use message::{Message, MessagePage, NewMessage, OrderKey, ReadMarker};
pub use view::{ConversationView, ListingSummary, ProfileSummary};
