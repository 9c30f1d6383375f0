use crate::error::{ChatError, ChatResult};
use crate::model::{Conversation, ConversationId, UserId};
use crate::storage::ChatStore;

/// Load a conversation on behalf of `caller`.
///
/// Unknown ids and non-participants both yield [`ChatError::Forbidden`].
pub(crate) fn authorize(
    store: &dyn ChatStore,
    conversation_id: ConversationId,
    caller: &UserId,
) -> ChatResult<Conversation> {
    match store.get_conversation(conversation_id)? {
        Some(conversation) if conversation.is_participant(caller) => Ok(conversation),
        _ => {
            tracing::debug!(%conversation_id, %caller, "access denied");
            Err(ChatError::Forbidden)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ListingId;
    use crate::storage::Database;
    use chrono::Utc;

    fn setup() -> (Database, Conversation) {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let convo = Conversation {
            id: ConversationId::new(),
            listing_id: ListingId::parse("l1").unwrap(),
            buyer_id: UserId::parse("buyer").unwrap(),
            seller_id: UserId::parse("seller").unwrap(),
            created_at: Utc::now(),
        };
        db.insert_conversation(&convo).unwrap();
        (db, convo)
    }

    #[test]
    fn participants_pass() {
        let (db, convo) = setup();
        assert_eq!(authorize(&db, convo.id, &convo.buyer_id).unwrap().id, convo.id);
        assert_eq!(authorize(&db, convo.id, &convo.seller_id).unwrap().id, convo.id);
    }

    #[test]
    fn stranger_and_unknown_id_look_the_same() {
        let (db, convo) = setup();
        let stranger = UserId::parse("z").unwrap();

        assert_eq!(
            authorize(&db, convo.id, &stranger),
            Err(ChatError::Forbidden)
        );
        assert_eq!(
            authorize(&db, ConversationId::new(), &convo.buyer_id),
            Err(ChatError::Forbidden)
        );
    }
}
