use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;

// Surrogate keys minted by the store.
macro_rules! define_uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(raw.trim()).map(Self)
            }
        }
    };
}

// Opaque identifiers issued by the external user and listing stores.
macro_rules! define_external_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: impl AsRef<str>) -> Result<Self, ChatError> {
                let trimmed = raw.as_ref().trim();
                if trimmed.is_empty() {
                    return Err(ChatError::InvalidParticipants(format!(
                        "{} must not be empty",
                        $label
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ChatError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::parse(raw)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_uuid_id!(ConversationId);
define_uuid_id!(MessageId);

define_external_id!(UserId, "user id");
define_external_id!(ListingId, "listing id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_external_ids_are_rejected() {
        assert!(matches!(
            UserId::parse("   "),
            Err(ChatError::InvalidParticipants(_))
        ));
        assert!(ListingId::parse("").is_err());
    }

    #[test]
    fn external_ids_are_trimmed() {
        let user = UserId::parse("  u-1 ").unwrap();
        assert_eq!(user.as_str(), "u-1");
    }

    #[test]
    fn external_ids_validate_on_deserialize() {
        let parsed: Result<UserId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());

        let user: UserId = serde_json::from_str("\"u-2\"").unwrap();
        assert_eq!(user.to_string(), "u-2");
    }

    #[test]
    fn conversation_ids_parse_from_text() {
        let id = ConversationId::new();
        let parsed: ConversationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ConversationId>().is_err());
    }
}
