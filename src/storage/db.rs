use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::directory::{ListingDirectory, ListingRecord, ProfileDirectory, ProfileRecord};
use crate::error::{ChatError, ChatResult};
use crate::model::{ListingId, UserId};

#[derive(Clone)]
pub struct Database {
    pub conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `db_path`.
    pub fn open(db_path: &Path) -> ChatResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> ChatResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn initialize(&self) -> ChatResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                listing_id TEXT NOT NULL,
                buyer_id TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                UNIQUE (listing_id, buyer_id, seller_id),
                CHECK (buyer_id <> seller_id)
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_buyer
                ON conversations(buyer_id);

            CREATE INDEX IF NOT EXISTS idx_conversations_seller
                ON conversations(seller_id);

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                FOREIGN KEY(conversation_id) REFERENCES conversations(id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_order
                ON messages(conversation_id, created_at_ms, seq);

            CREATE TABLE IF NOT EXISTS read_markers (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                last_read_ms INTEGER NOT NULL,
                last_read_seq INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id),
                FOREIGN KEY(conversation_id) REFERENCES conversations(id)
            );

            CREATE TABLE IF NOT EXISTS listings (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                category TEXT,
                images TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                full_name TEXT,
                avatar_url TEXT
            );",
        )?;

        Ok(())
    }

    pub fn upsert_listing(&self, listing: &ListingRecord) -> ChatResult<()> {
        let conn = self.conn.lock();
        let images = serde_json::to_string(&listing.images)
            .map_err(|err| ChatError::StorageUnavailable(err.to_string()))?;

        conn.execute(
            "INSERT INTO listings (id, owner_id, title, category, images)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                title = excluded.title,
                category = excluded.category,
                images = excluded.images",
            params![
                listing.id.as_str(),
                listing.owner_id.as_str(),
                listing.title,
                listing.category,
                images,
            ],
        )?;

        Ok(())
    }

    /// Removes the mirrored listing. Existing conversations keep their
    /// reference and render with placeholders.
    pub fn remove_listing(&self, id: &ListingId) -> ChatResult<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM listings WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    pub fn upsert_profile(&self, profile: &ProfileRecord) -> ChatResult<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO profiles (id, full_name, avatar_url)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                full_name = excluded.full_name,
                avatar_url = excluded.avatar_url",
            params![profile.id.as_str(), profile.full_name, profile.avatar_url],
        )?;

        Ok(())
    }
}

impl ListingDirectory for Database {
    fn listing(&self, id: &ListingId) -> ChatResult<Option<ListingRecord>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, owner_id, title, category, images FROM listings WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    let images: String = row.get(4)?;
                    Ok(ListingRecord {
                        id: parse_column(0, row.get(0)?)?,
                        owner_id: parse_column(1, row.get(1)?)?,
                        title: row.get(2)?,
                        category: row.get(3)?,
                        images: serde_json::from_str(&images).unwrap_or_default(),
                    })
                },
            )
            .optional()?;

        Ok(row)
    }
}

impl ProfileDirectory for Database {
    fn profile(&self, id: &UserId) -> ChatResult<Option<ProfileRecord>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, full_name, avatar_url FROM profiles WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(ProfileRecord {
                        id: parse_column(0, row.get(0)?)?,
                        full_name: row.get(1)?,
                        avatar_url: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }
}

/// Parse a TEXT column into a typed id, reporting failures as column
/// conversion errors.
pub(crate) fn parse_column<T>(index: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub(crate) fn is_check_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_CHECK
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn initialize_is_idempotent() {
        let db = db();
        db.initialize().unwrap();
    }

    #[test]
    fn listing_upsert_and_lookup() {
        let db = db();
        let listing = ListingRecord {
            id: ListingId::parse("l1").unwrap(),
            owner_id: UserId::parse("seller").unwrap(),
            title: "Calculus textbook".into(),
            category: Some("Books".into()),
            images: vec!["https://img/1.jpg".into(), "https://img/2.jpg".into()],
        };
        db.upsert_listing(&listing).unwrap();

        let found = db.listing(&listing.id).unwrap().unwrap();
        assert_eq!(found, listing);

        assert!(db.remove_listing(&listing.id).unwrap());
        assert!(db.listing(&listing.id).unwrap().is_none());
    }

    #[test]
    fn profile_upsert_overwrites() {
        let db = db();
        let id = UserId::parse("u1").unwrap();
        db.upsert_profile(&ProfileRecord {
            id: id.clone(),
            full_name: None,
            avatar_url: None,
        })
        .unwrap();
        db.upsert_profile(&ProfileRecord {
            id: id.clone(),
            full_name: Some("Ada".into()),
            avatar_url: Some("https://a/ada.png".into()),
        })
        .unwrap();

        let profile = db.profile(&id).unwrap().unwrap();
        assert_eq!(profile.full_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        {
            let db = Database::open(&path).unwrap();
            db.initialize().unwrap();
            db.upsert_profile(&ProfileRecord {
                id: UserId::parse("u1").unwrap(),
                full_name: Some("Ada".into()),
                avatar_url: None,
            })
            .unwrap();
        }

        let reopened = Database::open(&path).unwrap();
        let profile = reopened.profile(&UserId::parse("u1").unwrap()).unwrap();
        assert!(profile.is_some());
    }
}
