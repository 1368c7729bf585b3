//! Persistence port for messages and group membership, plus its SQLite
//! implementation.
//!
//! All methods block. Async callers run them inside
//! `tokio::task::spawn_blocking`.

use chrono::Utc;
use dashmap::DashSet;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;
use std::sync::MutexGuard;

use crate::chat::message::{Addressing, GroupId, Message, NewMessage, UserId};
use crate::chat::time;
use crate::db::models::{GroupRow, UserRow};
use crate::db::DbPool;
use crate::error::StoreError;

/// What the realtime core needs from durable storage.
pub trait MessageStore: Send + Sync + 'static {
    /// Durably record a message and return it with its assigned id.
    fn append(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Current members of a group. Unknown or deleted groups yield an
    /// empty set, never an error.
    fn list_group_members(&self, group_id: GroupId) -> HashSet<UserId>;

    /// Messages exchanged between two users, oldest first.
    fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<Message>, StoreError>;

    /// Messages addressed to a group, oldest first.
    fn group_history(&self, group_id: GroupId) -> Result<Vec<Message>, StoreError>;
}

pub struct SqliteStore {
    db: DbPool,
    /// Identities already written to `users` by this process.
    recorded: DashSet<UserId>,
}

const MESSAGE_COLUMNS: &str = "id, content, sender_id, receiver_id, group_id, created_at";

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self {
            db,
            recorded: DashSet::new(),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Whether `record_identity` already ran for `user_id` in this process.
    pub fn is_recorded(&self, user_id: UserId) -> bool {
        self.recorded.contains(&user_id)
    }

    /// Remember an authenticated identity. Idempotent; only the first call
    /// per identity touches the database.
    pub fn record_identity(&self, user_id: UserId) -> Result<(), StoreError> {
        if self.is_recorded(user_id) {
            return Ok(());
        }
        {
            let conn = self.conn()?;
            insert_identity(&conn, user_id, &time::to_stored(Utc::now()))?;
        }
        self.recorded.insert(user_id);
        Ok(())
    }

    pub fn find_user(&self, user_id: UserId) -> Result<Option<UserRow>, StoreError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, first_seen_at FROM users WHERE id = ?1",
                rusqlite::params![user_id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        first_seen_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Create a group. The creator is always a member; duplicate ids in
    /// `members` are ignored. Members not seen before are recorded.
    pub fn create_group(
        &self,
        name: &str,
        created_by: UserId,
        members: &[UserId],
    ) -> Result<GroupRow, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created_at = time::to_stored(Utc::now());

        insert_identity(&tx, created_by, &created_at)?;
        tx.execute(
            "INSERT INTO chat_groups (name, created_by, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![name, created_by, created_at],
        )?;
        let group_id = tx.last_insert_rowid();

        for member in std::iter::once(&created_by).chain(members.iter()) {
            insert_identity(&tx, *member, &created_at)?;
            tx.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![group_id, member, created_at],
            )?;
        }
        tx.commit()?;

        Ok(GroupRow {
            id: group_id,
            name: name.to_string(),
            created_by,
            created_at,
        })
    }

    pub fn find_group(&self, group_id: GroupId) -> Result<Option<GroupRow>, StoreError> {
        let conn = self.conn()?;
        let group = conn
            .query_row(
                "SELECT id, name, created_by, created_at FROM chat_groups WHERE id = ?1",
                rusqlite::params![group_id],
                |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_by: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(group)
    }

    pub fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            rusqlite::params![group_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns false if the user was already a member.
    pub fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let joined_at = time::to_stored(Utc::now());
        insert_identity(&tx, user_id, &joined_at)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![group_id, user_id, joined_at],
        )?;
        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Returns false if the user was not a member.
    pub fn remove_group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            rusqlite::params![group_id, user_id],
        )?;
        Ok(removed > 0)
    }

    /// Delete a group and its memberships. Its messages stay in history.
    pub fn delete_group(&self, group_id: GroupId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM chat_groups WHERE id = ?1",
            rusqlite::params![group_id],
        )?;
        Ok(removed > 0)
    }

    fn query_members(&self, group_id: GroupId) -> Result<HashSet<UserId>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
        let members = stmt
            .query_map(rusqlite::params![group_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(members)
    }
}

impl MessageStore for SqliteStore {
    fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (content, sender_id, receiver_id, group_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                message.content,
                message.sender_id,
                message.addressing.receiver_id(),
                message.addressing.group_id(),
                time::to_stored(message.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(message.into_persisted(id))
    }

    fn list_group_members(&self, group_id: GroupId) -> HashSet<UserId> {
        match self.query_members(group_id) {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(group_id, error = %e, "Failed to read group membership");
                HashSet::new()
            }
        }
    }

    fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, id ASC"
        ))?;
        let messages = stmt
            .query_map(rusqlite::params![a, b], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn group_history(&self, group_id: GroupId) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE group_id = ?1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let messages = stmt
            .query_map(rusqlite::params![group_id], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }
}

fn insert_identity(conn: &Connection, user_id: UserId, seen_at: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO users (id, first_seen_at) VALUES (?1, ?2)",
        rusqlite::params![user_id, seen_at],
    )
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let receiver_id: Option<i64> = row.get(3)?;
    let group_id: Option<i64> = row.get(4)?;
    let created_at: String = row.get(5)?;

    let addressing = Addressing::from_parts(receiver_id, group_id).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Null,
            "message row has no single addressing mode".into(),
        )
    })?;
    let created_at = time::from_stored(&created_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(Message {
        id: row.get(0)?,
        content: row.get(1)?,
        sender_id: row.get(2)?,
        addressing,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn store() -> SqliteStore {
        SqliteStore::new(crate::db::open_in_memory().unwrap())
    }

    fn direct(sender: UserId, receiver: UserId, content: &str, minute: u32) -> NewMessage {
        NewMessage {
            content: content.to_string(),
            sender_id: sender,
            addressing: Addressing::Direct(receiver),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
        }
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let store = store();
        let first = store.append(direct(1, 2, "a", 0)).unwrap();
        let second = store.append(direct(2, 1, "b", 1)).unwrap();
        assert!(second.id > first.id);
        assert_eq!(first.content, "a");
        assert_eq!(first.addressing, Addressing::Direct(2));
    }

    #[test]
    fn direct_history_covers_both_directions_in_time_order() {
        let store = store();
        store.append(direct(2, 1, "second", 5)).unwrap();
        store.append(direct(1, 2, "first", 1)).unwrap();
        store.append(direct(1, 3, "elsewhere", 2)).unwrap();

        let history = store.direct_history(1, 2).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(store.direct_history(2, 1).unwrap(), history);
    }

    #[test]
    fn history_preserves_timestamp() {
        let store = store();
        let mut message = direct(1, 2, "precise", 0);
        message.created_at += Duration::microseconds(123_456);
        let stored = store.append(message.clone()).unwrap();
        let history = store.direct_history(1, 2).unwrap();
        assert_eq!(history[0].created_at, message.created_at);
        assert_eq!(history[0].id, stored.id);
    }

    #[test]
    fn group_membership_includes_creator_and_tracks_changes() {
        let store = store();
        let (alice, bob, carol) = (1, 2, 3);

        let group = store.create_group("team", alice, &[bob, bob]).unwrap();
        assert_eq!(store.list_group_members(group.id), HashSet::from([alice, bob]));

        assert!(store.add_group_member(group.id, carol).unwrap());
        assert!(!store.add_group_member(group.id, carol).unwrap());
        assert!(store.remove_group_member(group.id, bob).unwrap());
        assert_eq!(store.list_group_members(group.id), HashSet::from([alice, carol]));
        assert!(store.is_member(group.id, carol).unwrap());
        assert!(!store.is_member(group.id, bob).unwrap());
    }

    #[test]
    fn unknown_or_deleted_group_has_no_members() {
        let store = store();
        assert!(store.list_group_members(404).is_empty());

        let alice = 1;
        let group = store.create_group("gone", alice, &[]).unwrap();
        store
            .append(NewMessage {
                content: "before delete".to_string(),
                sender_id: alice,
                addressing: Addressing::Group(group.id),
                created_at: Utc::now(),
            })
            .unwrap();
        assert!(store.delete_group(group.id).unwrap());
        assert!(store.list_group_members(group.id).is_empty());
        assert!(store.find_group(group.id).unwrap().is_none());
        assert_eq!(store.group_history(group.id).unwrap().len(), 1);
    }

    #[test]
    fn recorded_identities_are_found() {
        let store = store();
        assert!(store.find_user(7).unwrap().is_none());
        assert!(!store.is_recorded(7));

        store.record_identity(7).unwrap();
        store.record_identity(7).unwrap();
        assert!(store.is_recorded(7));
        assert_eq!(store.find_user(7).unwrap().unwrap().id, 7);
        assert!(store.find_user(8).unwrap().is_none());
    }

    #[test]
    fn group_writes_record_member_identities() {
        let store = store();
        let group = store.create_group("team", 10, &[11]).unwrap();
        store.add_group_member(group.id, 12).unwrap();
        for user_id in [10, 11, 12] {
            assert!(store.find_user(user_id).unwrap().is_some());
        }
    }
}
