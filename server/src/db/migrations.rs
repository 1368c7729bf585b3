use rusqlite_migration::{Migrations, M};

/// Schema migrations, tracked through SQLite's user_version pragma.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: Initial schema

-- Identities are issued elsewhere. A row exists once an identity has
-- authenticated here or been added to a group.
CREATE TABLE users (
    id INTEGER PRIMARY KEY,
    first_seen_at TEXT NOT NULL
);

CREATE TABLE chat_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_by INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (created_by) REFERENCES users(id)
);

CREATE TABLE group_members (
    group_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX idx_group_members_user ON group_members(user_id);

-- Messages keep no foreign keys to users or groups: history outlives
-- group deletion, and addressing is validated before append.
CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    sender_id INTEGER NOT NULL,
    receiver_id INTEGER,
    group_id INTEGER,
    created_at TEXT NOT NULL,
    CHECK ((receiver_id IS NULL) <> (group_id IS NULL))
);

CREATE INDEX idx_messages_direct ON messages(sender_id, receiver_id);
CREATE INDEX idx_messages_group ON messages(group_id);
",
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }
}
