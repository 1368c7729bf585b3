//! Row types for the tables defined in migrations.rs.

/// Identity record in the users table
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub first_seen_at: String,
}

/// Group record in the chat_groups table
#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub created_by: i64,
    pub created_at: String,
}
