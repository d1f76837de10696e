//! SQLite persistence layer.
//!
//! Owns the schema and every durable operation: user accounts and search,
//! the friend-request state machine, friendships, direct and group
//! conversations, and message append/history. Multi-statement operations
//! (accepting a request, find-or-create of a direct conversation, group
//! creation) run inside a single transaction so partial writes can never be
//! observed after a failure.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    /// Missing user, request, or conversation.
    NotFound(String),
    /// Already friends, duplicate pending request, duplicate account.
    Conflict(String),
    /// Viewer is not an active participant of the conversation.
    Forbidden(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
            StorageError::Conflict(msg) => write!(f, "conflict: {msg}"),
            StorageError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// Id and time helpers
// ---------------------------------------------------------------------------

/// Generate a random URL-safe identifier (16 bytes, base64, no padding).
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Current unix time in whole seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Full user row as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<u64>,
    pub is_active: bool,
    pub created_at: u64,
    pub deleted_at: Option<u64>,
}

/// The subset of a user row that is safe to show to other users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicProfile {
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<u64>,
}

impl From<&UserRow> for PublicProfile {
    fn from(u: &UserRow) -> Self {
        Self {
            user_id: u.user_id.clone(),
            username: u.username.clone(),
            full_name: u.full_name.clone(),
            avatar_url: u.avatar_url.clone(),
            is_online: u.is_online,
            last_seen: u.last_seen,
        }
    }
}

/// Search hit: public profile plus whether the viewer is already a friend.
#[derive(Debug, Clone, Serialize)]
pub struct UserSearchHit {
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    pub is_friend: bool,
}

/// Pending request resolved with the sender's public profile.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub request_id: String,
    pub sent_at: u64,
    pub sender: PublicProfile,
}

/// Result of a friendship-status lookup between a viewer and a target.
#[derive(Debug, Clone, Serialize)]
pub struct FriendshipStatus {
    pub is_friend: bool,
    /// Set when a pending request exists between the pair; true when the
    /// viewer is its sender.
    pub pending_is_sender: Option<bool>,
}

/// Conversation row. `name` is NULL for direct conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub name: Option<String>,
    pub is_group: bool,
    pub created_by: String,
    pub created_at: u64,
}

/// Message resolved with its sender's public profile, as returned by history.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub message_id: String,
    pub content: String,
    pub is_edited: bool,
    pub created_at: u64,
    pub updated_at: u64,
    pub parent_message_id: Option<String>,
    pub sender: PublicProfile,
}

/// Group summary for the groups list view.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group_id: String,
    pub name: Option<String>,
    pub created_at: u64,
    pub member_count: u32,
    pub creator: PublicProfile,
}

/// Group roster entry.
#[derive(Debug, Clone, Serialize)]
pub struct GroupMemberInfo {
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub is_admin: bool,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                user_id         TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                email           TEXT NOT NULL UNIQUE,
                password_hash   TEXT NOT NULL,
                full_name       TEXT NOT NULL,
                avatar_url      TEXT,
                is_online       INTEGER NOT NULL DEFAULT 0,
                last_seen       INTEGER,
                is_active       INTEGER NOT NULL DEFAULT 1,
                created_at      INTEGER NOT NULL,
                deleted_at      INTEGER
            );

            CREATE TABLE IF NOT EXISTS friend_requests (
                request_id      TEXT PRIMARY KEY,
                sender_id       TEXT NOT NULL REFERENCES users(user_id),
                receiver_id     TEXT NOT NULL REFERENCES users(user_id),
                status          TEXT NOT NULL DEFAULT 'pending',
                sent_at         INTEGER NOT NULL,
                responded_at    INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_friend_requests_receiver
                ON friend_requests(receiver_id, status);
            CREATE INDEX IF NOT EXISTS idx_friend_requests_sender
                ON friend_requests(sender_id, status);

            CREATE TABLE IF NOT EXISTS friendships (
                friendship_id   TEXT PRIMARY KEY,
                user_one_id     TEXT NOT NULL REFERENCES users(user_id),
                user_two_id     TEXT NOT NULL REFERENCES users(user_id),
                created_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_friendships_one
                ON friendships(user_one_id);
            CREATE INDEX IF NOT EXISTS idx_friendships_two
                ON friendships(user_two_id);

            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                name            TEXT,
                is_group        INTEGER NOT NULL DEFAULT 0,
                created_by      TEXT NOT NULL REFERENCES users(user_id),
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversation_participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id),
                user_id         TEXT NOT NULL REFERENCES users(user_id),
                is_admin        INTEGER NOT NULL DEFAULT 0,
                joined_at       INTEGER NOT NULL,
                left_at         INTEGER,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_user
                ON conversation_participants(user_id);

            CREATE TABLE IF NOT EXISTS messages (
                message_id          TEXT PRIMARY KEY,
                conversation_id     TEXT NOT NULL REFERENCES conversations(conversation_id),
                sender_id           TEXT NOT NULL REFERENCES users(user_id),
                content             TEXT NOT NULL,
                is_edited           INTEGER NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL,
                updated_at          INTEGER NOT NULL,
                parent_message_id   TEXT,
                deleted_at          INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    pub fn insert_user(&self, row: &UserRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO users
             (user_id, username, email, password_hash, full_name, avatar_url,
              is_online, last_seen, is_active, created_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.user_id,
                row.username,
                row.email,
                row.password_hash,
                row.full_name,
                row.avatar_url,
                row.is_online as i32,
                row.last_seen.map(|t| t as i64),
                row.is_active as i32,
                row.created_at as i64,
                row.deleted_at.map(|t| t as i64),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRow>, StorageError> {
        self.user_by("user_id", user_id)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>, StorageError> {
        self.user_by("email", email)
    }

    fn user_by(&self, column: &str, value: &str) -> Result<Option<UserRow>, StorageError> {
        let query = format!(
            "SELECT user_id, username, email, password_hash, full_name, avatar_url,
                    is_online, last_seen, is_active, created_at, deleted_at
             FROM users WHERE {column} = ?1 AND deleted_at IS NULL"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let row = stmt
            .query_row(params![value], |row| {
                Ok(UserRow {
                    user_id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    password_hash: row.get(3)?,
                    full_name: row.get(4)?,
                    avatar_url: row.get(5)?,
                    is_online: row.get::<_, i32>(6)? != 0,
                    last_seen: row.get::<_, Option<i64>>(7)?.map(|t| t as u64),
                    is_active: row.get::<_, i32>(8)? != 0,
                    created_at: row.get::<_, i64>(9)? as u64,
                    deleted_at: row.get::<_, Option<i64>>(10)?.map(|t| t as u64),
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Check whether a username or email is already taken by a live account.
    pub fn username_or_email_taken(
        &self,
        username: &str,
        email: &str,
    ) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users
             WHERE (username = ?1 OR email = ?2) AND deleted_at IS NULL",
            params![username, email],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Flip the persisted online flag and refresh `last_seen`.
    pub fn set_online(&self, user_id: &str, online: bool) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE users SET is_online = ?1, last_seen = ?2 WHERE user_id = ?3",
            params![online as i32, now_secs() as i64, user_id],
        )?;
        Ok(affected > 0)
    }

    /// Prefix search on username or full name, excluding the viewer and any
    /// inactive or soft-deleted accounts. Each hit carries whether the viewer
    /// is already friends with it. At most ten rows.
    pub fn search_users(
        &self,
        viewer_id: &str,
        query: &str,
    ) -> Result<Vec<UserSearchHit>, StorageError> {
        let pattern = format!("{query}%");
        let mut stmt = self.conn.prepare(
            "SELECT u.user_id, u.username, u.full_name, u.avatar_url, u.is_online,
                    EXISTS(
                        SELECT 1 FROM friendships f
                        WHERE (f.user_one_id = u.user_id AND f.user_two_id = ?1)
                           OR (f.user_two_id = u.user_id AND f.user_one_id = ?1)
                    ) AS is_friend
             FROM users u
             WHERE (u.username LIKE ?2 OR u.full_name LIKE ?2)
               AND u.user_id != ?1
               AND u.deleted_at IS NULL
               AND u.is_active = 1
             ORDER BY u.username
             LIMIT 10",
        )?;
        let rows = stmt.query_map(params![viewer_id, pattern], |row| {
            Ok(UserSearchHit {
                user_id: row.get(0)?,
                username: row.get(1)?,
                full_name: row.get(2)?,
                avatar_url: row.get(3)?,
                is_online: row.get::<_, i32>(4)? != 0,
                is_friend: row.get::<_, i32>(5)? != 0,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Friend requests and friendships
    // -----------------------------------------------------------------------

    /// Send a friend request.
    ///
    /// Fails with `NotFound` if the receiver does not exist (or is
    /// soft-deleted), with `Conflict` if the pair is already friends or a
    /// pending request already exists in either direction. On success inserts
    /// a pending request and returns its id.
    pub fn send_friend_request(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<String, StorageError> {
        let tx = self.conn.unchecked_transaction()?;

        let receiver_exists: bool = tx
            .query_row(
                "SELECT 1 FROM users WHERE user_id = ?1 AND deleted_at IS NULL",
                params![receiver_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !receiver_exists {
            return Err(StorageError::NotFound("user not found".to_string()));
        }

        let already_friends: i64 = tx.query_row(
            "SELECT COUNT(*) FROM friendships
             WHERE (user_one_id = ?1 AND user_two_id = ?2)
                OR (user_one_id = ?2 AND user_two_id = ?1)",
            params![sender_id, receiver_id],
            |row| row.get(0),
        )?;
        if already_friends > 0 {
            return Err(StorageError::Conflict(
                "users are already friends".to_string(),
            ));
        }

        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM friend_requests
             WHERE ((sender_id = ?1 AND receiver_id = ?2)
                 OR (sender_id = ?2 AND receiver_id = ?1))
               AND status = 'pending'",
            params![sender_id, receiver_id],
            |row| row.get(0),
        )?;
        if pending > 0 {
            return Err(StorageError::Conflict(
                "friend request already exists".to_string(),
            ));
        }

        let request_id = new_id();
        tx.execute(
            "INSERT INTO friend_requests (request_id, sender_id, receiver_id, status, sent_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![request_id, sender_id, receiver_id, now_secs() as i64],
        )?;
        tx.commit()?;
        Ok(request_id)
    }

    /// Accept a pending friend request addressed to `receiver_id`.
    ///
    /// Atomically marks the request accepted and inserts the friendship row;
    /// both writes commit together or neither does. A request that is not
    /// pending (or not addressed to this receiver) yields `NotFound`, which
    /// is how a duplicate concurrent accept resolves to "already processed"
    /// without external locking.
    pub fn accept_friend_request(
        &self,
        receiver_id: &str,
        request_id: &str,
    ) -> Result<String, StorageError> {
        let tx = self.conn.unchecked_transaction()?;

        let sender_id: Option<String> = tx
            .query_row(
                "SELECT sender_id FROM friend_requests
                 WHERE request_id = ?1 AND receiver_id = ?2 AND status = 'pending'",
                params![request_id, receiver_id],
                |row| row.get(0),
            )
            .optional()?;
        let sender_id = match sender_id {
            Some(id) => id,
            None => {
                return Err(StorageError::NotFound(
                    "friend request not found or already processed".to_string(),
                ))
            }
        };

        let now = now_secs() as i64;
        tx.execute(
            "UPDATE friend_requests SET status = 'accepted', responded_at = ?1
             WHERE request_id = ?2",
            params![now, request_id],
        )?;

        let friendship_id = new_id();
        tx.execute(
            "INSERT INTO friendships (friendship_id, user_one_id, user_two_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![friendship_id, sender_id, receiver_id, now],
        )?;

        tx.commit()?;
        Ok(friendship_id)
    }

    /// Pending requests addressed to `receiver_id`, newest first, each with
    /// the sender's public profile.
    pub fn list_pending_requests(
        &self,
        receiver_id: &str,
    ) -> Result<Vec<PendingRequest>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT fr.request_id, fr.sent_at,
                    u.user_id, u.username, u.full_name, u.avatar_url, u.is_online, u.last_seen
             FROM friend_requests fr
             JOIN users u ON fr.sender_id = u.user_id
             WHERE fr.receiver_id = ?1 AND fr.status = 'pending' AND u.deleted_at IS NULL
             ORDER BY fr.sent_at DESC, fr.rowid DESC",
        )?;
        let rows = stmt.query_map(params![receiver_id], |row| {
            Ok(PendingRequest {
                request_id: row.get(0)?,
                sent_at: row.get::<_, i64>(1)? as u64,
                sender: PublicProfile {
                    user_id: row.get(2)?,
                    username: row.get(3)?,
                    full_name: row.get(4)?,
                    avatar_url: row.get(5)?,
                    is_online: row.get::<_, i32>(6)? != 0,
                    last_seen: row.get::<_, Option<i64>>(7)?.map(|t| t as u64),
                },
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Whether a friendship exists and whether a pending request exists
    /// between the pair (order-independent), and if so whether the viewer
    /// sent it.
    pub fn friendship_status(
        &self,
        viewer_id: &str,
        target_id: &str,
    ) -> Result<FriendshipStatus, StorageError> {
        let is_friend: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM friendships
             WHERE (user_one_id = ?1 AND user_two_id = ?2)
                OR (user_one_id = ?2 AND user_two_id = ?1)",
            params![viewer_id, target_id],
            |row| row.get(0),
        )?;

        let pending_sender: Option<String> = self
            .conn
            .query_row(
                "SELECT sender_id FROM friend_requests
                 WHERE ((sender_id = ?1 AND receiver_id = ?2)
                     OR (sender_id = ?2 AND receiver_id = ?1))
                   AND status = 'pending'
                 LIMIT 1",
                params![viewer_id, target_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(FriendshipStatus {
            is_friend: is_friend > 0,
            pending_is_sender: pending_sender.map(|s| s == viewer_id),
        })
    }

    /// The user's friends (union of both pairing directions), sorted
    /// online-first, then most-recently-seen.
    pub fn list_friends(&self, user_id: &str) -> Result<Vec<PublicProfile>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT u.user_id, u.username, u.full_name, u.avatar_url, u.is_online, u.last_seen
             FROM friendships f
             JOIN users u ON u.user_id = CASE
                 WHEN f.user_one_id = ?1 THEN f.user_two_id
                 ELSE f.user_one_id
             END
             WHERE (f.user_one_id = ?1 OR f.user_two_id = ?1)
               AND u.deleted_at IS NULL
             ORDER BY u.is_online DESC, u.last_seen DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(PublicProfile {
                user_id: row.get(0)?,
                username: row.get(1)?,
                full_name: row.get(2)?,
                avatar_url: row.get(3)?,
                is_online: row.get::<_, i32>(4)? != 0,
                last_seen: row.get::<_, Option<i64>>(5)?.map(|t| t as u64),
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    pub fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, name, is_group, created_by, created_at
             FROM conversations WHERE conversation_id = ?1",
        )?;
        let row = stmt
            .query_row(params![conversation_id], |row| {
                Ok(ConversationRow {
                    conversation_id: row.get(0)?,
                    name: row.get(1)?,
                    is_group: row.get::<_, i32>(2)? != 0,
                    created_by: row.get(3)?,
                    created_at: row.get::<_, i64>(4)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Find the unique direct conversation whose participant set is exactly
    /// {a, b}, creating it (with both participants) if absent. Symmetric in
    /// its arguments and idempotent: repeated calls return the same id.
    ///
    /// The lookup and the insert run in one transaction on the single write
    /// connection, so concurrent calls for the same pair serialize and cannot
    /// produce two conversations.
    pub fn find_or_create_direct_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<String, StorageError> {
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT c.conversation_id
                 FROM conversations c
                 JOIN conversation_participants p1
                   ON c.conversation_id = p1.conversation_id AND p1.user_id = ?1
                 JOIN conversation_participants p2
                   ON c.conversation_id = p2.conversation_id AND p2.user_id = ?2
                 WHERE c.is_group = 0
                 LIMIT 1",
                params![user_a, user_b],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let conversation_id = new_id();
        let now = now_secs() as i64;
        tx.execute(
            "INSERT INTO conversations (conversation_id, name, is_group, created_by, created_at)
             VALUES (?1, NULL, 0, ?2, ?3)",
            params![conversation_id, user_a, now],
        )?;
        tx.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, is_admin, joined_at)
             VALUES (?1, ?2, 0, ?3), (?1, ?4, 0, ?3)",
            params![conversation_id, user_a, now, user_b],
        )?;

        tx.commit()?;
        Ok(conversation_id)
    }

    /// Insert a message row and return its id plus the stored creation
    /// timestamp. Membership verification is the caller's job on the group
    /// path; the direct path establishes the conversation via
    /// [`Self::find_or_create_direct_conversation`].
    pub fn append_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<(String, u64), StorageError> {
        let message_id = new_id();
        let now = now_secs();
        self.conn.execute(
            "INSERT INTO messages
             (message_id, conversation_id, sender_id, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![message_id, conversation_id, sender_id, content, now as i64],
        )?;
        Ok((message_id, now))
    }

    /// Create a group conversation with the creator as admin participant and
    /// each member as non-admin participant, all in one transaction. A
    /// missing member id fails the whole operation with `NotFound` and rolls
    /// back every write.
    pub fn create_group(
        &self,
        creator_id: &str,
        name: &str,
        member_ids: &[String],
    ) -> Result<String, StorageError> {
        let tx = self.conn.unchecked_transaction()?;

        for member_id in member_ids {
            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM users WHERE user_id = ?1 AND deleted_at IS NULL",
                    params![member_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Err(StorageError::NotFound(format!(
                    "user not found: {member_id}"
                )));
            }
        }

        let conversation_id = new_id();
        let now = now_secs() as i64;
        tx.execute(
            "INSERT INTO conversations (conversation_id, name, is_group, created_by, created_at)
             VALUES (?1, ?2, 1, ?3, ?4)",
            params![conversation_id, name, creator_id, now],
        )?;
        tx.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, is_admin, joined_at)
             VALUES (?1, ?2, 1, ?3)",
            params![conversation_id, creator_id, now],
        )?;
        for member_id in member_ids {
            tx.execute(
                "INSERT OR IGNORE INTO conversation_participants
                 (conversation_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, 0, ?3)",
                params![conversation_id, member_id, now],
            )?;
        }

        tx.commit()?;
        Ok(conversation_id)
    }

    /// Whether `user_id` is an active (`left_at` NULL) participant.
    pub fn is_active_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
            params![conversation_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Messages of a conversation in creation order (insertion order breaks
    /// ties), soft-deleted rows excluded, each with the sender's profile.
    ///
    /// Fails with `NotFound` if the conversation does not exist and with
    /// `Forbidden` if the viewer is not an active participant.
    pub fn history(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<Vec<ConversationMessage>, StorageError> {
        if self.get_conversation(conversation_id)?.is_none() {
            return Err(StorageError::NotFound("conversation not found".to_string()));
        }
        if !self.is_active_participant(conversation_id, viewer_id)? {
            return Err(StorageError::Forbidden(
                "you are not a member of this conversation".to_string(),
            ));
        }
        self.messages_with_sender(
            "SELECT m.message_id, m.content, m.is_edited, m.created_at, m.updated_at,
                    m.parent_message_id,
                    u.user_id, u.username, u.full_name, u.avatar_url, u.is_online, u.last_seen
             FROM messages m
             JOIN users u ON m.sender_id = u.user_id
             WHERE m.conversation_id = ?1 AND m.deleted_at IS NULL
             ORDER BY m.created_at ASC, m.rowid ASC",
            params![conversation_id],
        )
    }

    /// Direct-message history between the viewer and a friend, oldest first.
    /// Returns an empty list when no direct conversation exists yet.
    pub fn direct_history(
        &self,
        viewer_id: &str,
        friend_id: &str,
    ) -> Result<Vec<ConversationMessage>, StorageError> {
        self.messages_with_sender(
            "SELECT m.message_id, m.content, m.is_edited, m.created_at, m.updated_at,
                    m.parent_message_id,
                    u.user_id, u.username, u.full_name, u.avatar_url, u.is_online, u.last_seen
             FROM messages m
             JOIN conversations c ON m.conversation_id = c.conversation_id
             JOIN conversation_participants p1
               ON c.conversation_id = p1.conversation_id AND p1.user_id = ?1
             JOIN conversation_participants p2
               ON c.conversation_id = p2.conversation_id AND p2.user_id = ?2
             JOIN users u ON m.sender_id = u.user_id
             WHERE c.is_group = 0 AND m.deleted_at IS NULL
             ORDER BY m.created_at ASC, m.rowid ASC",
            params![viewer_id, friend_id],
        )
    }

    fn messages_with_sender(
        &self,
        query: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ConversationMessage>, StorageError> {
        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map(params, |row| {
            Ok(ConversationMessage {
                message_id: row.get(0)?,
                content: row.get(1)?,
                is_edited: row.get::<_, i32>(2)? != 0,
                created_at: row.get::<_, i64>(3)? as u64,
                updated_at: row.get::<_, i64>(4)? as u64,
                parent_message_id: row.get(5)?,
                sender: PublicProfile {
                    user_id: row.get(6)?,
                    username: row.get(7)?,
                    full_name: row.get(8)?,
                    avatar_url: row.get(9)?,
                    is_online: row.get::<_, i32>(10)? != 0,
                    last_seen: row.get::<_, Option<i64>>(11)?.map(|t| t as u64),
                },
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Groups the user actively participates in, newest-created first, each
    /// with its active-member count and the creator's profile.
    pub fn list_groups(&self, user_id: &str) -> Result<Vec<GroupSummary>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.conversation_id, c.name, c.created_at,
                    u.user_id, u.username, u.full_name, u.avatar_url, u.is_online, u.last_seen,
                    (SELECT COUNT(*) FROM conversation_participants cp
                     WHERE cp.conversation_id = c.conversation_id AND cp.left_at IS NULL)
                        AS member_count
             FROM conversations c
             JOIN conversation_participants p
               ON c.conversation_id = p.conversation_id
             JOIN users u ON c.created_by = u.user_id
             WHERE c.is_group = 1 AND p.user_id = ?1 AND p.left_at IS NULL
             ORDER BY c.created_at DESC, c.rowid DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(GroupSummary {
                group_id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get::<_, i64>(2)? as u64,
                creator: PublicProfile {
                    user_id: row.get(3)?,
                    username: row.get(4)?,
                    full_name: row.get(5)?,
                    avatar_url: row.get(6)?,
                    is_online: row.get::<_, i32>(7)? != 0,
                    last_seen: row.get::<_, Option<i64>>(8)?.map(|t| t as u64),
                },
                member_count: row.get::<_, i64>(9)? as u32,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Active members of a group, admins first, then by username.
    pub fn group_members(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<GroupMemberInfo>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT u.user_id, u.username, u.full_name, u.avatar_url, p.is_admin
             FROM conversation_participants p
             JOIN users u ON p.user_id = u.user_id
             WHERE p.conversation_id = ?1 AND p.left_at IS NULL
             ORDER BY p.is_admin DESC, u.username ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok(GroupMemberInfo {
                user_id: row.get(0)?,
                username: row.get(1)?,
                full_name: row.get(2)?,
                avatar_url: row.get(3)?,
                is_admin: row.get::<_, i32>(4)? != 0,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
