//! Conversation store
//!
//! Per-context isolated chat state: message logs, user settings, the
//! personality registry, moderation, rate limiting, launch tracking, and
//! auto-cleanup. Context keys guarantee conversations on different surfaces
//! never bleed into each other.

pub mod personalities;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::{AutoCleanConfig, CleanMethod};
use crate::error::{EaselError, Result};

const SCHEMA_VERSION: i32 = 1;

/// Rolling rate-limit window
const RATE_WINDOW_MS: i64 = 60_000;
/// Rate-limit events older than this are swept by cleanup
const RATE_RETENTION_MS: i64 = 60 * 60 * 1000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    context_key TEXT NOT NULL,          -- 'thread:T', 'channel:C', 'dm:U'
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,                 -- 'user', 'assistant', 'system'
    content TEXT NOT NULL,
    metadata TEXT,                      -- opaque JSON
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_context ON conversations(context_key, created_at);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, created_at);

CREATE TABLE IF NOT EXISTS user_settings (
    user_id TEXT PRIMARY KEY,
    personality TEXT NOT NULL DEFAULT 'default',
    locked_personality TEXT,            -- set by admins; blocks changes
    max_context_messages INTEGER NOT NULL DEFAULT 20,
    temperature REAL NOT NULL DEFAULT 0.7,
    settings_json TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS personalities (
    name TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    system_prompt TEXT NOT NULL,
    image_injection_prompt TEXT NOT NULL,
    description TEXT,
    emoji TEXT,
    category TEXT NOT NULL DEFAULT 'chat',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_moderation (
    user_id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'active',   -- 'active', 'timeout', 'suspended'
    timeout_until INTEGER,
    reason TEXT,
    admin_user_id TEXT,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rate_limits (
    user_id TEXT NOT NULL,
    action_type TEXT NOT NULL,          -- 'chat', 'generate'
    ts INTEGER NOT NULL,
    context_key TEXT
);

CREATE INDEX IF NOT EXISTS idx_rate_limits_lookup ON rate_limits(user_id, action_type, ts);

CREATE TABLE IF NOT EXISTS launches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    launch_time INTEGER NOT NULL,
    cleanup_performed INTEGER NOT NULL DEFAULT 0
);
"#;

/// Derive the isolation key for a chat surface.
///
/// Threads win over channels, channels over DMs, so conversations on
/// different surfaces never share history.
pub fn context_key(
    _guild_id: Option<u64>,
    channel_id: Option<u64>,
    thread_id: Option<u64>,
    user_id: u64,
) -> String {
    if let Some(thread) = thread_id {
        format!("thread:{}", thread)
    } else if let Some(channel) = channel_id {
        format!("channel:{}", channel)
    } else {
        format!("dm:{}", user_id)
    }
}

/// A stored conversation message
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

/// Per-user settings, auto-created with defaults on first read
#[derive(Debug, Clone, Serialize)]
pub struct UserSettings {
    pub user_id: String,
    pub personality: String,
    pub locked_personality: Option<String>,
    pub max_context_messages: usize,
    pub temperature: f64,
}

/// A personality definition
#[derive(Debug, Clone, Serialize)]
pub struct Personality {
    pub name: String,
    pub display_name: String,
    pub system_prompt: String,
    pub image_injection_prompt: String,
    pub description: String,
    pub emoji: String,
    pub category: String,
}

/// Moderation status with lazy timeout expiry applied
#[derive(Debug, Clone, Serialize)]
pub struct ModerationStatus {
    pub status: String,
    pub timeout_until: Option<i64>,
    pub reason: Option<String>,
}

/// What auto-clean removed
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub ran: bool,
    pub conversations_deleted: usize,
    pub rate_events_deleted: usize,
}

/// Conversation store (thread-safe via Mutex)
pub struct ConvoDb {
    conn: Mutex<Connection>,
}

impl ConvoDb {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EaselError::Internal(format!("conversation db lock poisoned: {}", e)))
    }

    /// Open or create the store, installing built-in personalities
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        }
        let now = crate::now_ms();
        for (name, display, system, image, description, emoji, category) in
            personalities::BUILT_IN
        {
            conn.execute(
                "INSERT OR IGNORE INTO personalities \
                 (name, display_name, system_prompt, image_injection_prompt, description, \
                  emoji, category, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![name, display, system, image, description, emoji, category, now],
            )?;
        }
        Ok(())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Append a message to a context
    pub fn append(
        &self,
        context_key: &str,
        user_id: &str,
        role: &str,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO conversations (context_key, user_id, role, content, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                context_key,
                user_id,
                role,
                content,
                metadata.map(|m| m.to_string()),
                crate::now_ms()
            ],
        )?;
        Ok(())
    }

    /// Recent messages in chronological (ascending) order
    pub fn history(&self, context_key: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, role, content, metadata, created_at FROM conversations \
             WHERE context_key = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![context_key, limit as i64], |row| {
            Ok(StoredMessage {
                user_id: row.get(0)?,
                role: row.get(1)?,
                content: row.get(2)?,
                metadata: row
                    .get::<_, Option<String>>(3)?
                    .and_then(|m| serde_json::from_str(&m).ok()),
                created_at: row.get(4)?,
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse(); // oldest first
        Ok(messages)
    }

    /// Delete a context's messages, returning the count removed
    pub fn clear(&self, context_key: &str) -> Result<usize> {
        let count = self.conn()?.execute(
            "DELETE FROM conversations WHERE context_key = ?1",
            params![context_key],
        )?;
        Ok(count)
    }

    // =========================================================================
    // Settings and personalities
    // =========================================================================

    /// Get settings, creating defaults on first access
    pub fn get_settings(&self, user_id: &str) -> Result<UserSettings> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT personality, locked_personality, max_context_messages, temperature \
             FROM user_settings WHERE user_id = ?1",
        )?;
        let mut rows = stmt.query(params![user_id])?;
        if let Some(row) = rows.next()? {
            return Ok(UserSettings {
                user_id: user_id.to_string(),
                personality: row.get(0)?,
                locked_personality: row.get(1)?,
                max_context_messages: row.get::<_, i64>(2)? as usize,
                temperature: row.get(3)?,
            });
        }
        drop(rows);
        drop(stmt);

        let now = crate::now_ms();
        conn.execute(
            "INSERT INTO user_settings (user_id, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![user_id, now],
        )?;
        Ok(UserSettings {
            user_id: user_id.to_string(),
            personality: "default".to_string(),
            locked_personality: None,
            max_context_messages: 20,
            temperature: 0.7,
        })
    }

    /// Change a user's personality. Refused when an admin lock is in place.
    pub fn set_personality(&self, user_id: &str, personality: &str) -> Result<()> {
        if self.get_personality(personality)?.is_none() {
            return Err(EaselError::NotFound(format!(
                "personality '{}'",
                personality
            )));
        }

        let settings = self.get_settings(user_id)?;
        if let Some(locked) = settings.locked_personality {
            if locked != personality {
                return Err(EaselError::Policy(format!(
                    "personality is locked to '{}' by an admin",
                    locked
                )));
            }
        }

        self.conn()?.execute(
            "UPDATE user_settings SET personality = ?2, updated_at = ?3 WHERE user_id = ?1",
            params![user_id, personality, crate::now_ms()],
        )?;
        Ok(())
    }

    /// Admin: pin a user to one personality
    pub fn lock_personality(&self, user_id: &str, personality: &str, _admin_id: &str) -> Result<()> {
        if self.get_personality(personality)?.is_none() {
            return Err(EaselError::NotFound(format!(
                "personality '{}'",
                personality
            )));
        }
        self.get_settings(user_id)?;
        self.conn()?.execute(
            "UPDATE user_settings SET personality = ?2, locked_personality = ?2, updated_at = ?3 \
             WHERE user_id = ?1",
            params![user_id, personality, crate::now_ms()],
        )?;
        Ok(())
    }

    /// Admin: remove a personality lock
    pub fn unlock_personality(&self, user_id: &str) -> Result<()> {
        self.get_settings(user_id)?;
        self.conn()?.execute(
            "UPDATE user_settings SET locked_personality = NULL, updated_at = ?2 WHERE user_id = ?1",
            params![user_id, crate::now_ms()],
        )?;
        Ok(())
    }

    pub fn get_personality(&self, name: &str) -> Result<Option<Personality>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, display_name, system_prompt, image_injection_prompt, description, \
             emoji, category FROM personalities WHERE name = ?1",
        )?;
        let mut rows = stmt.query(params![name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::personality_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_personalities(&self) -> Result<Vec<Personality>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, display_name, system_prompt, image_injection_prompt, description, \
             emoji, category FROM personalities ORDER BY name",
        )?;
        let rows = stmt.query_map([], Self::personality_from_row)?;
        let mut list = Vec::new();
        for row in rows {
            list.push(row?);
        }
        Ok(list)
    }

    fn personality_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Personality> {
        Ok(Personality {
            name: row.get(0)?,
            display_name: row.get(1)?,
            system_prompt: row.get(2)?,
            image_injection_prompt: row.get(3)?,
            description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            emoji: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            category: row.get(6)?,
        })
    }

    /// The personality that actually applies to a user: the locked one when
    /// set, otherwise their chosen one, otherwise default.
    pub fn effective_personality(&self, user_id: &str) -> Result<Personality> {
        let settings = self.get_settings(user_id)?;
        let name = settings
            .locked_personality
            .unwrap_or(settings.personality);
        if let Some(personality) = self.get_personality(&name)? {
            return Ok(personality);
        }
        self.get_personality("default")?
            .ok_or_else(|| EaselError::Internal("default personality missing".to_string()))
    }

    // =========================================================================
    // Moderation
    // =========================================================================

    /// Time a user out for `minutes`
    pub fn timeout_user(
        &self,
        user_id: &str,
        minutes: i64,
        reason: &str,
        admin_id: &str,
    ) -> Result<()> {
        if minutes <= 0 || minutes > 10_080 {
            return Err(EaselError::Validation(
                "timeout must be between 1 minute and 1 week".to_string(),
            ));
        }
        let until = crate::now_ms() + minutes * 60_000;
        self.conn()?.execute(
            "INSERT INTO user_moderation (user_id, status, timeout_until, reason, admin_user_id, updated_at) \
             VALUES (?1, 'timeout', ?2, ?3, ?4, ?5) \
             ON CONFLICT(user_id) DO UPDATE SET \
               status = 'timeout', timeout_until = excluded.timeout_until, \
               reason = excluded.reason, admin_user_id = excluded.admin_user_id, \
               updated_at = excluded.updated_at",
            params![user_id, until, reason, admin_id, crate::now_ms()],
        )?;
        Ok(())
    }

    /// Suspend a user indefinitely
    pub fn suspend_user(&self, user_id: &str, reason: &str, admin_id: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO user_moderation (user_id, status, timeout_until, reason, admin_user_id, updated_at) \
             VALUES (?1, 'suspended', NULL, ?2, ?3, ?4) \
             ON CONFLICT(user_id) DO UPDATE SET \
               status = 'suspended', timeout_until = NULL, \
               reason = excluded.reason, admin_user_id = excluded.admin_user_id, \
               updated_at = excluded.updated_at",
            params![user_id, reason, admin_id, crate::now_ms()],
        )?;
        Ok(())
    }

    /// Reinstate a user
    pub fn reactivate_user(&self, user_id: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO user_moderation (user_id, status, timeout_until, reason, admin_user_id, updated_at) \
             VALUES (?1, 'active', NULL, NULL, NULL, ?2) \
             ON CONFLICT(user_id) DO UPDATE SET \
               status = 'active', timeout_until = NULL, updated_at = excluded.updated_at",
            params![user_id, crate::now_ms()],
        )?;
        Ok(())
    }

    /// Moderation status with lazy expiry: an elapsed timeout flips back to
    /// active on read.
    pub fn check_status(&self, user_id: &str) -> Result<ModerationStatus> {
        self.check_status_at(user_id, crate::now_ms())
    }

    pub(crate) fn check_status_at(&self, user_id: &str, now_ms: i64) -> Result<ModerationStatus> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, timeout_until, reason FROM user_moderation WHERE user_id = ?1",
        )?;
        let mut rows = stmt.query(params![user_id])?;
        let Some(row) = rows.next()? else {
            return Ok(ModerationStatus {
                status: "active".to_string(),
                timeout_until: None,
                reason: None,
            });
        };

        let status: String = row.get(0)?;
        let timeout_until: Option<i64> = row.get(1)?;
        let reason: Option<String> = row.get(2)?;
        drop(rows);
        drop(stmt);

        if status == "timeout" {
            if let Some(until) = timeout_until {
                if until < now_ms {
                    conn.execute(
                        "UPDATE user_moderation SET status = 'active', timeout_until = NULL, \
                         updated_at = ?2 WHERE user_id = ?1",
                        params![user_id, now_ms],
                    )?;
                    return Ok(ModerationStatus {
                        status: "active".to_string(),
                        timeout_until: None,
                        reason: None,
                    });
                }
            }
        }

        Ok(ModerationStatus {
            status,
            timeout_until,
            reason,
        })
    }

    // =========================================================================
    // Rate limiting
    // =========================================================================

    /// Is the user allowed to act? Returns (allowed, seconds until the
    /// window frees up).
    pub fn check_rate(
        &self,
        user_id: &str,
        action: &str,
        max_per_minute: u32,
    ) -> Result<(bool, u64)> {
        self.check_rate_at(user_id, action, max_per_minute, crate::now_ms())
    }

    pub(crate) fn check_rate_at(
        &self,
        user_id: &str,
        action: &str,
        max_per_minute: u32,
        now_ms: i64,
    ) -> Result<(bool, u64)> {
        let conn = self.conn()?;
        let window_start = now_ms - RATE_WINDOW_MS;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rate_limits \
             WHERE user_id = ?1 AND action_type = ?2 AND ts > ?3",
            params![user_id, action, window_start],
            |row| row.get(0),
        )?;

        if count < max_per_minute as i64 {
            return Ok((true, 0));
        }

        // Reset when the oldest in-window event exits the window
        let oldest: i64 = conn.query_row(
            "SELECT MIN(ts) FROM rate_limits \
             WHERE user_id = ?1 AND action_type = ?2 AND ts > ?3",
            params![user_id, action, window_start],
            |row| row.get(0),
        )?;
        let reset_ms = (oldest + RATE_WINDOW_MS - now_ms).max(0);
        Ok((false, (reset_ms as u64).div_ceil(1000)))
    }

    /// Record a rate-limited action
    pub fn record_action(&self, user_id: &str, action: &str, context_key: Option<&str>) -> Result<()> {
        self.record_action_at(user_id, action, context_key, crate::now_ms())
    }

    pub(crate) fn record_action_at(
        &self,
        user_id: &str,
        action: &str,
        context_key: Option<&str>,
        ts: i64,
    ) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO rate_limits (user_id, action_type, ts, context_key) \
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, action, ts, context_key],
        )?;
        Ok(())
    }

    // =========================================================================
    // Launch tracking and auto-clean
    // =========================================================================

    /// Record a launch and run the cleanup pass when the policy says it is
    /// due. Cleanup deletes messages older than the retention window and
    /// rate events older than an hour, then marks this launch as cleaned.
    pub fn run_auto_clean(&self, policy: &AutoCleanConfig) -> Result<CleanupReport> {
        self.run_auto_clean_at(policy, crate::now_ms())
    }

    pub(crate) fn run_auto_clean_at(
        &self,
        policy: &AutoCleanConfig,
        now_ms: i64,
    ) -> Result<CleanupReport> {
        self.conn()?.execute(
            "INSERT INTO launches (launch_time) VALUES (?1)",
            params![now_ms],
        )?;

        if !policy.enabled {
            return Ok(CleanupReport::default());
        }

        let due = match policy.method {
            CleanMethod::Days => {
                let last_cleanup: Option<i64> = self.conn()?.query_row(
                    "SELECT MAX(launch_time) FROM launches WHERE cleanup_performed = 1",
                    [],
                    |row| row.get(0),
                )?;
                match last_cleanup {
                    None => true,
                    Some(last) => now_ms - last >= policy.days * 24 * 60 * 60 * 1000,
                }
            }
            CleanMethod::Launches => {
                let last_id: i64 = self
                    .conn()?
                    .query_row(
                        "SELECT COALESCE(MAX(id), 0) FROM launches WHERE cleanup_performed = 1",
                        [],
                        |row| row.get(0),
                    )?;
                let since: i64 = self.conn()?.query_row(
                    "SELECT COUNT(*) FROM launches WHERE id > ?1",
                    params![last_id],
                    |row| row.get(0),
                )?;
                since >= policy.launches
            }
        };

        if !due {
            return Ok(CleanupReport::default());
        }

        let conn = self.conn()?;
        let message_cutoff = now_ms - policy.days * 24 * 60 * 60 * 1000;
        let conversations_deleted = conn.execute(
            "DELETE FROM conversations WHERE created_at < ?1",
            params![message_cutoff],
        )?;
        let rate_events_deleted = conn.execute(
            "DELETE FROM rate_limits WHERE ts < ?1",
            params![now_ms - RATE_RETENTION_MS],
        )?;
        conn.execute(
            "UPDATE launches SET cleanup_performed = 1 \
             WHERE id = (SELECT MAX(id) FROM launches)",
            [],
        )?;

        Ok(CleanupReport {
            ran: true,
            conversations_deleted,
            rate_events_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keys_isolate_surfaces() {
        // Thread wins regardless of channel
        assert_eq!(context_key(Some(1), Some(2), Some(3), 4), "thread:3");
        // Channel when no thread
        assert_eq!(context_key(Some(1), Some(2), None, 4), "channel:2");
        // DM when nothing else
        assert_eq!(context_key(None, None, None, 4), "dm:4");
    }

    #[test]
    fn histories_are_disjoint_and_clear_is_scoped() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        db.append("channel:1", "u1", "user", "hello in one", None)?;
        db.append("channel:2", "u1", "user", "hello in two", None)?;
        db.append("channel:1", "u1", "assistant", "reply in one", None)?;

        let one = db.history("channel:1", 20)?;
        let two = db.history("channel:2", 20)?;
        assert_eq!(one.len(), 2);
        assert_eq!(two.len(), 1);
        assert!(one.iter().all(|m| m.content.contains("one")));
        assert!(two.iter().all(|m| m.content.contains("two")));

        // Chronological ascending
        assert_eq!(one[0].role, "user");
        assert_eq!(one[1].role, "assistant");

        // Clearing one context leaves the other intact
        let deleted = db.clear("channel:1")?;
        assert_eq!(deleted, 2);
        assert_eq!(db.history("channel:1", 20)?.len(), 0);
        assert_eq!(db.history("channel:2", 20)?.len(), 1);
        Ok(())
    }

    #[test]
    fn settings_auto_create_with_defaults() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let settings = db.get_settings("new-user")?;
        assert_eq!(settings.personality, "default");
        assert_eq!(settings.max_context_messages, 20);
        assert!(settings.locked_personality.is_none());
        Ok(())
    }

    #[test]
    fn built_in_personalities_are_installed() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let names: Vec<String> = db
            .list_personalities()?
            .into_iter()
            .map(|p| p.name)
            .collect();
        for expected in ["default", "uwu", "sarcastic", "professional", "helpful", "creative"] {
            assert!(names.contains(&expected.to_string()), "missing {}", expected);
        }

        let uwu = db.get_personality("uwu")?.unwrap();
        assert!(!uwu.system_prompt.is_empty());
        assert!(!uwu.image_injection_prompt.is_empty());
        Ok(())
    }

    #[test]
    fn personality_lock_blocks_changes() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        db.lock_personality("u1", "professional", "admin")?;

        let err = db.set_personality("u1", "uwu").unwrap_err();
        assert_eq!(err.kind(), "policy");
        assert_eq!(db.get_settings("u1")?.personality, "professional");

        // Setting the locked personality itself is a no-op success
        db.set_personality("u1", "professional")?;

        db.unlock_personality("u1")?;
        db.set_personality("u1", "uwu")?;
        assert_eq!(db.get_settings("u1")?.personality, "uwu");
        Ok(())
    }

    #[test]
    fn unknown_personality_is_not_found() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let err = db.set_personality("u1", "nonexistent").unwrap_err();
        assert_eq!(err.kind(), "not_found");
        Ok(())
    }

    #[test]
    fn timeout_expires_lazily() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let now = crate::now_ms();
        db.timeout_user("u1", 5, "spamming", "admin")?;

        let status = db.check_status_at("u1", now)?;
        assert_eq!(status.status, "timeout");

        // Advance past the timeout: next read transitions to active
        let later = now + 5 * 60_000 + 1000;
        let status = db.check_status_at("u1", later)?;
        assert_eq!(status.status, "active");

        // And the transition persisted
        let status = db.check_status_at("u1", later)?;
        assert_eq!(status.status, "active");
        Ok(())
    }

    #[test]
    fn suspension_does_not_expire() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        db.suspend_user("u1", "abuse", "admin")?;
        let status = db.check_status_at("u1", crate::now_ms() + 365 * 24 * 60 * 60 * 1000)?;
        assert_eq!(status.status, "suspended");
        assert_eq!(status.reason.as_deref(), Some("abuse"));

        db.reactivate_user("u1")?;
        assert_eq!(db.check_status("u1")?.status, "active");
        Ok(())
    }

    #[test]
    fn rate_limit_window_and_reset() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let t0 = 1_000_000_000_000; // arbitrary epoch ms

        // Limit 2/min, events at t=0s and t=10s
        db.record_action_at("u1", "chat", None, t0)?;
        db.record_action_at("u1", "chat", None, t0 + 10_000)?;

        // At t=20s: denied, 40s until the oldest event exits the window
        let (allowed, reset) = db.check_rate_at("u1", "chat", 2, t0 + 20_000)?;
        assert!(!allowed);
        assert_eq!(reset, 40);

        // At t=61s: the first event left the window
        let (allowed, reset) = db.check_rate_at("u1", "chat", 2, t0 + 61_000)?;
        assert!(allowed);
        assert_eq!(reset, 0);
        Ok(())
    }

    #[test]
    fn rate_limit_monotonicity() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let t0 = 1_000_000_000_000;
        let limit = 5;

        for n in 0..limit {
            let (allowed, _) = db.check_rate_at("u1", "generate", limit as u32, t0 + n)?;
            assert!(allowed, "call {} should be allowed", n);
            db.record_action_at("u1", "generate", None, t0 + n)?;
        }

        let (allowed, reset) = db.check_rate_at("u1", "generate", limit as u32, t0 + limit)?;
        assert!(!allowed);
        assert!(reset <= 60);

        // Action types are independent
        let (allowed, _) = db.check_rate_at("u1", "chat", 2, t0 + limit)?;
        assert!(allowed);
        Ok(())
    }

    #[test]
    fn auto_clean_by_days_and_idempotence() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let policy = AutoCleanConfig {
            enabled: true,
            method: CleanMethod::Days,
            days: 7,
            launches: 10,
        };

        let now = crate::now_ms();

        // Old and fresh messages
        let old_ts = now - 10 * 24 * 60 * 60 * 1000;
        db.conn()?.execute(
            "INSERT INTO conversations (context_key, user_id, role, content, created_at) \
             VALUES ('channel:1', 'u1', 'user', 'ancient', ?1)",
            params![old_ts],
        )?;
        db.append("channel:1", "u1", "user", "fresh", None)?;

        // First launch with no prior cleanup: runs and removes the old row
        let report = db.run_auto_clean_at(&policy, now)?;
        assert!(report.ran);
        assert_eq!(report.conversations_deleted, 1);
        assert_eq!(db.history("channel:1", 20)?.len(), 1);

        // Running again in the same launch window deletes nothing more
        let report = db.run_auto_clean_at(&policy, now)?;
        assert!(!report.ran);
        assert_eq!(report.conversations_deleted, 0);
        Ok(())
    }

    #[test]
    fn auto_clean_by_launches() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let policy = AutoCleanConfig {
            enabled: true,
            method: CleanMethod::Launches,
            days: 7,
            launches: 3,
        };
        let now = crate::now_ms();

        // First launch triggers (3rd launch since the beginning counts from
        // zero cleanups, so launches 1..=2 do not trigger)
        let first = db.run_auto_clean_at(&policy, now)?;
        assert!(!first.ran);
        let second = db.run_auto_clean_at(&policy, now)?;
        assert!(!second.ran);
        let third = db.run_auto_clean_at(&policy, now)?;
        assert!(third.ran);

        // Counter resets after a cleanup
        let fourth = db.run_auto_clean_at(&policy, now)?;
        assert!(!fourth.ran);
        Ok(())
    }

    #[test]
    fn disabled_auto_clean_only_records_launch() -> Result<()> {
        let db = ConvoDb::in_memory()?;
        let policy = AutoCleanConfig {
            enabled: false,
            method: CleanMethod::Days,
            days: 7,
            launches: 10,
        };
        let report = db.run_auto_clean(&policy)?;
        assert!(!report.ran);

        let launches: i64 = db
            .conn()?
            .query_row("SELECT COUNT(*) FROM launches", [], |row| row.get(0))?;
        assert_eq!(launches, 1);
        Ok(())
    }
}
