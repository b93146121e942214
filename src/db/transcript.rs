//! Transcript repository
//!
//! The transcript is the durable record of a call: an append-only log of
//! what the caller said and what the persona replied, in order.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use super::DbPool;
use crate::{Error, Result};

/// Speaker of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Transcribed caller speech
    User,
    /// Generated persona reply
    Assistant,
}

impl Role {
    /// Wire/database name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One line of a call transcript
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    /// Entry stamped with the current time
    #[must_use]
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Stored call metadata
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub id: String,
    pub persona_id: String,
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transcript repository
#[derive(Clone)]
pub struct TranscriptRepo {
    pool: DbPool,
}

impl TranscriptRepo {
    /// Create a new transcript repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a call session, or refresh it if it already exists
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn ensure_session(
        &self,
        session_id: &str,
        persona_id: &str,
        language: Option<&str>,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO call_sessions (id, persona_id, language, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                persona_id = excluded.persona_id,
                language = excluded.language,
                updated_at = excluded.updated_at",
            params![session_id, persona_id, language, now],
        )?;

        Ok(())
    }

    /// Find a call session by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_session(&self, session_id: &str) -> Result<Option<CallRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let record = conn
            .query_row(
                "SELECT id, persona_id, language, created_at, updated_at
                 FROM call_sessions WHERE id = ?1",
                [session_id],
                |row| {
                    Ok(CallRecord {
                        id: row.get(0)?,
                        persona_id: row.get(1)?,
                        language: row.get(2)?,
                        created_at: parse_datetime(&row.get::<_, String>(3)?),
                        updated_at: parse_datetime(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()?;

        Ok(record)
    }

    /// Append a single entry
    ///
    /// The session must already exist (see [`Self::ensure_session`]).
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn append(&self, session_id: &str, entry: &TranscriptEntry) -> Result<()> {
        self.append_all(session_id, std::slice::from_ref(entry))
    }

    /// Append one call turn: the caller's words, then the persona's reply
    ///
    /// Both entries are written in one transaction so a turn is never
    /// half-recorded.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn append_turn(&self, session_id: &str, user_text: &str, reply_text: &str) -> Result<()> {
        self.append_all(
            session_id,
            &[
                TranscriptEntry::now(Role::User, user_text),
                TranscriptEntry::now(Role::Assistant, reply_text),
            ],
        )
    }

    fn append_all(&self, session_id: &str, entries: &[TranscriptEntry]) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let tx = conn.transaction()?;
        for entry in entries {
            tx.execute(
                "INSERT INTO transcript_entries (session_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session_id,
                    entry.role.as_str(),
                    entry.content,
                    entry.timestamp.to_rfc3339()
                ],
            )?;
        }
        tx.execute(
            "UPDATE call_sessions SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), session_id],
        )?;
        tx.commit()?;

        tracing::debug!(session_id, entries = entries.len(), "transcript appended");
        Ok(())
    }

    /// Most recent `limit` entries of a session, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn history(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptEntry>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT role, content, created_at FROM (
                SELECT id, role, content, created_at FROM transcript_entries
                WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;

        let entries = stmt
            .query_map(params![session_id, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .filter_map(std::result::Result::ok)
            .filter_map(|(role, content, created_at)| {
                Some(TranscriptEntry {
                    role: Role::from_str(&role)?,
                    content,
                    timestamp: parse_datetime(&created_at),
                })
            })
            .collect();

        Ok(entries)
    }

    /// Full transcript of a session, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn transcript(&self, session_id: &str) -> Result<Vec<TranscriptEntry>> {
        self.history(session_id, usize::MAX)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
