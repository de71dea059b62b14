use crate::error::AgentError;
use crate::slots::Slots;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, Pool, Postgres, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// How long an untouched session survives in the in-memory backend.
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Collecting,
    Confirming,
    Completed,
}

/// Everything we track for one phone call, keyed by the Twilio call sid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallSession {
    pub call_sid: String,
    pub caller_phone: Option<String>,
    pub slots: Slots,
    pub turn_count: u32,
    pub state: CallState,
    pub booking_id: Option<Uuid>,
}

impl CallSession {
    pub fn new(call_sid: &str) -> Self {
        Self {
            call_sid: call_sid.to_string(),
            caller_phone: None,
            slots: Slots::default(),
            turn_count: 0,
            state: CallState::Collecting,
            booking_id: None,
        }
    }
}

/// Keyed storage of call sessions.  `get` returns a fresh default session for
/// unknown sids; `set` is a whole-state replace.  Backends must be safe to
/// call concurrently for different sids; the orchestrator serializes turns
/// within a single sid.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, call_sid: &str) -> Result<CallSession, AgentError>;
    async fn set(&self, call_sid: &str, session: &CallSession) -> Result<(), AgentError>;
    async fn clear(&self, call_sid: &str) -> Result<(), AgentError>;
}

/// Best-effort fallback backend: sessions live in process memory with a TTL
/// and are lost on restart.  Used when no `DATABASE_URL` is configured.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, (CallSession, Instant)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, call_sid: &str) -> Result<CallSession, AgentError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some((session, expires_at)) = entries.get(call_sid) {
            if *expires_at > Instant::now() {
                return Ok(session.clone());
            }
        }
        entries.remove(call_sid);
        Ok(CallSession::new(call_sid))
    }

    async fn set(&self, call_sid: &str, session: &CallSession) -> Result<(), AgentError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(call_sid.to_string(), (session.clone(), now + SESSION_TTL));
        Ok(())
    }

    async fn clear(&self, call_sid: &str) -> Result<(), AgentError> {
        self.entries.lock().unwrap().remove(call_sid);
        Ok(())
    }
}

/// Durable backend: one jsonb row per call sid, replaced wholesale on write.
pub struct PgSessionStore {
    pool: Pool<Postgres>,
}

impl PgSessionStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(pool: &Pool<Postgres>) -> Result<(), AgentError> {
        sqlx::query(
            "
            create table if not exists call_sessions (
                call_sid text primary key,
                session jsonb not null,
                updated_at timestamptz not null default now()
            )
            ",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, call_sid: &str) -> Result<CallSession, AgentError> {
        let row = sqlx::query("select session from call_sessions where call_sid = $1")
            .bind(call_sid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("session")?;
                match serde_json::from_value(value) {
                    Ok(session) => Ok(session),
                    Err(e) => {
                        warn!(call_sid, error=%e, "corrupted session row; starting fresh");
                        Ok(CallSession::new(call_sid))
                    }
                }
            }
            None => Ok(CallSession::new(call_sid)),
        }
    }

    async fn set(&self, call_sid: &str, session: &CallSession) -> Result<(), AgentError> {
        sqlx::query(
            "
            insert into call_sessions (call_sid, session)
            values ($1, $2)
            on conflict (call_sid)
            do update set session = excluded.session, updated_at = now()
            ",
        )
        .bind(call_sid)
        .bind(Json(session))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, call_sid: &str) -> Result<(), AgentError> {
        sqlx::query("delete from call_sessions where call_sid = $1")
            .bind(call_sid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
