use crate::error::AgentError;
use crate::slots::{SlotKey, Slots};
use crate::types::TurnMode;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use sqlx::{types::Json, Pool, Postgres, Row};
use std::sync::Mutex;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

/// Immutable audit record of one processed turn.  Written once, never
/// mutated; persistence is best-effort relative to the caller-facing
/// directive.
#[derive(Clone, Debug, Serialize)]
pub struct TurnRecord {
    pub call_sid: String,
    pub caller_phone: Option<String>,
    pub transcript: String,
    pub mode: TurnMode,
    pub slots_snapshot: Slots,
    pub missing_slots: Vec<SlotKey>,
    pub used_docs: Vec<String>,
    pub reply_text: String,
    pub appointment_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

/// The appointment produced at booking finalization: the call sid plus the
/// five collected values.  Immutable once persisted.
#[derive(Clone, Debug, Serialize)]
pub struct AppointmentDraft {
    pub call_sid: String,
    pub patient_name: String,
    pub appointment_reason: String,
    pub preferred_date: String,
    pub preferred_time: String,
    pub doctor_preference: String,
}

impl AppointmentDraft {
    /// Build a draft from completed slots.  Callers guarantee completeness;
    /// an unexpectedly empty field is stored as the empty string rather than
    /// aborting the booking.
    pub fn from_slots(call_sid: &str, slots: &Slots) -> Self {
        let value = |key: SlotKey| slots.get(key).unwrap_or("").to_string();
        Self {
            call_sid: call_sid.to_string(),
            patient_name: value(SlotKey::PatientName),
            appointment_reason: value(SlotKey::AppointmentReason),
            preferred_date: value(SlotKey::PreferredDate),
            preferred_time: value(SlotKey::PreferredTime),
            doctor_preference: value(SlotKey::DoctorPreference),
        }
    }
}

/// Structured note forwarded alongside each turn record for operator
/// debugging.
pub fn developer_note(record: &TurnRecord) -> serde_json::Value {
    json!({
        "mode": record.mode,
        "slots": record.slots_snapshot,
        "missing_slots": record.missing_slots,
        "used_docs": record.used_docs,
        "appointment_id": record.appointment_id,
    })
}

/// Persistence collaborator for audit records and appointments.
#[async_trait]
pub trait CallLog: Send + Sync {
    async fn write_turn_record(&self, record: &TurnRecord) -> Result<(), AgentError>;
    async fn write_appointment(&self, draft: &AppointmentDraft) -> Result<Uuid, AgentError>;
    async fn fetch_recent(&self, limit: i64) -> Result<Vec<TurnRecord>, AgentError>;
}

pub struct PgCallLog {
    pool: Pool<Postgres>,
}

impl PgCallLog {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(pool: &Pool<Postgres>) -> Result<(), AgentError> {
        sqlx::query("create extension if not exists pgcrypto")
            .execute(pool)
            .await?;
        sqlx::query(
            "
            create table if not exists call_logs (
                id uuid default gen_random_uuid() primary key,
                call_sid varchar(64) not null,
                phone_number varchar(32),
                transcript text,
                mode text,
                slots jsonb,
                missing_slots jsonb,
                used_docs jsonb,
                reply_text text,
                appointment_id uuid,
                developer_note jsonb,
                created_at timestamptz not null default now()
            )
            ",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "
            create table if not exists appointments (
                id uuid default gen_random_uuid() primary key,
                call_sid varchar(64) not null,
                patient_name text,
                appointment_reason text,
                preferred_date text,
                preferred_time text,
                doctor_preference text,
                created_at timestamptz not null default now()
            )
            ",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CallLog for PgCallLog {
    async fn write_turn_record(&self, record: &TurnRecord) -> Result<(), AgentError> {
        sqlx::query(
            "
            insert into call_logs (
                call_sid, phone_number, transcript, mode, slots,
                missing_slots, used_docs, reply_text, appointment_id,
                developer_note, created_at
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(&record.call_sid)
        .bind(&record.caller_phone)
        .bind(&record.transcript)
        .bind(record.mode.as_str())
        .bind(Json(&record.slots_snapshot))
        .bind(Json(&record.missing_slots))
        .bind(Json(&record.used_docs))
        .bind(&record.reply_text)
        .bind(record.appointment_id)
        .bind(developer_note(record))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_appointment(&self, draft: &AppointmentDraft) -> Result<Uuid, AgentError> {
        let id: Uuid = sqlx::query_scalar(
            "
            insert into appointments (
                call_sid, patient_name, appointment_reason,
                preferred_date, preferred_time, doctor_preference
            )
            values ($1, $2, $3, $4, $5, $6)
            returning id
            ",
        )
        .bind(&draft.call_sid)
        .bind(&draft.patient_name)
        .bind(&draft.appointment_reason)
        .bind(&draft.preferred_date)
        .bind(&draft.preferred_time)
        .bind(&draft.doctor_preference)
        .fetch_one(&self.pool)
        .await?;
        info!(call_sid=%draft.call_sid, appointment_id=%id, "appointment persisted");
        Ok(id)
    }

    async fn fetch_recent(&self, limit: i64) -> Result<Vec<TurnRecord>, AgentError> {
        let rows = sqlx::query(
            "
            select call_sid, phone_number, transcript, mode, slots,
                   missing_slots, used_docs, reply_text, appointment_id, created_at
            from call_logs
            order by created_at desc
            limit $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mode: String = row.try_get("mode")?;
            let slots: serde_json::Value = row.try_get("slots")?;
            let missing: serde_json::Value = row.try_get("missing_slots")?;
            let used_docs: serde_json::Value = row.try_get("used_docs")?;
            records.push(TurnRecord {
                call_sid: row.try_get("call_sid")?,
                caller_phone: row.try_get("phone_number")?,
                transcript: row.try_get("transcript")?,
                mode: TurnMode::from_str(&mode).unwrap_or(TurnMode::SlotFilling),
                slots_snapshot: serde_json::from_value(slots).unwrap_or_default(),
                missing_slots: serde_json::from_value(missing).unwrap_or_default(),
                used_docs: serde_json::from_value(used_docs).unwrap_or_default(),
                reply_text: row.try_get("reply_text")?,
                appointment_id: row.try_get("appointment_id")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(records)
    }
}

/// Fallback persistence when no database is configured: records are kept in
/// memory for the console endpoint and appointment ids are generated locally.
/// Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCallLog {
    turns: Mutex<Vec<TurnRecord>>,
    appointments: Mutex<Vec<(Uuid, AppointmentDraft)>>,
}

impl MemoryCallLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallLog for MemoryCallLog {
    async fn write_turn_record(&self, record: &TurnRecord) -> Result<(), AgentError> {
        self.turns.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn write_appointment(&self, draft: &AppointmentDraft) -> Result<Uuid, AgentError> {
        let id = Uuid::new_v4();
        info!(call_sid=%draft.call_sid, appointment_id=%id, "appointment recorded in memory");
        self.appointments.lock().unwrap().push((id, draft.clone()));
        Ok(id)
    }

    async fn fetch_recent(&self, limit: i64) -> Result<Vec<TurnRecord>, AgentError> {
        let turns = self.turns.lock().unwrap();
        let take = limit.max(0) as usize;
        Ok(turns.iter().rev().take(take).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(call_sid: &str, reply: &str) -> TurnRecord {
        TurnRecord {
            call_sid: call_sid.to_string(),
            caller_phone: None,
            transcript: "hello".to_string(),
            mode: TurnMode::SlotFilling,
            slots_snapshot: Slots::default(),
            missing_slots: SlotKey::ALL.to_vec(),
            used_docs: vec![],
            reply_text: reply.to_string(),
            appointment_id: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn memory_log_returns_most_recent_first() {
        let log = MemoryCallLog::new();
        log.write_turn_record(&record("CA1", "first")).await.unwrap();
        log.write_turn_record(&record("CA1", "second")).await.unwrap();
        log.write_turn_record(&record("CA2", "third")).await.unwrap();

        let recent = log.fetch_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].reply_text, "third");
        assert_eq!(recent[1].reply_text, "second");
    }

    #[tokio::test]
    async fn memory_log_generates_appointment_ids() {
        let log = MemoryCallLog::new();
        let draft = AppointmentDraft::from_slots(
            "CA1",
            &Slots {
                patient_name: Some("Jane Doe".to_string()),
                appointment_reason: Some("consultation".to_string()),
                preferred_date: Some("July 10".to_string()),
                preferred_time: Some("10 AM".to_string()),
                doctor_preference: Some("Dr. Rao".to_string()),
            },
        );
        let a = log.write_appointment(&draft).await.unwrap();
        let b = log.write_appointment(&draft).await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn developer_note_carries_mode_and_missing() {
        let note = developer_note(&record("CA1", "hi"));
        assert_eq!(note["mode"], "slot_filling");
        assert_eq!(note["missing_slots"].as_array().unwrap().len(), 5);
    }
}
