use crate::consts::{COMPLETED_CALL_LINE, GENERIC_PROMPT, REPEAT_PROMPT};
use crate::error::AgentError;
use crate::extractor::SlotExtractor;
use crate::fallback::{wants_faq_answer, FaqAnswerer};
use crate::recorder::{AppointmentDraft, CallLog, TurnRecord};
use crate::retriever::KnowledgeRetriever;
use crate::slots::{self, SlotKey, SlotUpdate, Slots};
use crate::store::{CallState, SessionStore};
use crate::types::{Directive, TurnMode, TurnOutcome};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Upper bound on any single collaborator call.  A slow extraction or
/// retrieval degrades the turn instead of leaving the caller in silence.
const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives one call through its turns: merges extracted slots, chooses between
/// slot-filling and FAQ-answer replies, and finalizes the booking exactly
/// once.  Turns for the same call sid are serialized; different sids run
/// concurrently.
pub struct TurnOrchestrator {
    sessions: Arc<dyn SessionStore>,
    extractor: Arc<dyn SlotExtractor>,
    retriever: Arc<dyn KnowledgeRetriever>,
    answerer: Arc<dyn FaqAnswerer>,
    call_log: Arc<dyn CallLog>,
    // call sid => lock held for the duration of one turn
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TurnOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        extractor: Arc<dyn SlotExtractor>,
        retriever: Arc<dyn KnowledgeRetriever>,
        answerer: Arc<dyn FaqAnswerer>,
        call_log: Arc<dyn CallLog>,
    ) -> Self {
        Self {
            sessions,
            extractor,
            retriever,
            answerer,
            call_log,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    fn turn_lock(&self, call_sid: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock().unwrap();
        locks.entry(call_sid.to_string()).or_default().clone()
    }

    fn release_turn_lock(&self, call_sid: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.turn_locks.lock().unwrap();
        // While the map lock is held no new clone can be handed out, so two
        // refs (the map entry and ours) means no other turn is in flight.
        if Arc::strong_count(lock) <= 2 {
            locks.remove(call_sid);
        }
    }

    /// Process one caller utterance and decide the next directive.  Every
    /// collaborator failure degrades; this never fails outward.
    pub async fn process_turn(
        &self,
        call_sid: &str,
        transcript: &str,
        caller_phone: Option<&str>,
    ) -> TurnOutcome {
        let lock = self.turn_lock(call_sid);
        let outcome = {
            let _guard = lock.lock().await;
            self.run_turn(call_sid, transcript, caller_phone).await
        };
        self.release_turn_lock(call_sid, &lock);
        outcome
    }

    async fn run_turn(
        &self,
        call_sid: &str,
        transcript: &str,
        caller_phone: Option<&str>,
    ) -> TurnOutcome {
        let mut session = match self.sessions.get(call_sid).await {
            Ok(session) => session,
            Err(e) => {
                // A fabricated fresh session would be persisted over whatever
                // the store really holds, reopening finalized calls.  Ask the
                // caller to repeat and touch nothing.
                error!(call_sid, error=%e, "session load failed; asking caller to repeat");
                return TurnOutcome {
                    directive: Directive {
                        speak_text: REPEAT_PROMPT.to_string(),
                        continue_recording: true,
                    },
                    mode: TurnMode::SlotFilling,
                    slots: Slots::default(),
                    missing_slots: SlotKey::ALL.to_vec(),
                    used_docs: vec![],
                    appointment_id: None,
                    turn_count: 0,
                };
            }
        };

        // Late or duplicate delivery on a finalized call: terminal directive,
        // nothing persisted and no turn counted.
        if session.state == CallState::Completed {
            info!(call_sid, "turn on completed call rejected");
            return TurnOutcome {
                directive: Directive {
                    speak_text: COMPLETED_CALL_LINE.to_string(),
                    continue_recording: false,
                },
                mode: TurnMode::Confirmation,
                slots: session.slots.clone(),
                missing_slots: session.slots.missing(),
                used_docs: vec![],
                appointment_id: session.booking_id,
                turn_count: session.turn_count,
            };
        }

        if session.caller_phone.is_none() {
            session.caller_phone = caller_phone
                .filter(|p| !p.trim().is_empty())
                .map(|p| p.to_string());
        }
        session.turn_count += 1;

        // Retrieval is always attempted; its result is only used when the
        // fallback decision says so.
        let documents = match timeout(COLLABORATOR_TIMEOUT, self.retriever.retrieve(transcript))
            .await
        {
            Ok(Ok(documents)) => documents,
            Ok(Err(e)) => {
                error!(call_sid, error=%e, "retrieval failed; continuing in slot-filling mode");
                vec![]
            }
            Err(_) => {
                warn!(call_sid, "retrieval timed out; continuing in slot-filling mode");
                vec![]
            }
        };

        let update: Option<SlotUpdate> = match timeout(
            COLLABORATOR_TIMEOUT,
            self.extractor.extract(transcript, &session.slots),
        )
        .await
        {
            Ok(Ok(update)) => Some(update),
            Ok(Err(e)) => {
                error!(call_sid, error=%e, "slot extraction failed; merging nothing this turn");
                None
            }
            Err(_) => {
                warn!(call_sid, "slot extraction timed out; merging nothing this turn");
                None
            }
        };
        let slot_reply = update
            .as_ref()
            .and_then(|u| u.reply.as_deref())
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        if let Some(update) = &update {
            session.slots.merge(update);
        }
        let missing = session.slots.missing();

        let mut mode = TurnMode::SlotFilling;
        let mut used_docs: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        let mut reply_text = slot_reply.unwrap_or_default();

        if wants_faq_answer(&documents, &missing) {
            match timeout(
                COLLABORATOR_TIMEOUT,
                self.answerer.answer(transcript, &documents),
            )
            .await
            {
                Ok(Ok(answer)) => {
                    mode = TurnMode::FaqAnswer;
                    if !answer.used_docs.is_empty() {
                        used_docs = answer.used_docs;
                    }
                    reply_text = match missing.first() {
                        Some(key) => format!("{} {}", answer.text, slots::followup_prompt(*key)),
                        None => answer.text,
                    };
                }
                Ok(Err(e)) => {
                    error!(call_sid, error=%e, "faq answer failed; falling back to slot filling")
                }
                Err(_) => warn!(call_sid, "faq answer timed out; falling back to slot filling"),
            }
        }
        if reply_text.is_empty() {
            reply_text = match missing.first() {
                Some(key) => slots::followup_prompt(*key),
                None => GENERIC_PROMPT.to_string(),
            };
        }

        if let Err(e) = self.sessions.set(call_sid, &session).await {
            error!(call_sid, error=%e, "failed to persist merged slots");
        }

        let mut appointment_id = None;
        let mut continue_recording = true;
        if session.slots.is_complete() && session.state == CallState::Collecting {
            session.state = CallState::Confirming;
            mode = TurnMode::Confirmation;
            let draft = AppointmentDraft::from_slots(call_sid, &session.slots);
            match timeout(COLLABORATOR_TIMEOUT, self.call_log.write_appointment(&draft)).await {
                Ok(Ok(id)) => {
                    session.booking_id = Some(id);
                    appointment_id = Some(id);
                }
                // The caller still hears a confirmation; the lost booking is
                // an operator reconciliation item.
                Ok(Err(e)) => {
                    error!(call_sid, error=%e, "appointment write failed; booking needs reconciliation")
                }
                Err(_) => {
                    error!(call_sid, "appointment write timed out; booking needs reconciliation")
                }
            }
            session.state = CallState::Completed;
            reply_text = slots::confirmation_message(&session.slots);
            continue_recording = false;
            if let Err(e) = self.sessions.set(call_sid, &session).await {
                error!(call_sid, error=%e, "failed to persist completed session");
            }
        }

        let record = TurnRecord {
            call_sid: call_sid.to_string(),
            caller_phone: session.caller_phone.clone(),
            transcript: transcript.to_string(),
            mode,
            slots_snapshot: session.slots.clone(),
            missing_slots: missing.clone(),
            used_docs: used_docs.clone(),
            reply_text: reply_text.clone(),
            appointment_id,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.call_log.write_turn_record(&record).await {
            error!(call_sid, error=%e, "failed to persist turn record");
        }
        debug!(call_sid, mode=%mode, turn = session.turn_count, "turn processed");

        TurnOutcome {
            directive: Directive {
                speak_text: reply_text,
                continue_recording,
            },
            mode,
            slots: session.slots,
            missing_slots: missing,
            used_docs,
            appointment_id,
            turn_count: session.turn_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FaqAnswer;
    use crate::retriever::RetrievedDocument;
    use crate::slots::SlotKey;
    use crate::store::{CallSession, MemorySessionStore};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    struct FixedExtractor {
        update: StdMutex<Option<SlotUpdate>>,
    }

    impl FixedExtractor {
        fn returning(update: SlotUpdate) -> Self {
            Self {
                update: StdMutex::new(Some(update)),
            }
        }

        fn failing() -> Self {
            Self {
                update: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SlotExtractor for FixedExtractor {
        async fn extract(
            &self,
            _transcript: &str,
            _current: &crate::slots::Slots,
        ) -> Result<SlotUpdate, AgentError> {
            match self.update.lock().unwrap().clone() {
                Some(update) => Ok(update),
                None => Err(AgentError::Extraction("unparseable payload".to_string())),
            }
        }
    }

    struct FixedRetriever {
        documents: Vec<RetrievedDocument>,
    }

    #[async_trait]
    impl KnowledgeRetriever for FixedRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<RetrievedDocument>, AgentError> {
            Ok(self.documents.clone())
        }
    }

    struct FixedAnswerer {
        text: String,
    }

    #[async_trait]
    impl FaqAnswerer for FixedAnswerer {
        async fn answer(
            &self,
            _transcript: &str,
            documents: &[RetrievedDocument],
        ) -> Result<FaqAnswer, AgentError> {
            Ok(FaqAnswer {
                text: self.text.clone(),
                used_docs: documents.iter().map(|d| d.id.clone()).collect(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingCallLog {
        turns: StdMutex<Vec<TurnRecord>>,
        appointments: StdMutex<Vec<AppointmentDraft>>,
        fail_appointments: bool,
    }

    #[async_trait]
    impl CallLog for RecordingCallLog {
        async fn write_turn_record(&self, record: &TurnRecord) -> Result<(), AgentError> {
            self.turns.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn write_appointment(&self, draft: &AppointmentDraft) -> Result<Uuid, AgentError> {
            if self.fail_appointments {
                return Err(AgentError::Persistence("database unavailable".to_string()));
            }
            self.appointments.lock().unwrap().push(draft.clone());
            Ok(Uuid::new_v4())
        }

        async fn fetch_recent(&self, limit: i64) -> Result<Vec<TurnRecord>, AgentError> {
            let turns = self.turns.lock().unwrap();
            Ok(turns.iter().rev().take(limit as usize).cloned().collect())
        }
    }

    /// Delegates to a real memory store but can fail one `get`, the way a
    /// transient connection error would.
    struct FlakySessionStore {
        inner: MemorySessionStore,
        fail_next_get: StdMutex<bool>,
    }

    #[async_trait]
    impl SessionStore for FlakySessionStore {
        async fn get(&self, call_sid: &str) -> Result<CallSession, AgentError> {
            if std::mem::take(&mut *self.fail_next_get.lock().unwrap()) {
                return Err(AgentError::Persistence("connection reset".to_string()));
            }
            self.inner.get(call_sid).await
        }

        async fn set(&self, call_sid: &str, session: &CallSession) -> Result<(), AgentError> {
            self.inner.set(call_sid, session).await
        }

        async fn clear(&self, call_sid: &str) -> Result<(), AgentError> {
            self.inner.clear(call_sid).await
        }
    }

    fn doc(id: &str, score: f32) -> RetrievedDocument {
        RetrievedDocument {
            id: id.to_string(),
            text: "We are open Mon-Sat 9 to 6.".to_string(),
            score,
        }
    }

    fn orchestrator(
        extractor: FixedExtractor,
        documents: Vec<RetrievedDocument>,
        call_log: Arc<RecordingCallLog>,
    ) -> (TurnOrchestrator, Arc<MemorySessionStore>) {
        let sessions = Arc::new(MemorySessionStore::new());
        let orchestrator = TurnOrchestrator::new(
            sessions.clone(),
            Arc::new(extractor),
            Arc::new(FixedRetriever { documents }),
            Arc::new(FixedAnswerer {
                text: "We are open Monday to Saturday, nine to six.".to_string(),
            }),
            call_log,
        );
        (orchestrator, sessions)
    }

    fn four_filled_slots() -> SlotUpdate {
        SlotUpdate {
            patient_name: Some("Jane Doe".to_string()),
            appointment_reason: Some("consultation".to_string()),
            preferred_date: Some("July 10".to_string()),
            preferred_time: Some("10 AM".to_string()),
            doctor_preference: None,
            reply: Some("Thanks, noted.".to_string()),
        }
    }

    #[tokio::test]
    async fn first_turn_fills_name_and_continues() {
        let update = SlotUpdate {
            patient_name: Some("Jane Doe".to_string()),
            reply: Some("Thanks Jane, what brings you in?".to_string()),
            ..Default::default()
        };
        let log = Arc::new(RecordingCallLog::default());
        let (orch, _) = orchestrator(FixedExtractor::returning(update), vec![], log.clone());

        let outcome = orch.process_turn("CA1", "My name is Jane Doe", Some("+15551234")).await;
        assert_eq!(outcome.mode, TurnMode::SlotFilling);
        assert!(outcome.directive.continue_recording);
        assert_eq!(outcome.slots.patient_name.as_deref(), Some("Jane Doe"));
        assert_eq!(
            outcome.missing_slots,
            vec![
                SlotKey::AppointmentReason,
                SlotKey::PreferredDate,
                SlotKey::PreferredTime,
                SlotKey::DoctorPreference,
            ]
        );
        assert!(outcome.appointment_id.is_none());
        assert_eq!(log.turns.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn final_slot_completes_call_and_books_once() {
        let log = Arc::new(RecordingCallLog::default());
        let (orch, sessions) = orchestrator(
            FixedExtractor::returning(SlotUpdate {
                doctor_preference: Some("no preference".to_string()),
                ..Default::default()
            }),
            vec![],
            log.clone(),
        );
        // Pre-load a session that only lacks the doctor preference.
        let mut session = sessions.get("CA2").await.unwrap();
        session.slots.merge(&four_filled_slots());
        sessions.set("CA2", &session).await.unwrap();

        let outcome = orch.process_turn("CA2", "Any doctor is fine", None).await;
        assert_eq!(outcome.mode, TurnMode::Confirmation);
        assert!(!outcome.directive.continue_recording);
        assert!(outcome.directive.speak_text.contains("Jane Doe"));
        assert!(outcome.appointment_id.is_some());
        assert_eq!(log.appointments.lock().unwrap().len(), 1);

        let stored = sessions.get("CA2").await.unwrap();
        assert_eq!(stored.state, CallState::Completed);
        assert_eq!(stored.booking_id, outcome.appointment_id);
    }

    #[tokio::test]
    async fn completed_call_rejects_further_turns() {
        let log = Arc::new(RecordingCallLog::default());
        let (orch, sessions) =
            orchestrator(FixedExtractor::returning(four_filled_slots()), vec![], log.clone());
        let mut session = sessions.get("CA3").await.unwrap();
        session.state = CallState::Completed;
        session.slots.merge(&four_filled_slots());
        sessions.set("CA3", &session).await.unwrap();
        let before = sessions.get("CA3").await.unwrap();

        let outcome = orch.process_turn("CA3", "Hello again?", None).await;
        assert!(!outcome.directive.continue_recording);
        assert_eq!(outcome.turn_count, before.turn_count);
        assert!(log.appointments.lock().unwrap().is_empty());
        assert!(log.turns.lock().unwrap().is_empty());
        let after = sessions.get("CA3").await.unwrap();
        assert_eq!(after.slots, before.slots);
        assert_eq!(after.turn_count, before.turn_count);
    }

    #[tokio::test]
    async fn confident_hit_answers_faq_and_prompts_next_slot() {
        let update = SlotUpdate {
            reply: Some("Could you please share your full name?".to_string()),
            ..Default::default()
        };
        let log = Arc::new(RecordingCallLog::default());
        let (orch, _) = orchestrator(
            FixedExtractor::returning(update),
            vec![doc("faq_hours", 0.82), doc("faq_location", 0.60)],
            log.clone(),
        );

        let outcome = orch.process_turn("CA4", "What are your hours?", None).await;
        assert_eq!(outcome.mode, TurnMode::FaqAnswer);
        assert!(outcome
            .directive
            .speak_text
            .contains("Monday to Saturday"));
        assert!(outcome.directive.speak_text.contains("your full name"));
        assert!(outcome.directive.continue_recording);
        assert_eq!(outcome.used_docs[0], "faq_hours");
        // retrieval never mutates slots
        assert_eq!(outcome.missing_slots.len(), 5);
    }

    #[tokio::test]
    async fn low_score_stays_in_slot_filling_mode() {
        let update = SlotUpdate {
            reply: Some("Could you share how I can help?".to_string()),
            ..Default::default()
        };
        let log = Arc::new(RecordingCallLog::default());
        let (orch, _) = orchestrator(
            FixedExtractor::returning(update),
            vec![doc("faq_hours", 0.40)],
            log.clone(),
        );

        let outcome = orch.process_turn("CA5", "What are your hours?", None).await;
        assert_eq!(outcome.mode, TurnMode::SlotFilling);
        assert!(!outcome.directive.speak_text.contains("Monday to Saturday"));
    }

    #[tokio::test]
    async fn extraction_failure_degrades_to_noop_merge() {
        let log = Arc::new(RecordingCallLog::default());
        let (orch, sessions) = orchestrator(FixedExtractor::failing(), vec![], log.clone());
        let mut session = sessions.get("CA6").await.unwrap();
        session.slots.patient_name = Some("Jane Doe".to_string());
        sessions.set("CA6", &session).await.unwrap();

        let outcome = orch.process_turn("CA6", "mumble mumble", None).await;
        assert!(outcome.directive.continue_recording);
        assert_eq!(outcome.slots.patient_name.as_deref(), Some("Jane Doe"));
        assert_eq!(
            outcome.missing_slots,
            vec![
                SlotKey::AppointmentReason,
                SlotKey::PreferredDate,
                SlotKey::PreferredTime,
                SlotKey::DoctorPreference,
            ]
        );
        // degraded turns still prompt for the next missing slot
        assert!(outcome
            .directive
            .speak_text
            .contains("the reason for your visit"));
    }

    #[tokio::test]
    async fn booking_persistence_failure_still_confirms() {
        let log = Arc::new(RecordingCallLog {
            fail_appointments: true,
            ..Default::default()
        });
        let (orch, sessions) = orchestrator(
            FixedExtractor::returning(SlotUpdate {
                doctor_preference: Some("Dr. Rao".to_string()),
                ..Default::default()
            }),
            vec![],
            log.clone(),
        );
        let mut session = sessions.get("CA7").await.unwrap();
        session.slots.merge(&four_filled_slots());
        sessions.set("CA7", &session).await.unwrap();

        let outcome = orch.process_turn("CA7", "Doctor Rao please", None).await;
        assert_eq!(outcome.mode, TurnMode::Confirmation);
        assert!(!outcome.directive.continue_recording);
        assert!(outcome.appointment_id.is_none());
        let stored = sessions.get("CA7").await.unwrap();
        assert_eq!(stored.state, CallState::Completed);
        assert!(stored.booking_id.is_none());
    }

    #[tokio::test]
    async fn duplicate_concurrent_turns_book_at_most_once() {
        let log = Arc::new(RecordingCallLog::default());
        let (orch, sessions) = orchestrator(
            FixedExtractor::returning(SlotUpdate {
                doctor_preference: Some("no preference".to_string()),
                ..Default::default()
            }),
            vec![],
            log.clone(),
        );
        let mut session = sessions.get("CA8").await.unwrap();
        session.slots.merge(&four_filled_slots());
        sessions.set("CA8", &session).await.unwrap();

        let orch = Arc::new(orch);
        let a = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.process_turn("CA8", "3pm works", None).await })
        };
        let b = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.process_turn("CA8", "3pm works", None).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(log.appointments.lock().unwrap().len(), 1);
        assert!(!a.directive.continue_recording);
        assert!(!b.directive.continue_recording);
        assert!(a.appointment_id.or(b.appointment_id).is_some());
    }

    #[tokio::test]
    async fn different_calls_do_not_share_state() {
        let log = Arc::new(RecordingCallLog::default());
        let (orch, _) = orchestrator(
            FixedExtractor::returning(SlotUpdate {
                patient_name: Some("Jane Doe".to_string()),
                ..Default::default()
            }),
            vec![],
            log.clone(),
        );
        let first = orch.process_turn("CA9", "My name is Jane Doe", None).await;
        let second = orch.process_turn("CA10", "Hello", None).await;
        assert_eq!(first.turn_count, 1);
        assert_eq!(second.turn_count, 1);
    }

    #[tokio::test]
    async fn session_load_failure_degrades_without_touching_stored_state() {
        let log = Arc::new(RecordingCallLog::default());
        let store = Arc::new(FlakySessionStore {
            inner: MemorySessionStore::new(),
            fail_next_get: StdMutex::new(false),
        });
        let orch = TurnOrchestrator::new(
            store.clone(),
            Arc::new(FixedExtractor::returning(four_filled_slots())),
            Arc::new(FixedRetriever { documents: vec![] }),
            Arc::new(FixedAnswerer {
                text: "We are open nine to six.".to_string(),
            }),
            log.clone(),
        );
        let mut session = store.get("CA11").await.unwrap();
        session.slots.merge(&four_filled_slots());
        session.slots.doctor_preference = Some("Dr. Rao".to_string());
        session.state = CallState::Completed;
        session.turn_count = 5;
        store.set("CA11", &session).await.unwrap();

        *store.fail_next_get.lock().unwrap() = true;
        let outcome = orch.process_turn("CA11", "Hello again?", None).await;
        assert!(outcome.directive.continue_recording);
        assert!(outcome.appointment_id.is_none());
        assert!(log.turns.lock().unwrap().is_empty());
        assert!(log.appointments.lock().unwrap().is_empty());

        // The stored session survives the transient error untouched.
        let stored = store.get("CA11").await.unwrap();
        assert_eq!(stored.state, CallState::Completed);
        assert_eq!(stored.turn_count, 5);
        assert_eq!(stored.slots.patient_name.as_deref(), Some("Jane Doe"));
    }

    #[tokio::test]
    async fn turn_lock_entries_are_evicted_after_each_turn() {
        let log = Arc::new(RecordingCallLog::default());
        let (orch, _) = orchestrator(
            FixedExtractor::returning(SlotUpdate {
                patient_name: Some("Jane Doe".to_string()),
                ..Default::default()
            }),
            vec![],
            log.clone(),
        );
        for i in 0..5 {
            orch.process_turn(&format!("CA-{i}"), "My name is Jane Doe", None)
                .await;
        }
        assert!(orch.turn_locks.lock().unwrap().is_empty());
    }
}
