use crate::orchestrator::TurnOrchestrator;
use crate::recorder::CallLog;
use crate::slots::{SlotKey, Slots};
use crate::speech::SpeechService;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What kind of turn this was, for the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    SlotFilling,
    FaqAnswer,
    Confirmation,
}

impl TurnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnMode::SlotFilling => "slot_filling",
            TurnMode::FaqAnswer => "faq_answer",
            TurnMode::Confirmation => "confirmation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "slot_filling" => Some(TurnMode::SlotFilling),
            "faq_answer" => Some(TurnMode::FaqAnswer),
            "confirmation" => Some(TurnMode::Confirmation),
            _ => None,
        }
    }
}

impl std::fmt::Display for TurnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the telephony layer should do next: speak this text, then either
/// record another caller turn or hang up.
#[derive(Clone, Debug, Serialize)]
pub struct Directive {
    pub speak_text: String,
    pub continue_recording: bool,
}

/// Full result of one orchestrated turn.  The directive is what the caller
/// experiences; the rest feeds the audit trail and the simulation endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub directive: Directive,
    pub mode: TurnMode,
    pub slots: Slots,
    pub missing_slots: Vec<SlotKey>,
    pub used_docs: Vec<String>,
    pub appointment_id: Option<Uuid>,
    pub turn_count: u32,
}

pub struct AppState {
    pub facility_name: String,
    pub public_base_url: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub http_client: reqwest::Client,
    pub orchestrator: TurnOrchestrator,
    pub speech: SpeechService,
    pub call_log: Arc<dyn CallLog>,
    // call sid => next tts file sequence number
    pub tts_sequences: Mutex<HashMap<String, u32>>,
}
