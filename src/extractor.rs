use crate::error::AgentError;
use crate::openai_types::{
    OpenAIBatchResponse, OpenAIMessage, OpenAIPayload, ResponseFormat, OPENAI_CHAT_URL,
};
use crate::slots::{SlotKey, SlotUpdate, Slots};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

const SLOT_EXTRACTION_SYSTEM_PROMPT: &str = "You are a structured appointment assistant for a \
medical clinic. Extract patient details from the caller's utterance and respond conversationally. \
Return a JSON object with the keys patient_name, appointment_reason, preferred_date, \
preferred_time, doctor_preference (string or null each) and reply (a short spoken follow-up). \
When values are missing, ask concise follow-up questions. If the caller asks a general clinic \
question, answer briefly but still remind them you can schedule appointments.";

/// Extraction collaborator: turns one utterance plus the known slots into a
/// `SlotUpdate`.  A malformed response is an error; the orchestrator treats it
/// as a no-op merge.
#[async_trait]
pub trait SlotExtractor: Send + Sync {
    async fn extract(&self, transcript: &str, current: &Slots) -> Result<SlotUpdate, AgentError>;
}

pub struct OpenAiSlotExtractor {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiSlotExtractor {
    pub fn new(http_client: reqwest::Client, api_key: String, model: String) -> Self {
        Self {
            http_client,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl SlotExtractor for OpenAiSlotExtractor {
    async fn extract(&self, transcript: &str, current: &Slots) -> Result<SlotUpdate, AgentError> {
        let mut known = serde_json::Map::new();
        for key in SlotKey::ALL {
            if let Some(value) = current.get(key) {
                known.insert(key.as_str().to_string(), json!(value));
            }
        }
        let payload = OpenAIPayload {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: SLOT_EXTRACTION_SYSTEM_PROMPT.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: json!({
                        "known_slots": known,
                        "utterance": transcript,
                    })
                    .to_string(),
                },
            ],
            response_format: Some(ResponseFormat::json_object()),
            ..Default::default()
        };
        let resp = self
            .http_client
            .post(OPENAI_CHAT_URL)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&payload)
            .send()
            .await?
            .json::<OpenAIBatchResponse>()
            .await?;
        let content = resp
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| AgentError::Extraction("no choices in completion".to_string()))?;
        debug!(content=%content, "slot extraction completion");

        parse_slot_payload(content)
    }
}

/// Decode the model's JSON into a normalized `SlotUpdate`.  Values are
/// trimmed; whitespace-only values count as absent.
pub fn parse_slot_payload(content: &str) -> Result<SlotUpdate, AgentError> {
    let mut update: SlotUpdate = serde_json::from_str(content)
        .map_err(|e| AgentError::Extraction(format!("undecodable slot payload: {e}")))?;
    for value in [
        &mut update.patient_name,
        &mut update.appointment_reason,
        &mut update.preferred_date,
        &mut update.preferred_time,
        &mut update.doctor_preference,
        &mut update.reply,
    ] {
        if let Some(v) = value.take() {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                *value = Some(trimmed.to_string());
            }
        }
    }
    Ok(update)
}
