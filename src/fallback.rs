use crate::error::AgentError;
use crate::openai_types::{
    OpenAIBatchResponse, OpenAIMessage, OpenAIPayload, ResponseFormat, OPENAI_CHAT_URL,
};
use crate::retriever::{format_docs_for_prompt, RetrievedDocument};
use crate::slots::SlotKey;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Minimum cosine similarity at which the top hit counts as an answerable
/// caller question.
pub const RAG_SCORE_THRESHOLD: f32 = 0.70;

const RETRIEVAL_SYSTEM_PROMPT: &str = "You are a phone assistant for a medical clinic. Use the \
provided clinic documents to answer the caller's question concisely. If the answer is in the \
documents, rely only on that information. Respond in a warm, conversational tone suitable for a \
phone call, using at most two sentences. Return a JSON object with keys: response (the spoken \
reply) and developer_note (an object with used_docs, a list of document ids, and confidence, a \
0-1 float).";

/// Whether this turn should be answered from retrieved knowledge: the top hit
/// must clear the confidence threshold and the booking must still be
/// incomplete.  Otherwise the turn stays in plain slot-filling mode.
pub fn wants_faq_answer(documents: &[RetrievedDocument], missing: &[SlotKey]) -> bool {
    match documents.first() {
        Some(top) => top.score >= RAG_SCORE_THRESHOLD && !missing.is_empty(),
        None => false,
    }
}

#[derive(Debug)]
pub struct FaqAnswer {
    pub text: String,
    pub used_docs: Vec<String>,
}

/// Synthesizes a spoken answer to a general question from retrieved
/// documents.
#[async_trait]
pub trait FaqAnswerer: Send + Sync {
    async fn answer(
        &self,
        transcript: &str,
        documents: &[RetrievedDocument],
    ) -> Result<FaqAnswer, AgentError>;
}

pub struct OpenAiFaqAnswerer {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiFaqAnswerer {
    pub fn new(http_client: reqwest::Client, api_key: String, model: String) -> Self {
        Self {
            http_client,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl FaqAnswerer for OpenAiFaqAnswerer {
    async fn answer(
        &self,
        transcript: &str,
        documents: &[RetrievedDocument],
    ) -> Result<FaqAnswer, AgentError> {
        let context = format_docs_for_prompt(documents);
        let payload = OpenAIPayload {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: RETRIEVAL_SYSTEM_PROMPT.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: format!(
                        "Context documents:\n{context}\n\nCaller transcript:\n\"{transcript}\""
                    ),
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
            .ok_or_else(|| AgentError::Retrieval("no choices in faq completion".to_string()))?;
        debug!(content=%content, "faq answer completion");

        let mut answer = parse_faq_payload(content)?;
        if answer.used_docs.is_empty() {
            answer.used_docs = documents.iter().map(|d| d.id.clone()).collect();
        }
        Ok(answer)
    }
}

#[derive(Deserialize)]
struct FaqPayload {
    response: String,
    #[serde(default)]
    developer_note: FaqNote,
}

#[derive(Deserialize, Default)]
struct FaqNote {
    #[serde(default)]
    used_docs: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    confidence: Option<f32>,
}

fn parse_faq_payload(content: &str) -> Result<FaqAnswer, AgentError> {
    let payload: FaqPayload = serde_json::from_str(content)
        .map_err(|e| AgentError::Retrieval(format!("undecodable faq payload: {e}")))?;
    let text = payload.response.trim().to_string();
    if text.is_empty() {
        return Err(AgentError::Retrieval("empty faq response".to_string()));
    }
    Ok(FaqAnswer {
        text,
        used_docs: payload.developer_note.used_docs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, score: f32) -> RetrievedDocument {
        RetrievedDocument {
            id: id.to_string(),
            text: format!("text for {id}"),
            score,
        }
    }

    #[test]
    fn faq_mode_requires_confident_hit_and_missing_slot() {
        let missing = vec![SlotKey::PreferredTime];
        assert!(wants_faq_answer(&[doc("a", 0.82)], &missing));
        // threshold is inclusive
        assert!(wants_faq_answer(&[doc("a", 0.70)], &missing));
        assert!(!wants_faq_answer(&[doc("a", 0.699)], &missing));
        assert!(!wants_faq_answer(&[doc("a", 0.40)], &missing));
        assert!(!wants_faq_answer(&[], &missing));
        // complete bookings never answer in faq mode
        assert!(!wants_faq_answer(&[doc("a", 0.95)], &[]));
    }

    #[test]
    fn parses_faq_payload_with_note() {
        let answer = parse_faq_payload(
            r#"{"response": "We are open 9 to 6.", "developer_note": {"used_docs": ["faq_hours"], "confidence": 0.9}}"#,
        )
        .unwrap();
        assert_eq!(answer.text, "We are open 9 to 6.");
        assert_eq!(answer.used_docs, vec!["faq_hours".to_string()]);
    }

    #[test]
    fn missing_note_defaults_to_no_docs() {
        let answer = parse_faq_payload(r#"{"response": "We are open 9 to 6."}"#).unwrap();
        assert!(answer.used_docs.is_empty());
    }

    #[test]
    fn rejects_malformed_or_empty_payload() {
        assert!(parse_faq_payload("not json").is_err());
        assert!(parse_faq_payload(r#"{"response": "   "}"#).is_err());
    }
}
