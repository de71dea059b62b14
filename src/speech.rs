use crate::error::AgentError;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const OPENAI_TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const ELEVENLABS_TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const ELEVENLABS_MODEL: &str = "eleven_flash_v2_5";

/// ElevenLabs rejects very long inputs; clip at a sentence boundary.
const MAX_TTS_CHARS: usize = 300;

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Speech collaborators: Whisper transcription in, ElevenLabs synthesis out.
pub struct SpeechService {
    http_client: reqwest::Client,
    openai_api_key: String,
    whisper_model: String,
    elevenlabs_api_key: String,
    elevenlabs_voice_id: String,
}

impl SpeechService {
    pub fn new(
        http_client: reqwest::Client,
        openai_api_key: String,
        whisper_model: String,
        elevenlabs_api_key: String,
        elevenlabs_voice_id: String,
    ) -> Self {
        Self {
            http_client,
            openai_api_key,
            whisper_model,
            elevenlabs_api_key,
            elevenlabs_voice_id,
        }
    }

    /// Transcribe one recorded caller turn.
    pub async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String, AgentError> {
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(filename.to_string())
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.whisper_model.clone());
        let resp = self
            .http_client
            .post(OPENAI_TRANSCRIPTIONS_URL)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.openai_api_key),
            )
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json::<TranscriptionResponse>()
            .await?;
        let text = resp.text.trim().to_string();
        debug!(transcript=%text, "transcribed recording");
        Ok(text)
    }

    /// Synthesize MP3 audio for one spoken reply.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AgentError> {
        let clipped = truncate_for_tts(text);
        if clipped.is_empty() {
            return Err(AgentError::Speech("empty tts text".to_string()));
        }
        let url = format!("{ELEVENLABS_TTS_URL}/{}", self.elevenlabs_voice_id);
        let payload = json!({
            "text": clipped,
            "model_id": ELEVENLABS_MODEL,
            "voice_settings": {
                "stability": 0.71,
                "similarity_boost": 0.5,
                "style": 0.35,
                "use_speaker_boost": true,
            },
        });
        let resp = self
            .http_client
            .post(url)
            .header("xi-api-key", &self.elevenlabs_api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let audio = resp.bytes().await?.to_vec();
        if audio.is_empty() {
            return Err(AgentError::Speech("no audio data generated".to_string()));
        }
        Ok(audio)
    }
}

/// Clip overlong replies at the last sentence ending that fits, falling back
/// to a hard cut with an ellipsis.
pub fn truncate_for_tts(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_TTS_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(MAX_TTS_CHARS).collect();
    match clipped.rfind(['.', '!', '?']) {
        Some(idx) => clipped[..=idx].trim().to_string(),
        None => format!("{}...", clipped.trim_end()),
    }
}
