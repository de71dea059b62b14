use crate::consts::{RECORD_MAX_SECS, REPEAT_PROMPT};
use crate::error::AgentError;
use crate::twilio_types::{
    wrap_twiml, HangupAction, PlayAction, RecordAction, RecordingCallbackPayload, Response,
    ResponseAction, SayAction,
};
use crate::types::AppState;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, trace};
use uuid::Uuid;

fn xml_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/xml".parse().unwrap());
    headers
}

fn record_action(public_base_url: &str) -> RecordAction {
    RecordAction {
        action: format!("{public_base_url}/recording_callback"),
        method: Some("POST".to_string()),
        max_length: Some(RECORD_MAX_SECS),
        play_beep: Some("true".to_string()),
        ..Default::default()
    }
}

fn twiml_reply(response: Response) -> (StatusCode, HeaderMap, String) {
    let twiml = wrap_twiml(xmlserde::xml_serialize(response));
    trace!(twiml=%twiml, "twiml response");
    (StatusCode::OK, xml_headers(), twiml)
}

/// Say a prompt and record the next caller turn.
fn say_and_record(app_state: &AppState, text: String) -> (StatusCode, HeaderMap, String) {
    let response = Response {
        actions: vec![
            ResponseAction::Say(SayAction {
                text,
                ..Default::default()
            }),
            ResponseAction::Record(record_action(&app_state.public_base_url)),
        ],
    };
    twiml_reply(response)
}

/// Entry point for an inbound call: greet, then record the first turn.
pub async fn voice_entry(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("incoming call hit /voice");
    let greeting = format!(
        "Thanks for calling {}. After the beep, let me know how I can help.",
        app_state.facility_name
    );
    say_and_record(&app_state, greeting)
}

/// Twilio posts here after each Record verb: transcribe the turn, run the
/// orchestrator, speak the directive back.
pub async fn recording_callback(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "recording callback body");
    let payload = match serde_urlencoded::from_str::<RecordingCallbackPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize recording callback payload");
            return (
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                "Bad request".to_string(),
            );
        }
    };
    info!(call_sid=%payload.call_sid, "processing recording");

    let transcript = match fetch_transcript(&app_state, &payload).await {
        Ok(transcript) => transcript,
        Err(e) => {
            error!(call_sid=%payload.call_sid, error=%e, "failed to transcribe recording");
            String::new()
        }
    };
    if transcript.trim().is_empty() {
        return say_and_record(&app_state, REPEAT_PROMPT.to_string());
    }

    let outcome = app_state
        .orchestrator
        .process_turn(&payload.call_sid, transcript.trim(), payload.from.as_deref())
        .await;

    let mut actions = Vec::new();
    match synthesize_reply(&app_state, &payload.call_sid, &outcome.directive.speak_text).await {
        Ok(audio_url) => actions.push(ResponseAction::Play(PlayAction {
            url: audio_url,
            ..Default::default()
        })),
        Err(e) => {
            // Degrade to Twilio's own voice rather than dropping the turn.
            error!(call_sid=%payload.call_sid, error=%e, "tts failed; falling back to Say");
            actions.push(ResponseAction::Say(SayAction {
                text: outcome.directive.speak_text.clone(),
                ..Default::default()
            }));
        }
    }
    if outcome.directive.continue_recording {
        actions.push(ResponseAction::Record(record_action(
            &app_state.public_base_url,
        )));
    } else {
        // The call never speaks again; drop its sequence counter.
        clear_tts_sequence(&app_state.tts_sequences, &payload.call_sid);
        actions.push(ResponseAction::Hangup(HangupAction::default()));
    }

    twiml_reply(Response { actions })
}

/// Pull the recorded audio from Twilio and run it through Whisper.
async fn fetch_transcript(
    app_state: &AppState,
    payload: &RecordingCallbackPayload,
) -> Result<String, AgentError> {
    let url = if payload.recording_url.ends_with(".wav") {
        payload.recording_url.clone()
    } else {
        format!("{}.wav", payload.recording_url)
    };
    let resp = app_state
        .http_client
        .get(url)
        .basic_auth(
            &app_state.twilio_account_sid,
            Some(&app_state.twilio_auth_token),
        )
        .send()
        .await?
        .error_for_status()?;
    let audio = resp.bytes().await?.to_vec();
    let filename = format!("{}.wav", payload.call_sid);
    app_state.speech.transcribe(audio, &filename).await
}

/// Synthesize the reply, store it under static/tts, and return its public
/// URL.
async fn synthesize_reply(
    app_state: &AppState,
    call_sid: &str,
    text: &str,
) -> Result<String, AgentError> {
    let seq = next_tts_sequence(&app_state.tts_sequences, call_sid);
    let audio = app_state.speech.synthesize(text).await?;
    let filename = format!("{call_sid}_{seq}.mp3");
    tokio::fs::create_dir_all("static/tts").await?;
    tokio::fs::write(format!("static/tts/{filename}"), audio).await?;
    Ok(format!("{}/tts/{filename}", app_state.public_base_url))
}

fn next_tts_sequence(sequences: &Mutex<HashMap<String, u32>>, call_sid: &str) -> u32 {
    let mut sequences = sequences.lock().unwrap();
    let seq = sequences.entry(call_sid.to_string()).or_insert(0);
    *seq += 1;
    *seq
}

fn clear_tts_sequence(sequences: &Mutex<HashMap<String, u32>>, call_sid: &str) {
    sequences.lock().unwrap().remove(call_sid);
}

/// Serve a generated TTS file back to Twilio's Play verb.
pub async fn tts_file(Path(filename): Path<String>) -> impl IntoResponse {
    if filename.contains('/') || filename.contains("..") {
        return Err(StatusCode::NOT_FOUND);
    }
    match tokio::fs::read(format!("static/tts/{filename}")).await {
        Ok(body) => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, "audio/mpeg".parse().unwrap());
            Ok((headers, body))
        }
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
pub struct CallLogQuery {
    pub limit: Option<i64>,
}

/// Read-only console surface: the most recent turn records.
pub async fn call_logs(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<CallLogQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match app_state.call_log.fetch_recent(limit).await {
        Ok(items) => Ok(Json(json!({ "items": items }))),
        Err(e) => {
            error!(error=%e, "failed to fetch call logs");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Deserialize)]
pub struct SimulatePayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub from_number: Option<String>,
}

/// Text-only turn simulation for development: no audio, no Twilio, just the
/// orchestrated outcome as JSON.
pub async fn simulate(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    let payload = match serde_urlencoded::from_str::<SimulatePayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize simulate payload");
            return Err(StatusCode::BAD_REQUEST);
        }
    };
    let transcript = payload.text.trim().to_string();
    if transcript.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let call_sid = format!("SIM-{}", Uuid::new_v4().simple());
    let outcome = app_state
        .orchestrator
        .process_turn(&call_sid, &transcript, payload.from_number.as_deref())
        .await;
    Ok(Json(json!({
        "call_sid": call_sid,
        "transcript": transcript,
        "outcome": outcome,
    })))
}
