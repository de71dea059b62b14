mod error;
mod extractor;
mod fallback;
mod handlers;
mod openai_types;
mod orchestrator;
mod recorder;
mod retriever;
mod slots;
mod speech;
mod store;
mod twilio_types;
mod types;

use crate::extractor::OpenAiSlotExtractor;
use crate::fallback::OpenAiFaqAnswerer;
use crate::orchestrator::TurnOrchestrator;
use crate::recorder::CallLog;
use crate::retriever::{KbRetriever, KnowledgeRetriever};
use crate::speech::SpeechService;
use crate::store::SessionStore;
use crate::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use tracing::warn;
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const RECORD_MAX_SECS: u16 = 20;
    pub const REPEAT_PROMPT: &str = "I did not catch that. Could you repeat after the beep?";
    pub const GENERIC_PROMPT: &str = "Could you share how I can help with your appointment?";
    pub const COMPLETED_CALL_LINE: &str =
        "This appointment is already confirmed. We look forward to seeing you. Goodbye.";
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("clinic_voice", tracing_subscriber::filter::LevelFilter::DEBUG),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let openai_api_key = env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set!");
    let twilio_account_sid = env::var("TWILIO_ACCOUNT_SID").expect("TWILIO_ACCOUNT_SID not set!");
    let twilio_auth_token = env::var("TWILIO_AUTH_TOKEN").expect("TWILIO_AUTH_TOKEN not set!");
    let elevenlabs_api_key = env::var("ELEVENLABS_API_KEY").expect("ELEVENLABS_API_KEY not set!");
    let elevenlabs_voice_id =
        env::var("ELEVENLABS_VOICE_ID").unwrap_or_else(|_| "21m00Tcm4TlvDq8ikWAM".to_string());
    let openai_model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let openai_slot_model = env::var("OPENAI_SLOT_MODEL").unwrap_or_else(|_| openai_model.clone());
    let whisper_model = env::var("WHISPER_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
    let public_base_url =
        env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let facility_name = env::var("FACILITY_NAME")
        .unwrap_or_else(|_| "Precision Pain and Spine Institute".to_string());

    let http_client = reqwest::Client::new();

    let database_url = env::var("DATABASE_URL").ok();
    let (sessions, call_log, kb_entries) = match &database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .expect("failed to connect to Postgres");
            store::PgSessionStore::ensure_schema(&pool)
                .await
                .expect("failed to create session schema");
            recorder::PgCallLog::ensure_schema(&pool)
                .await
                .expect("failed to create call log schema");
            retriever::ensure_kb_schema(&pool)
                .await
                .expect("failed to create kb schema");
            let entries = retriever::load_kb_entries(&pool)
                .await
                .expect("failed to load kb documents");
            (
                Arc::new(store::PgSessionStore::new(pool.clone())) as Arc<dyn SessionStore>,
                Arc::new(recorder::PgCallLog::new(pool)) as Arc<dyn CallLog>,
                entries,
            )
        }
        None => {
            warn!("DATABASE_URL not set; sessions and call logs are in-memory only");
            (
                Arc::new(store::MemorySessionStore::new()) as Arc<dyn SessionStore>,
                Arc::new(recorder::MemoryCallLog::new()) as Arc<dyn CallLog>,
                retriever::seed_documents(),
            )
        }
    };

    let retriever: Arc<dyn KnowledgeRetriever> =
        match KbRetriever::build(http_client.clone(), openai_api_key.clone(), kb_entries).await {
            Ok(retriever) => Arc::new(retriever),
            Err(e) => {
                warn!(error=%e, "failed to embed knowledge base; retrieval disabled");
                Arc::new(KbRetriever::empty(
                    http_client.clone(),
                    openai_api_key.clone(),
                ))
            }
        };
    let extractor = OpenAiSlotExtractor::new(
        http_client.clone(),
        openai_api_key.clone(),
        openai_slot_model,
    );
    let answerer = OpenAiFaqAnswerer::new(
        http_client.clone(),
        openai_api_key.clone(),
        openai_model,
    );
    let orchestrator = TurnOrchestrator::new(
        sessions,
        Arc::new(extractor),
        retriever,
        Arc::new(answerer),
        call_log.clone(),
    );
    let speech = SpeechService::new(
        http_client.clone(),
        openai_api_key,
        whisper_model,
        elevenlabs_api_key,
        elevenlabs_voice_id,
    );

    let app_state = Arc::new(AppState {
        facility_name,
        public_base_url,
        twilio_account_sid,
        twilio_auth_token,
        http_client,
        orchestrator,
        speech,
        call_log,
        tts_sequences: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/voice", post(handlers::voice_entry))
        .route("/recording_callback", post(handlers::recording_callback))
        .route("/tts/:filename", get(handlers::tts_file))
        .route("/api/call-logs", get(handlers::call_logs))
        .route("/api/simulate", post(handlers::simulate))
        .route("/", get(|| async { "clinic voice agent" }))
        .with_state(app_state);

    axum::Server::bind(&"0.0.0.0:3000".parse().unwrap())
        .serve(app.into_make_service())
        .await
        .unwrap();
}
