use crate::error::AgentError;
use crate::openai_types::{EmbeddingsPayload, EmbeddingsResponse, OPENAI_EMBEDDINGS_URL};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};

pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const RETRIEVAL_TOP_K: usize = 3;

/// One ranked knowledge-base hit.  `score` is cosine similarity in [0, 1].
#[derive(Clone, Debug, Serialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Retrieval collaborator.  Side-effect-free; the orchestrator always calls
/// it but only uses the result when the fallback decision says to.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedDocument>, AgentError>;
}

struct KbDoc {
    id: String,
    text: String,
    embedding: Vec<f32>,
}

/// Knowledge base held in memory: documents are embedded once at startup and
/// queries are ranked by cosine similarity against them.
pub struct KbRetriever {
    http_client: reqwest::Client,
    api_key: String,
    docs: Vec<KbDoc>,
}

impl KbRetriever {
    /// Embed the given `(id, text)` entries and build a ready retriever.
    pub async fn build(
        http_client: reqwest::Client,
        api_key: String,
        entries: Vec<(String, String)>,
    ) -> Result<Self, AgentError> {
        let inputs: Vec<String> = entries.iter().map(|(_, text)| text.clone()).collect();
        let embeddings = embed_batch(&http_client, &api_key, inputs).await?;
        if embeddings.len() != entries.len() {
            return Err(AgentError::Retrieval(format!(
                "embedding count mismatch: {} entries, {} embeddings",
                entries.len(),
                embeddings.len()
            )));
        }
        let docs = entries
            .into_iter()
            .zip(embeddings)
            .map(|((id, text), embedding)| KbDoc {
                id,
                text,
                embedding,
            })
            .collect::<Vec<_>>();
        info!(documents = docs.len(), "knowledge base ready");
        Ok(Self {
            http_client,
            api_key,
            docs,
        })
    }

    /// Retriever with no documents; every query degrades to slot-filling mode.
    pub fn empty(http_client: reqwest::Client, api_key: String) -> Self {
        Self {
            http_client,
            api_key,
            docs: Vec::new(),
        }
    }
}

#[async_trait]
impl KnowledgeRetriever for KbRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedDocument>, AgentError> {
        if query.trim().is_empty() || self.docs.is_empty() {
            return Ok(Vec::new());
        }
        let mut embeddings =
            embed_batch(&self.http_client, &self.api_key, vec![query.to_string()]).await?;
        let query_embedding = embeddings
            .pop()
            .ok_or_else(|| AgentError::Retrieval("no embedding for query".to_string()))?;

        let mut ranked: Vec<RetrievedDocument> = self
            .docs
            .iter()
            .map(|doc| RetrievedDocument {
                id: doc.id.clone(),
                text: doc.text.clone(),
                score: cosine_similarity(&query_embedding, &doc.embedding),
            })
            .collect();
        // Stable sort keeps the original document order for tied scores.
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(RETRIEVAL_TOP_K);
        debug!(top_score = ranked.first().map(|d| d.score), "ranked kb query");
        Ok(ranked)
    }
}

async fn embed_batch(
    http_client: &reqwest::Client,
    api_key: &str,
    input: Vec<String>,
) -> Result<Vec<Vec<f32>>, AgentError> {
    let payload = EmbeddingsPayload {
        model: EMBEDDING_MODEL.to_string(),
        input,
    };
    let mut resp = http_client
        .post(OPENAI_EMBEDDINGS_URL)
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
        .json(&payload)
        .send()
        .await?
        .json::<EmbeddingsResponse>()
        .await?;
    // The API documents order-by-index; don't rely on it.
    resp.data.sort_by_key(|item| item.index);
    Ok(resp.data.into_iter().map(|item| item.embedding).collect())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Render the top documents as context for the FAQ answer prompt.
pub fn format_docs_for_prompt(documents: &[RetrievedDocument]) -> String {
    let mut lines: Vec<String> = Vec::new();
    for doc in documents.iter().take(2) {
        lines.push(format!("[DOC id: {}]", doc.id));
        lines.push(doc.text.trim().to_string());
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

/// Built-in clinic knowledge used when no `kb_documents` table is available.
pub fn seed_documents() -> Vec<(String, String)> {
    [
        (
            "faq_hours",
            "The clinic is open Monday through Saturday, 9 AM to 6 PM. We are closed on Sundays \
             and public holidays.",
        ),
        (
            "faq_location",
            "We are located at 12 Harbor View Road, Suite 210, next to the Central Pharmacy. \
             Street parking and a patient lot are available.",
        ),
        (
            "faq_insurance",
            "We accept most major insurance plans. Please bring your insurance card and a photo \
             ID to your first visit.",
        ),
        (
            "faq_cancellation",
            "Appointments can be cancelled or rescheduled up to 24 hours in advance at no charge \
             by calling the front desk.",
        ),
        (
            "faq_first_visit",
            "New patients should arrive 15 minutes early to complete intake forms, and bring any \
             recent imaging or referral letters.",
        ),
    ]
    .into_iter()
    .map(|(id, text)| (id.to_string(), text.to_string()))
    .collect()
}

pub async fn ensure_kb_schema(pool: &Pool<Postgres>) -> Result<(), AgentError> {
    sqlx::query(
        "
        create table if not exists kb_documents (
            id text primary key,
            text text not null
        )
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Knowledge-base entries from Postgres, or the built-in seed when the table
/// is empty.
pub async fn load_kb_entries(pool: &Pool<Postgres>) -> Result<Vec<(String, String)>, AgentError> {
    let rows = sqlx::query("select id, text from kb_documents order by id")
        .fetch_all(pool)
        .await?;
    if rows.is_empty() {
        return Ok(seed_documents());
    }
    rows.into_iter()
        .map(|row| {
            let id: String = row.try_get("id")?;
            let text: String = row.try_get("text")?;
            Ok((id, text))
        })
        .collect()
}
