use thiserror::Error;

/// Failure taxonomy for the agent's collaborators.  None of these are allowed
/// to escape a call turn; the orchestrator degrades each class of failure into
/// a usable directive and logs the details at the failure site.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("slot extraction error: {0}")]
    Extraction(String),

    #[error("knowledge retrieval error: {0}")]
    Retrieval(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("speech service error: {0}")]
    Speech(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
