use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },
}

pub type StoreResult<T> = Result<T, StoreError>;
