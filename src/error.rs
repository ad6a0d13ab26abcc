use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{op} on collection '{collection}' failed to write: {source}")]
    Write {
        collection: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),
}

pub type Result<T> = std::result::Result<T, Error>;
