use thiserror::Error;

/// Errors raised by the dispatch core.
///
/// A connection-scoped error (`Backend`, `Filter`, `Protocol`) ends that
/// connection's loop but never propagates to other connections.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message framing error: {0}")]
    Framing(String),
    #[error("malformed message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("persistence backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("filter `{filter}` failed: {source}")]
    Filter {
        filter: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
