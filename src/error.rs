use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Orderbook sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },
}

/// Configuration and metadata errors. Fatal at startup, never at runtime.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("failed to read symbol metadata file: {0}")]
    ReadMetadata(#[source] std::io::Error),

    #[error("failed to parse symbol metadata file: {0}")]
    ParseMetadata(#[source] toml::de::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("duplicate alias {native:?} for exchange {exchange}")]
    DuplicateAlias { exchange: String, native: String },

    #[error("alias {native:?} on {exchange} references unknown market {canonical:?}")]
    UnknownMarket {
        exchange: String,
        native: String,
        canonical: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
