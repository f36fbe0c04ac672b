use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel unavailable or broken; fatal at startup, retried while polling.
    #[error("Channel transport error: {message}")]
    Transport { message: String },

    #[error("Extraction failed for {url}: {message}")]
    Extraction { url: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl ScraperError {
    pub fn transport(message: impl Into<String>) -> Self {
        ScraperError::Transport {
            message: message.into(),
        }
    }

    pub fn extraction(url: impl Into<String>, message: impl Into<String>) -> Self {
        ScraperError::Extraction {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ScraperError::NotFound { .. })
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for ScraperError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        ScraperError::transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScraperError>;
