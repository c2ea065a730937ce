use thiserror::Error;

pub type Result<T> = std::result::Result<T, FinetuneError>;

#[derive(Debug, Error)]
pub enum FinetuneError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("training failed: {0}")]
    Runtime(String),

    #[error(
        "dataset chunks are too small to sample {length} tokens at a time \
         (average chunk holds {average} tokens)"
    )]
    SampleTooLong { length: usize, average: usize },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

impl FinetuneError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for FinetuneError {
    fn from(value: toml::de::Error) -> Self {
        FinetuneError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for FinetuneError {
    fn from(value: serde_json::Error) -> Self {
        FinetuneError::ConfigFormat(value.to_string())
    }
}
