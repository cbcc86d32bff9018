use serde::Serialize;

/// Top-level errors that short-circuit a pipeline request.
///
/// Everything else (per-feed fetch failures, per-article extraction and
/// summarization failures, persistence and mail failures) is collected into
/// the response error list instead of being raised.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no usable keywords could be extracted from the query")]
    KeywordEmpty,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no articles could be summarized")]
    NoResults,

    #[error("history store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
}

impl CoreError {
    /// Stable machine-readable kind, for the HTTP layer to map onto a status.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidRequest(_) => "InvalidRequest",
            CoreError::KeywordEmpty => "KeywordEmpty",
            CoreError::Config(_) => "ConfigError",
            CoreError::NoResults => "NoResults",
            CoreError::StoreUnavailable(_) => "StoreUnavailable",
        }
    }
}

/// Per-feed fetch outcomes (C2). Never fatal to the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("feed responded with HTTP {0}")]
    HttpStatus(u16),

    #[error("feed could not be parsed: {0}")]
    Parse(String),

    #[error("feed fetch exceeded its deadline")]
    Timeout,

    #[error("no known charset produced a well-formed feed")]
    CharsetUnresolvable,
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "NetworkError",
            FetchError::HttpStatus(_) => "HTTPError",
            FetchError::Parse(_) => "ParseError",
            FetchError::Timeout => "Timeout",
            FetchError::CharsetUnresolvable => "CharsetUnresolvable",
        }
    }
}

/// Per-article extraction failures (C3).
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("network error: {0}")]
    Network(String),

    #[error("article responded with HTTP {0}")]
    HttpStatus(u16),

    #[error("article fetch exceeded its deadline")]
    Timeout,

    #[error("extracted body too short ({got} chars, need {need})")]
    BodyTooShort { got: usize, need: usize },

    #[error("article HTML could not be parsed into a body")]
    Unparseable,
}

impl ExtractError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::Network(_) => "NetworkError",
            ExtractError::HttpStatus(_) => "HTTPError",
            ExtractError::Timeout => "Timeout",
            ExtractError::BodyTooShort { .. } => "BodyTooShort",
            ExtractError::Unparseable => "Unparseable",
        }
    }
}

/// LLM call failures (C6 and C4's primary path).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM unavailable: {0}")]
    Unavailable(String),

    #[error("LLM rate limited")]
    RateLimited,

    #[error("LLM call exceeded its deadline")]
    Timeout,

    #[error("LLM API rejected the request with HTTP {0}")]
    Api(u16),

    #[error("LLM response invalid: {0}")]
    InvalidResponse(String),

    #[error("summary failed validation: {0}")]
    SummaryInvalid(String),

    #[error("input exceeds the model budget")]
    InputTooLarge,
}

impl LlmError {
    /// Transient errors are retried inside the summarizer; permanent ones
    /// become per-item failures immediately. Deadline expiry is never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Unavailable(_) | LlmError::RateLimited => true,
            LlmError::Api(status) => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Unavailable(_) => "LLMUnavailable",
            LlmError::RateLimited => "RateLimited",
            LlmError::Timeout => "Timeout",
            LlmError::Api(_) => "LLMUnavailable",
            LlmError::InvalidResponse(_) => "SummaryInvalid",
            LlmError::SummaryInvalid(_) => "SummaryInvalid",
            LlmError::InputTooLarge => "InputTooLarge",
        }
    }
}

/// One collected per-item failure, attached to the pipeline response.
#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub kind: String,
    pub message: String,
}

/// Pipeline stage a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Feed,
    Extract,
    Summarize,
    Persist,
    Mail,
}

impl StageError {
    pub fn feed(url: impl Into<String>, err: &FetchError) -> Self {
        Self {
            stage: Stage::Feed,
            url: Some(url.into()),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn extract(url: impl Into<String>, err: &ExtractError) -> Self {
        Self {
            stage: Stage::Extract,
            url: Some(url.into()),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn summarize(url: impl Into<String>, err: &LlmError) -> Self {
        Self {
            stage: Stage::Summarize,
            url: Some(url.into()),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn persist(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: Stage::Persist,
            url: Some(url.into()),
            kind: "StoreUnavailable".to_string(),
            message: message.into(),
        }
    }

    pub fn mail(message: impl Into<String>) -> Self {
        Self {
            stage: Stage::Mail,
            url: None,
            kind: "MailError".to_string(),
            message: message.into(),
        }
    }
}
