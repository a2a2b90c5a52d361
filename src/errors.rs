use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Closed set of error kinds used by the retry policy and the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    System,
    Network,
    Timeout,
    Configuration,
    Permission,
    Resource,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::System | ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Resource
        )
    }

    // Short error type label used in failure summaries.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::System => "system",
            _ => "unknown",
        }
    }

    fn default_code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VAL001",
            ErrorKind::NotFound => "NOT001",
            ErrorKind::Conflict => "CON001",
            ErrorKind::System => "SYS001",
            ErrorKind::Network => "NET001",
            ErrorKind::Timeout => "TIM001",
            ErrorKind::Configuration => "CFG001",
            ErrorKind::Permission => "PER001",
            ErrorKind::Resource => "RES001",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::System => "SYSTEM",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::Permission => "PERMISSION",
            ErrorKind::Resource => "RESOURCE",
        };
        f.write_str(s)
    }
}

/// Domain error carrying a kind, a stable short code, a message, an
/// optional wrapped cause and a retryable flag.
#[derive(Debug, Error)]
#[error("[{kind}:{code}] {message}")]
pub struct AgentError {
    kind: ErrorKind,
    code: &'static str,
    message: String,
    #[source]
    cause: Option<Box<dyn StdError + Send + Sync>>,
    retryable: bool,
}

impl AgentError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            cause: None,
            retryable: kind.is_retryable(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, ErrorKind::Validation.default_code(), message)
    }

    pub fn validation_with_code(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, ErrorKind::NotFound.default_code(), message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, ErrorKind::Conflict.default_code(), message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, ErrorKind::System.default_code(), message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, ErrorKind::Network.default_code(), message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, ErrorKind::Timeout.default_code(), message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Configuration,
            ErrorKind::Configuration.default_code(),
            message,
        )
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, ErrorKind::Permission.default_code(), message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, ErrorKind::Resource.default_code(), message)
    }

    /// Error for work aborted by run cancellation. Not retryable.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::System, "SYS002", "cancelled").with_retryable(false)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    /// Human reason including the wrapped cause, for run summaries. No
    /// kind or code prefix, the summary carries those separately.
    pub fn reason(&self) -> String {
        match &self.cause {
            Some(cause) => format!("{}: {}", self.message, cause),
            None => self.message.clone(),
        }
    }
}
