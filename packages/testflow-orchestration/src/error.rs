use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Dependency cycle detected: {path}")]
    CycleDetected { path: String },

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Invalid checkpoint transition for {test_id}: {from} -> {to}")]
    InvalidTransition {
        test_id: String,
        from: String,
        to: String,
    },

    #[error("Circuit open for {resource} (retry in {retry_after_secs:.1}s)")]
    CircuitOpen {
        resource: String,
        retry_after_secs: f64,
    },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Checkpoint persistence failed: {0}")]
    CheckpointPersistence(String),

    #[error("Test not found: {0}")]
    TestNotFound(String),

    #[error("Test execution failed: {message}")]
    ExecutionFailed {
        message: String,
        category: ErrorCategory,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn persistence<E: std::fmt::Display>(e: E) -> Self {
        Self::CheckpointPersistence(e.to_string())
    }

    /// Failure with an explicit retry classification attached.
    pub fn execution<E: std::fmt::Display>(e: E, category: ErrorCategory) -> Self {
        Self::ExecutionFailed {
            message: e.to_string(),
            category,
        }
    }

    /// Retry classification for this error.
    ///
    /// Variants carrying an explicit category use it; the rest fall back to
    /// message-based classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ExecutionFailed { category, .. } => *category,
            Self::Timeout(_) | Self::CircuitOpen { .. } => ErrorCategory::Transient,
            Self::CheckpointPersistence(_) | Self::Io(_) => ErrorCategory::Infrastructure,
            Self::CycleDetected { .. }
            | Self::MissingDependency(_)
            | Self::InvalidTransition { .. }
            | Self::RetriesExhausted { .. }
            | Self::TestNotFound(_)
            | Self::Serialization(_)
            | Self::Config(_) => ErrorCategory::Permanent,
            Self::Other(e) => ErrorCategory::classify_message(&e.to_string()),
        }
    }

    /// Whether a retry attempt is justified.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Error category for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection reset, 5xx)
    Transient,
    /// Permanent error - don't retry (e.g., 4xx, validation, invalid input)
    Permanent,
    /// Infrastructure error - alert ops (e.g., OOM, disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::config(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    /// Classify a raw failure message when no explicit category is attached.
    pub fn classify_message(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();

        if msg.contains("out of memory") || msg.contains("oom") || msg.contains("disk full") {
            ErrorCategory::Infrastructure
        } else if msg.contains("timeout")
            || msg.contains("timed out")
            || msg.contains("connection")
            || msg.contains("reset")
            || msg.contains("status 5")
        {
            ErrorCategory::Transient
        } else if msg.contains("status 4") || msg.contains("validation") || msg.contains("invalid")
        {
            ErrorCategory::Permanent
        } else {
            ErrorCategory::Transient // Default to retry
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
