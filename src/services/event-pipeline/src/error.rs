//! # Error Handling Module
//!
//! Structured error types for the event pipeline. Every failure carries
//! enough context to be classified into the pipeline's error taxonomy and to
//! drive the retry policies of the recovery manager.

use std::fmt;

use thiserror::Error;

/// Error taxonomy used by the recovery manager's retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Processing,
    Data,
    System,
    Timeout,
    Validation,
    Dependency,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Connection,
        ErrorCategory::Processing,
        ErrorCategory::Data,
        ErrorCategory::System,
        ErrorCategory::Timeout,
        ErrorCategory::Validation,
        ErrorCategory::Dependency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Connection => "connection_error",
            ErrorCategory::Processing => "processing_error",
            ErrorCategory::Data => "data_error",
            ErrorCategory::System => "system_error",
            ErrorCategory::Timeout => "timeout_error",
            ErrorCategory::Validation => "validation_error",
            ErrorCategory::Dependency => "dependency_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity levels for categorization and alerting
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "low"),
            ErrorSeverity::Medium => write!(f, "medium"),
            ErrorSeverity::High => write!(f, "high"),
            ErrorSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Main error type for the event pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Connectivity failures against external providers
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        endpoint: Option<String>,
        retry_after_ms: Option<u64>,
    },

    /// Failures inside a pipeline stage or a downstream handler
    #[error("Processing error: {message}")]
    Processing {
        message: String,
        event_id: Option<String>,
        stage: Option<String>,
    },

    /// Malformed or unparsable data
    #[error("Data error: {message}")]
    Data {
        message: String,
        field: Option<String>,
    },

    /// Internal faults of the pipeline itself
    #[error("System error: {message}")]
    System {
        message: String,
        component: Option<String>,
    },

    /// Operations that exceeded their deadline
    #[error("Timeout error: {message}")]
    Timeout {
        message: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Payloads rejected by schema validation
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        payload_id: Option<String>,
    },

    /// Failures of collaborating services the pipeline depends on
    #[error("Dependency error: {message}")]
    Dependency { message: String, dependency: String },

    /// Fail-fast rejection of an enqueue against a full topic
    #[error("Queue full: topic {topic} at depth {depth}/{capacity}")]
    QueueFull {
        topic: String,
        depth: usize,
        capacity: usize,
    },

    /// Rejection of a low-priority event while load shedding is active
    #[error("Load shedding: priority {priority} below floor {floor} on topic {topic}")]
    LoadShed {
        topic: String,
        priority: u8,
        floor: String,
    },
}

impl PipelineError {
    /// Taxonomy category this error is recorded under
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Configuration { .. } => ErrorCategory::System,
            PipelineError::Connection { .. } => ErrorCategory::Connection,
            PipelineError::Processing { .. } => ErrorCategory::Processing,
            PipelineError::Data { .. } => ErrorCategory::Data,
            PipelineError::System { .. } => ErrorCategory::System,
            PipelineError::Timeout { .. } => ErrorCategory::Timeout,
            PipelineError::Validation { .. } => ErrorCategory::Validation,
            PipelineError::Dependency { .. } => ErrorCategory::Dependency,
            PipelineError::QueueFull { .. } => ErrorCategory::System,
            PipelineError::LoadShed { .. } => ErrorCategory::System,
        }
    }

    /// Default severity, before the recovery manager applies context rules
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::Configuration { .. } => ErrorSeverity::High,
            PipelineError::Connection { .. } => ErrorSeverity::High,
            PipelineError::Processing { .. } => ErrorSeverity::Medium,
            PipelineError::Data { .. } => ErrorSeverity::Medium,
            PipelineError::System { .. } => ErrorSeverity::Critical,
            PipelineError::Timeout { .. } => ErrorSeverity::Medium,
            PipelineError::Validation { .. } => ErrorSeverity::Low,
            PipelineError::Dependency { .. } => ErrorSeverity::Medium,
            PipelineError::QueueFull { .. } => ErrorSeverity::High,
            PipelineError::LoadShed { .. } => ErrorSeverity::Low,
        }
    }

    /// Whether the recovery manager should schedule retries for this error
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Configuration { .. } => false,
            PipelineError::Connection { .. } => true,
            PipelineError::Processing { .. } => true,
            PipelineError::Data { .. } => true,
            PipelineError::System { .. } => true,
            PipelineError::Timeout { .. } => true,
            PipelineError::Validation { .. } => false,
            PipelineError::Dependency { .. } => true,
            PipelineError::QueueFull { .. } => false,
            PipelineError::LoadShed { .. } => false,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            endpoint: None,
            retry_after_ms: None,
        }
    }

    pub fn processing(message: impl Into<String>, event_id: Option<String>) -> Self {
        Self::Processing {
            message: message.into(),
            event_id,
            stage: None,
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
            field: None,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
            component: None,
        }
    }

    pub fn timeout(message: impl Into<String>, operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
            payload_id: None,
        }
    }

    pub fn dependency(message: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::Dependency {
            message: message.into(),
            dependency: dependency.into(),
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Data {
            message: err.to_string(),
            field: None,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Connection {
            message: err.to_string(),
            endpoint: err.url().map(|u| u.to_string()),
            retry_after_ms: None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for PipelineError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        PipelineError::Timeout {
            message: err.to_string(),
            operation: "unknown".to_string(),
            timeout_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            PipelineError::connection("down").category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            PipelineError::validation("missing nftId").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            PipelineError::QueueFull {
                topic: "blockchain".to_string(),
                depth: 10_000,
                capacity: 10_000,
            }
            .category(),
            ErrorCategory::System
        );
    }

    #[test]
    fn test_retryability() {
        assert!(PipelineError::timeout("slow", "dispatch", 5_000).is_retryable());
        assert!(!PipelineError::validation("bad payload").is_retryable());
        assert!(!PipelineError::configuration("bad config").is_retryable());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
        assert_eq!(PipelineError::system("oom").severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_category_strings() {
        assert_eq!(ErrorCategory::Processing.to_string(), "processing_error");
        assert_eq!(ErrorCategory::ALL.len(), 7);
    }
}
