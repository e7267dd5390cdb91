use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("API request to {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to decode response from {url}: {message}")]
    DecodeError { url: String, message: String },

    #[error("Page request for {source_name} at offset {offset} failed: {source}")]
    PageFailed {
        source_name: String,
        offset: usize,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Schema mismatch for sink {sink}: expected [{}], got [{}]", expected.join(", "), actual.join(", "))]
    SchemaMismatch {
        sink: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Write to sink {sink} failed: {source}")]
    WriteFailed {
        sink: String,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Record nesting under '{key}' exceeds the depth limit of {limit}")]
    FlattenDepthExceeded { key: String, limit: usize },

    #[error("Operation cancelled: {context}")]
    Cancelled { context: String },

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration error in {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

/// 錯誤分類，對應抽取流程的各個階段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Decode,
    Schema,
    Write,
    Configuration,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ApiError(e) if e.is_decode() => ErrorCategory::Decode,
            EtlError::ApiError(_) | EtlError::HttpStatus { .. } => ErrorCategory::Transport,
            EtlError::DecodeError { .. } | EtlError::SerializationError(_) => ErrorCategory::Decode,
            EtlError::PageFailed { source, .. } => source.category(),
            EtlError::SchemaMismatch { .. } => ErrorCategory::Schema,
            EtlError::WriteFailed { .. } | EtlError::CsvError(_) | EtlError::IoError(_) => {
                ErrorCategory::Write
            }
            EtlError::ConfigError { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::MissingConfigError { .. } => ErrorCategory::Configuration,
            EtlError::FlattenDepthExceeded { .. }
            | EtlError::Cancelled { .. }
            | EtlError::ProcessingError { .. }
            | EtlError::ValidationError { .. } => ErrorCategory::Processing,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Transport | ErrorCategory::Decode => ErrorSeverity::Medium,
            ErrorCategory::Configuration | ErrorCategory::Processing => ErrorSeverity::High,
            ErrorCategory::Schema | ErrorCategory::Write => ErrorSeverity::Critical,
        }
    }

    /// 傳輸與解碼錯誤可重新抓取
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Decode
        )
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            EtlError::SchemaMismatch { sink, .. } => format!(
                "Write to a new output file or migrate the header of {} manually",
                sink
            ),
            EtlError::WriteFailed { sink, .. } => format!(
                "Check disk space and permissions for {}; rows flushed before the failure remain",
                sink
            ),
            EtlError::PageFailed {
                source_name,
                offset,
                ..
            } => format!(
                "Retry the fetch for {} (failed at offset {})",
                source_name, offset
            ),
            EtlError::FlattenDepthExceeded { .. } => {
                "Raise flatten.max_depth or project fewer fields".to_string()
            }
            EtlError::Cancelled { .. } => "Re-run the job to fetch the remaining data".to_string(),
            _ => match self.category() {
                ErrorCategory::Transport => {
                    "Check network connectivity, the endpoint URL and the auth headers".to_string()
                }
                ErrorCategory::Decode => {
                    "Check that the endpoint returns JSON and that records_key/total_key match the payload"
                        .to_string()
                }
                ErrorCategory::Configuration => {
                    "Fix the configuration file and run again".to_string()
                }
                ErrorCategory::Write => "Check the output path and its permissions".to_string(),
                ErrorCategory::Schema | ErrorCategory::Processing => {
                    "Inspect the logs for the offending record".to_string()
                }
            },
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Transport => format!("Could not reach the API: {}", self),
            ErrorCategory::Decode => format!("The API returned unexpected data: {}", self),
            ErrorCategory::Schema => format!("Output header does not match: {}", self),
            ErrorCategory::Write => format!("Could not write output: {}", self),
            ErrorCategory::Configuration => format!("Invalid configuration: {}", self),
            ErrorCategory::Processing => format!("Processing failed: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_failure_inherits_inner_category() {
        let err = EtlError::PageFailed {
            source_name: "versions/42".to_string(),
            offset: 200,
            source: Box::new(EtlError::HttpStatus {
                url: "https://api.example.com/versions".to_string(),
                status: 503,
            }),
        };

        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(err.severity(), ErrorSeverity::Medium);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("offset 200"));
        assert!(err.recovery_suggestion().contains("versions/42"));
    }

    #[test]
    fn test_schema_mismatch_message_names_both_lists() {
        let err = EtlError::SchemaMismatch {
            sink: "issues.csv".to_string(),
            expected: vec!["id".to_string(), "name".to_string()],
            actual: vec!["name".to_string(), "id".to_string()],
        };

        let message = err.to_string();
        assert!(message.contains("issues.csv"));
        assert!(message.contains("expected [id, name]"));
        assert!(message.contains("got [name, id]"));
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(!err.is_retryable());
    }
}
