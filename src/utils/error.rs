use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("{source_name} responded with HTTP {status}: {body}")]
    HttpStatusError {
        source_name: String,
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("{source_name} rejected the credentials (HTTP {status})")]
    AuthError { source_name: String, status: u16 },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<EtlError> },

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

    #[error("Upload of '{key}' failed: {message}")]
    UploadError { key: String, message: String },

    #[error("Warehouse error on {table}: {message}")]
    WarehouseError { table: String, message: String },

    #[error("COPY into {table} from '{staged_key}' failed: {message}")]
    LoadError {
        table: String,
        staged_key: String,
        message: String,
    },

    #[error("Pipeline '{pipeline}' is locked by {holder} until {expires_at}")]
    LockHeldError {
        pipeline: String,
        holder: String,
        expires_at: String,
    },
}

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Authentication,
    Configuration,
    Data,
    Storage,
    Warehouse,
    Concurrency,
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
            EtlError::ApiError(_) | EtlError::HttpStatusError { .. } => ErrorCategory::Network,
            EtlError::RetriesExhausted { last, .. } => last.category(),
            EtlError::AuthError { .. } => ErrorCategory::Authentication,
            EtlError::ConfigError { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::MissingConfigError { .. } => ErrorCategory::Configuration,
            EtlError::CsvError(_)
            | EtlError::SerializationError(_)
            | EtlError::ProcessingError { .. } => ErrorCategory::Data,
            EtlError::IoError(_) | EtlError::UploadError { .. } => ErrorCategory::Storage,
            EtlError::WarehouseError { .. } | EtlError::LoadError { .. } => {
                ErrorCategory::Warehouse
            }
            EtlError::LockHeldError { .. } => ErrorCategory::Concurrency,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Network if self.is_transient() => ErrorSeverity::Medium,
            ErrorCategory::Concurrency => ErrorSeverity::Medium,
            ErrorCategory::Network | ErrorCategory::Data | ErrorCategory::Storage => {
                ErrorSeverity::High
            }
            ErrorCategory::Warehouse => ErrorSeverity::High,
            ErrorCategory::Authentication | ErrorCategory::Configuration => {
                ErrorSeverity::Critical
            }
        }
    }

    /// 只有限流、5xx 與網路層錯誤可以在本地重試
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::ApiError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            EtlError::HttpStatusError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Server-provided wait hint (Retry-After) for rate-limited responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EtlError::HttpStatusError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Network => "Check connectivity to the source API and rerun",
            ErrorCategory::Authentication => {
                "Check the API credentials exported for this pipeline"
            }
            ErrorCategory::Configuration => "Fix the configuration file and rerun",
            ErrorCategory::Data => "Inspect the source records that failed to map",
            ErrorCategory::Storage => {
                "Check bucket permissions and the local staging directory"
            }
            ErrorCategory::Warehouse => {
                "Inspect STL_LOAD_ERRORS and replay the COPY from the retained staged object"
            }
            ErrorCategory::Concurrency => {
                "Another run holds the lease; wait for it or for the lease to expire"
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            EtlError::LoadError {
                table, staged_key, ..
            } => format!(
                "Loading {} failed; the staged object '{}' was kept for replay",
                table, staged_key
            ),
            EtlError::UploadError { key, .. } => {
                format!("Could not upload '{}'; nothing was loaded", key)
            }
            EtlError::AuthError { source_name, .. } => {
                format!("{} refused our credentials", source_name)
            }
            other => other.to_string(),
        }
    }
}

/// Pipeline step in which a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lock,
    Watermark,
    Extract,
    Stage,
    Load,
    Deduplicate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Lock => "lock",
            Stage::Watermark => "watermark",
            Stage::Extract => "extract",
            Stage::Stage => "stage",
            Stage::Load => "load",
            Stage::Deduplicate => "deduplicate",
        };
        f.write_str(name)
    }
}

/// 一次執行失敗的結構化報告
#[derive(Debug, Error)]
#[error("pipeline={pipeline} category={category} stage={stage}: {cause}")]
pub struct RunFailure {
    pub pipeline: String,
    pub category: String,
    pub stage: Stage,
    #[source]
    pub cause: EtlError,
}

impl RunFailure {
    pub fn new(pipeline: &str, category: &str, stage: Stage, cause: EtlError) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            category: category.to_string(),
            stage,
            cause,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.cause.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

impl From<sqlx::Error> for EtlError {
    fn from(e: sqlx::Error) -> Self {
        EtlError::WarehouseError {
            table: String::from("<connection>"),
            message: e.to_string(),
        }
    }
}
