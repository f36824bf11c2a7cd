//! Error types for STRATA operations

use thiserror::Error;

/// Storage tier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Tier {tier} failed to read {key}: {reason}")]
    ReadFailed {
        tier: String,
        key: String,
        reason: String,
    },

    #[error("Tier {tier} failed to write {key}: {reason}")]
    WriteFailed {
        tier: String,
        key: String,
        reason: String,
    },

    #[error("Transaction failed on tier {tier}: {reason}")]
    TransactionFailed { tier: String, reason: String },

    #[error("Record encoding failed for {key}: {reason}")]
    Encoding { key: String, reason: String },

    #[error("Tier {tier} could not be opened: {reason}")]
    OpenFailed { tier: String, reason: String },
}

/// Normalization and read errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Response root must be an object, got {found}")]
    RootNotObject { found: String },

    #[error("Variable ${name} is referenced by field {field} but not defined")]
    UndefinedVariable { name: String, field: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },
}

/// Master error type for all STRATA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Normalize error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;

// =============================================================================
// TESTS
// =============================================================================
