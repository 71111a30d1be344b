//! Error types for the signal store and perception input boundary

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyEventId,
    EventIdMismatch { expected: String, found: String },
    UnknownModality(String),
    ConfidenceOutOfRange { field: String, value: f64 },
    EmptyTag,
    UnknownStatus(String),
    UnknownAlertLevel(u8),
    UnknownChannel(String),
    Malformed(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyEventId => write!(f, "event_id must not be empty"),
            ValidationError::EventIdMismatch { expected, found } => {
                write!(f, "finding event_id {} does not match window {}", found, expected)
            }
            ValidationError::UnknownModality(m) => write!(f, "Unknown modality: {}", m),
            ValidationError::ConfidenceOutOfRange { field, value } => {
                write!(f, "{} confidence {} outside [0, 1]", field, value)
            }
            ValidationError::EmptyTag => write!(f, "severity indicator tag must not be empty"),
            ValidationError::UnknownStatus(s) => write!(f, "Unknown window status: {}", s),
            ValidationError::UnknownAlertLevel(l) => write!(f, "Unknown alert level: {}", l),
            ValidationError::UnknownChannel(c) => write!(f, "Unknown channel: {}", c),
            ValidationError::Malformed(e) => write!(f, "Malformed finding: {}", e),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    Validation(ValidationError),
    Io(std::io::Error),
    NotFound(String),
    Corrupt(String),
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl From<ValidationError> for StoreError {
    fn from(err: ValidationError) -> Self {
        StoreError::Validation(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Validation(e) => write!(f, "Validation error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::NotFound(key) => write!(f, "Not found: {}", key),
            StoreError::Corrupt(e) => write!(f, "Corrupt record: {}", e),
            StoreError::LockPoisoned => write!(f, "Database lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
