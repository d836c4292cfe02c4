use std::io;
use thiserror::Error;

/// Rejected edits and saves. Nothing is mutated when one of these is returned.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please enter a survey title")]
    MissingTitle,

    #[error("Please add at least one question")]
    NoQuestions,

    #[error("Question {} is missing question text", .index + 1)]
    MissingQuestionText { index: usize },

    #[error("You must have at least 2 options")]
    TooFewOptions,

    #[error("Question {} has no options", .index + 1)]
    NoOptions { index: usize },

    #[error("Question {} is not a rating question", .index + 1)]
    NotRating { index: usize },

    #[error("No question at position {index}")]
    QuestionOutOfRange { index: usize },

    #[error("No option at position {index}")]
    OptionOutOfRange { index: usize },

    #[error("Passwords do not match. Master password not changed.")]
    PasswordMismatch,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage might be full: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Storage I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Couldn't serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("The file may be corrupted or invalid: {0}")]
    Malformed(serde_json::Error),

    #[error("Invalid survey file format. Missing required fields.")]
    MissingTitle,

    #[error("Invalid survey file format. Survey must have at least one question.")]
    MissingQuestions,

    #[error("Invalid question in survey file: {0}")]
    InvalidQuestion(serde_json::Error),

    #[error("Error saving imported survey: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("Survey not found: {0}")]
    NotFound(String),

    #[error("No data to export")]
    NoData,

    #[error("Couldn't write CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Couldn't write JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Incorrect password. Access denied.")]
    Unauthorized,
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "Validation",
            Error::Storage(_) => "Storage",
            Error::Import(_) => "Import",
            Error::NotFound(_) => "NotFound",
            Error::NoData => "NoData",
            Error::Csv(_) | Error::Json(_) => "Export",
            Error::Unauthorized => "Unauthorized",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
