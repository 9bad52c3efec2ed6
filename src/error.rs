//! Error taxonomy for the remap-and-load pipeline.
//!
//! Every failure the library can produce is one of five classes. Per-layer
//! failures are matched on [`ErrorClass`] at the layer boundary.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    #[serde(rename = "SchemaError")]
    Schema,
    #[serde(rename = "TypeMismatchError")]
    TypeMismatch,
    #[serde(rename = "KeyError")]
    Key,
    #[serde(rename = "NotFoundError")]
    NotFound,
    #[serde(rename = "DatabaseError")]
    Database,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Schema => "SchemaError",
            ErrorClass::TypeMismatch => "TypeMismatchError",
            ErrorClass::Key => "KeyError",
            ErrorClass::NotFound => "NotFoundError",
            ErrorClass::Database => "DatabaseError",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Catalog inconsistency or a malformed source/layer definition.
    #[error("{0}")]
    Schema(String),
    #[error("layer '{layer}': field '{field}' value '{value}' cannot be read as {expected}")]
    TypeMismatch {
        layer: String,
        field: String,
        value: String,
        expected: &'static str,
    },
    #[error("layer '{layer}': mapped field(s) missing from source: {}", .fields.join(", "))]
    Key { layer: String, fields: Vec<String> },
    #[error("{0}")]
    NotFound(String),
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Schema(_) => ErrorClass::Schema,
            PipelineError::TypeMismatch { .. } => ErrorClass::TypeMismatch,
            PipelineError::Key { .. } => ErrorClass::Key,
            PipelineError::NotFound(_) => ErrorClass::NotFound,
            PipelineError::Database { .. } => ErrorClass::Database,
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        PipelineError::Schema(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        PipelineError::NotFound(message.into())
    }

    /// Adapter for `map_err` that attaches a description of the failed statement.
    pub fn database(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> Self {
        let context = context.into();
        move |source| PipelineError::Database { context, source }
    }
}
