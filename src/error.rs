//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Malformed HSON. Positions are 1-based.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("HSON parser error in '{source_name}' at line {line}({column}): {message}")]
pub struct LexError {
    pub source_name: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// Failure to produce a configuration document. Fatal to one refresh, never to the process.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("could not read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not fetch '{url}': {message}")]
    Http { url: String, message: String },
    #[error(transparent)]
    Lex(#[from] LexError),
    /// JSON syntax error, already translated to HSON source coordinates.
    #[error("{0}")]
    Json(String),
    #[error("settings: {0}")]
    Settings(String),
}

/// One message from the database server.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub number: u32,
    pub state: u8,
    pub class: u8,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub procedure: String,
    pub line_number: u32,
}

/// "The statement has been terminated."
pub const STATEMENT_TERMINATED: u32 = 3621;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("could not open connection: {0}")]
    Connect(String),
    #[error("timed out after {0:?} opening connection")]
    Timeout(Duration),
    #[error("{message}")]
    Server {
        code: u32,
        message: String,
        errors: Vec<ServerMessage>,
    },
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("conversion: {0}")]
    Conversion(String),
}

impl ExecError {
    /// Build a server error from the driver's message list, dropping informational
    /// "statement terminated" entries.
    pub fn from_server_messages(messages: Vec<ServerMessage>) -> Self {
        let errors: Vec<ServerMessage> = messages
            .into_iter()
            .filter(|m| m.number != STATEMENT_TERMINATED)
            .collect();
        let code = errors.first().map(|m| m.number).unwrap_or(0);
        let message = errors
            .iter()
            .map(|m| m.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        ExecError::Server { code, message, errors }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ExecError::Server { code, .. } => match code {
                // Cannot insert NULL.
                515 => StatusCode::BAD_REQUEST,
                // Unique key, unique index, foreign key/check constraint.
                2627 | 2601 | 547 => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ExecError::Server { errors, .. } if !errors.is_empty() => serde_json::to_value(errors).ok(),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{message}")]
    BadRequest {
        message: String,
        details: Option<serde_json::Value>,
    },
    #[error("Method Not Allowed")]
    MethodNotAllowed,
    /// The method's descriptor carries errors; it is never executed.
    #[error("Bad method descriptor")]
    BadDescriptor(serde_json::Value),
    /// The snapshot has document-level errors.
    #[error("Severe errors encountered")]
    Severe(serde_json::Value),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::BadRequest {
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        AppError::BadRequest {
            message: message.into(),
            details: Some(details),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, code, details) = match self {
            AppError::BadRequest { details, .. } => (StatusCode::BAD_REQUEST, "bad_request", details),
            AppError::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None),
            AppError::BadDescriptor(details) => (StatusCode::INTERNAL_SERVER_ERROR, "bad_descriptor", Some(details)),
            AppError::Severe(details) => (StatusCode::INTERNAL_SERVER_ERROR, "severe_errors", Some(details)),
            AppError::Exec(e) => {
                tracing::warn!(error = %e, "query execution failed");
                (e.status(), "database_error", e.details())
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}
