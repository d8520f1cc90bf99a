// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON error responses for the HTTP API.
//!
//! Clients get a user-safe message plus a unique reference code; the full
//! internal detail goes to the log under the same reference so an operator
//! can correlate a support report with the traces.
//!
//! Download failures are deliberately NOT represented here: by the time a
//! download fails, the request that created the job has long since returned,
//! so the failure lands in the job record and is observed by polling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20250115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// USER-FACING ERROR TYPES
// =============================================================================

/// Error surface of the HTTP API.
///
/// Messages carried here are written for end users; internal causes are
/// logged by the constructors and never serialized.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ApiError {
    /// Invalid request from client (400)
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// Resource not found (404)
    NotFound {
        message: String,
        reference: String,
    },

    /// The external collaborator misbehaved while handling this request (502)
    BadGateway {
        message: String,
        reference: String,
    },

    /// Internal server error (500) - never exposes internal details
    Internal {
        message: String,
        reference: String,
    },
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the reference code for this error.
    pub fn reference(&self) -> &str {
        match self {
            ApiError::InvalidRequest { reference, .. } => reference,
            ApiError::NotFound { reference, .. } => reference,
            ApiError::BadGateway { reference, .. } => reference,
            ApiError::Internal { reference, .. } => reference,
        }
    }

    /// Get the user-facing message.
    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidRequest { message, .. } => message,
            ApiError::NotFound { message, .. } => message,
            ApiError::BadGateway { message, .. } => message,
            ApiError::Internal { message, .. } => message,
        }
    }
}

// =============================================================================
// ERROR CONSTRUCTORS (WITH LOGGING)
// =============================================================================

impl ApiError {
    /// Create an InvalidRequest error. The message is shown to the user;
    /// `internal_details`, if any, only goes to the log.
    pub fn invalid_request(user_message: &str, field: Option<&str>, internal_details: Option<&str>) -> Self {
        let reference = generate_reference_code();

        if let Some(details) = internal_details {
            tracing::warn!(
                reference = %reference,
                internal_details = %details,
                field = ?field,
                "Invalid request"
            );
        }

        Self::InvalidRequest {
            message: user_message.to_string(),
            reference,
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a NotFound error for the named resource.
    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();

        tracing::info!(
            reference = %reference,
            resource = %resource,
            "Resource not found"
        );

        Self::NotFound {
            message: format!("The requested {} was not found.", resource),
            reference,
        }
    }

    /// Create a BadGateway error, logging the internal cause.
    pub fn bad_gateway(internal_details: &str) -> Self {
        let reference = generate_reference_code();

        tracing::error!(
            reference = %reference,
            internal_details = %internal_details,
            "Bad gateway"
        );

        Self::BadGateway {
            message: "Unable to reach the downloader. Please try again later.".to_string(),
            reference,
        }
    }

    /// Create an Internal error, logging full details internally.
    /// CRITICAL: this never exposes the internal cause to the user.
    pub fn internal(internal_error: &str) -> Self {
        let reference = generate_reference_code();

        tracing::error!(
            reference = %reference,
            internal_error = %internal_error,
            "Internal server error"
        );

        Self::Internal {
            message: format!("An internal error occurred. Reference: {}", reference),
            reference,
        }
    }
}

/// User-facing error response structure (JSON format).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ApiError,
    pub status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

/// Result type that uses ApiError for the error variant.
pub type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// TESTS
// =============================================================================
