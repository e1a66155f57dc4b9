pub mod routes;

use axum::http::StatusCode;
use serde::Deserialize;
use tracing::error;

use crate::error::FlagError;
use crate::flags::Tag;

// REQUESTS

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlagRequest {
    pub name: String,
    #[serde(default)]
    pub default_value: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetDefaultRequest {
    pub value: bool,
}

#[derive(Debug, Deserialize)]
pub struct CheckFlagRequest {
    pub tags: Vec<Tag>,
}

// HELPER FUNCTIONS

// Validating the flag name
pub fn validate_flag_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("Flag name cannot be empty".to_string());
    }

    if name.len() > 128 {
        return Err("Flag name is too long (Max: 128 characters)".to_string());
    }

    Ok(())
}

/// Map a service error onto a status code and response body.
pub fn error_response(err: FlagError) -> (StatusCode, String) {
    match err {
        FlagError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        FlagError::NotFound(_) => (StatusCode::NOT_FOUND, "Flag not found".to_string()),
        FlagError::DuplicateChain(_) | FlagError::AlreadyExists(_) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        FlagError::MissingDependencies(_) | FlagError::CorruptRuleChain(_) | FlagError::Store(_) => {
            error!(error = %err, "flag request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Flag store error".to_string())
        }
    }
}
