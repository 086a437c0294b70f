//! Error types shared by the ingest, cache and downsample paths.

use thiserror::Error;

/// Failures the pipeline distinguishes between when deciding whether to skip
/// an item, drop a batch, or abort.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required key (`sensor_id`, `timestamp`) is absent or empty.
    #[error("missing required field '{0}'")]
    MissingKey(&'static str),

    /// A field is present but cannot be interpreted.
    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The transport payload could not be decoded into a batch.
    #[error("could not decode payload: {0}")]
    Decode(String),

    /// A built statement's placeholders and bound values disagree.
    /// Never expected at runtime; treated as fatal.
    #[error("statement has {placeholders} placeholders but {values} values")]
    StatementMismatch { placeholders: usize, values: usize },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl PipelineError {
    /// Whether the error must abort the whole batch rather than just the item.
    pub fn is_fatal(&self) -> bool {
        // ---
        matches!(self, PipelineError::StatementMismatch { .. })
    }
}

impl axum::response::IntoResponse for PipelineError {
    fn into_response(self) -> axum::response::Response {
        // ---
        use axum::http::StatusCode;
        use axum::response::IntoResponse;

        let status = match &self {
            PipelineError::MissingKey(_)
            | PipelineError::InvalidField { .. }
            | PipelineError::Decode(_) => StatusCode::BAD_REQUEST,
            PipelineError::StatementMismatch { .. } | PipelineError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match status {
            StatusCode::BAD_REQUEST => self.to_string(),
            _ => "Internal server error".to_string(),
        };
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn test_status_codes() {
        // ---
        let resp = PipelineError::Decode("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = PipelineError::StatementMismatch {
            placeholders: 3,
            values: 2,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_only_statement_mismatch_is_fatal() {
        // ---
        assert!(PipelineError::StatementMismatch {
            placeholders: 1,
            values: 0
        }
        .is_fatal());
        assert!(!PipelineError::MissingKey("sensor_id").is_fatal());
        assert!(!PipelineError::Storage(sqlx::Error::RowNotFound).is_fatal());
    }
}
