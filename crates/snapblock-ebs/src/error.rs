//! EBS direct API error types

use aws_sdk_ebs::config::http::HttpResponse;
use aws_sdk_ebs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Errors returned by the EBS direct API client
#[derive(Debug, Error)]
pub enum EbsError {
    #[error("no AWS credentials provider configured")]
    MissingCredentials,

    #[error("failed to resolve AWS credentials: {0}")]
    Credentials(String),

    /// The service answered with a non-success status
    #[error("EBS API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The request never produced a service response (dispatch, timeout, construction)
    #[error("EBS request failed: {0}")]
    Request(String),

    #[error("failed to read block body: {0}")]
    Body(String),

    #[error("malformed EBS response: {0}")]
    MalformedResponse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl EbsError {
    /// Map an SDK operation error, keeping the HTTP status of service errors
    pub(crate) fn from_sdk<E>(err: SdkError<E, HttpResponse>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        match &err {
            SdkError::ServiceError(ctx) => {
                let message = match (ctx.err().code(), ctx.err().message()) {
                    (Some(code), Some(msg)) => format!("{code}: {msg}"),
                    (Some(code), None) => code.to_string(),
                    (None, Some(msg)) => msg.to_string(),
                    (None, None) => DisplayErrorContext(&err).to_string(),
                };
                Self::Api {
                    status: ctx.raw().status().as_u16(),
                    message,
                }
            }
            _ => Self::Request(DisplayErrorContext(&err).to_string()),
        }
    }
}

/// Result type for EBS API operations
pub type EbsResult<T> = Result<T, EbsError>;
