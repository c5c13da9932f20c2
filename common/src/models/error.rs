use http::StatusCode;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The closed set of machine readable error codes the gateway emits.
///
/// Every failure response carries exactly one of these in its body; the HTTP
/// status stays the primary channel and the code the secondary one.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    InvalidCredentials,
    AppDisabled,
    TokenExpired,
    InvalidToken,
    LoginMethodDisabled,
    InsufficientScope,
    UserNotBound,
    RateLimitExceeded,
    ServiceUnavailable,
    UpstreamError,
    ValidationError,
    InternalError,
    NotFound,
}

impl ErrorCode {
    /// The canonical HTTP status for this code.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::LoginMethodDisabled => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials | Self::TokenExpired | Self::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            Self::AppDisabled | Self::InsufficientScope | Self::UserNotBound => {
                StatusCode::FORBIDDEN
            }
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamError => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Default code for a downstream status that arrived without one.
    pub fn default_for(status: StatusCode) -> Self {
        match status.as_u16() {
            400 => Self::LoginMethodDisabled,
            401 => Self::InvalidCredentials,
            403 => Self::AppDisabled,
            404 => Self::NotFound,
            422 => Self::ValidationError,
            429 => Self::RateLimitExceeded,
            502 => Self::UpstreamError,
            503 => Self::ServiceUnavailable,
            _ => Self::InternalError,
        }
    }
}

/// The body shape of every failure response, no matter which component
/// produced the failure.
///
/// `error_code` is a plain string rather than [`ErrorCode`] because domain
/// errors returned by downstream services are passed through verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: String,
    pub message: String,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error_code: impl ToString, message: impl Into<String>, request_id: impl ToString) -> Self {
        Self {
            error_code: error_code.to_string(),
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }
}
