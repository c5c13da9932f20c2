use std::error::Error as StdError;
use std::fmt::{self, Formatter};

use axum::response::{IntoResponse, Response};
use axum::Json;
use gatehouse_common::backends::cache::CacheError;
use gatehouse_common::backends::headers::X_REQUEST_ID;
use gatehouse_common::claims::TokenError;
use gatehouse_common::models::error::{ApiError, ErrorCode};
use gatehouse_common::secrets::SecretsError;
use http::{HeaderValue, StatusCode};
use uuid::Uuid;

use crate::dal::DalError;

pub mod api;
pub mod args;
pub mod audit;
pub mod cache;
pub mod dal;
pub mod provision;
pub mod rate_limit;
pub mod resolver;
pub mod router;
pub mod scopes;
pub mod service;

/// The ways a request can terminate at the gateway instead of reaching a
/// downstream service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
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
    Validation,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        self.code().status()
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidCredentials => ErrorCode::InvalidCredentials,
            Self::AppDisabled => ErrorCode::AppDisabled,
            Self::TokenExpired => ErrorCode::TokenExpired,
            Self::InvalidToken => ErrorCode::InvalidToken,
            Self::LoginMethodDisabled => ErrorCode::LoginMethodDisabled,
            Self::InsufficientScope => ErrorCode::InsufficientScope,
            Self::UserNotBound => ErrorCode::UserNotBound,
            Self::RateLimitExceeded => ErrorCode::RateLimitExceeded,
            Self::ServiceUnavailable => ErrorCode::ServiceUnavailable,
            Self::UpstreamError => ErrorCode::UpstreamError,
            Self::Validation => ErrorCode::ValidationError,
            Self::NotFound => ErrorCode::NotFound,
            Self::Internal => ErrorCode::InternalError,
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid application credentials",
            Self::AppDisabled => "application is disabled",
            Self::TokenExpired => "token is expired",
            Self::InvalidToken => "token is invalid",
            Self::LoginMethodDisabled => "login method is not enabled",
            Self::InsufficientScope => "application lacks the required scope",
            Self::UserNotBound => "user does not belong to this application",
            Self::RateLimitExceeded => "request rate is over the limit",
            Self::ServiceUnavailable => "downstream service is unavailable",
            Self::UpstreamError => "unexpected downstream error",
            Self::Validation => "request validation failed",
            Self::NotFound => "not found",
            Self::Internal => "gateway internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A pipeline failure.
///
/// All [`Error`]s have an [`ErrorKind`] and an (optional) source. The
/// `IntoResponse` implementation produces the unified envelope and never
/// leaks the source; on 5xx even a custom message is replaced with the
/// kind's generic one so that nothing from inside the gateway or a
/// downstream service reaches the caller.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    request_id: Option<Uuid>,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            request_id: None,
            source: None,
        }
    }

    pub fn custom(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::from_kind(kind)
        }
    }

    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            source: Some(Box::new(err)),
            ..Self::from_kind(kind)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn message(&self) -> String {
        if self.kind.status().is_server_error() {
            return self.kind.default_message().to_string();
        }

        self.message
            .clone()
            .unwrap_or_else(|| self.kind.default_message().to_string())
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<DalError> for Error {
    fn from(err: DalError) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl From<SecretsError> for Error {
    fn from(err: SecretsError) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::from_kind(ErrorKind::TokenExpired),
            TokenError::Invalid => Self::from_kind(ErrorKind::InvalidToken),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.kind.status().is_server_error() {
            tracing::error!(error = &self as &dyn StdError, "gateway request error");
        }

        let request_id = self.request_id.unwrap_or_else(Uuid::new_v4);
        let body = ApiError::new(self.kind.code(), self.message(), request_id);

        let mut response = (self.kind.status(), Json(body)).into_response();
        response.headers_mut().insert(
            X_REQUEST_ID.clone(),
            HeaderValue::from_str(&request_id.to_string())
                .expect("a uuid is a valid header value"),
        );

        response
    }
}
