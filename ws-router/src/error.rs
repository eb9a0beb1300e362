//! Canonical error taxonomy (spec §7) and conversion to on-wire error
//! envelopes. Mirrors the teacher's `Web3ProxyError`: one big enum, one
//! `as_wire_error` match that also does the logging, and a context extension
//! trait for attaching human messages to internal failures.

use std::borrow::Cow;
use std::sync::Arc;

use derive_more::{Display, Error, From};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

pub type WsRouterResult<T> = Result<T, WsRouterError>;

/// The canonical string codes from spec §7. Serializes as the bare string so
/// it round-trips on the wire exactly as written there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessageFormat,
    ValidationFailed,
    UnsupportedMessageType,
    AuthenticationFailed,
    AuthorizationFailed,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    InvalidArgument,
    ResourceExhausted,
    ResourceNotFound,
    InternalServerError,
    ConnectionClosed,
    InvalidTopic,
    TopicLimitExceeded,
    AdapterError,
}

/// The shape that actually goes on the wire inside an `ERROR` or
/// `$ws:rpc-error` envelope's `payload`.
#[derive(Debug, Clone, Serialize)]
pub struct WsError {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl WsError {
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: false,
            retry_after_ms: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retryable(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retryable = true;
        self.retry_after_ms = retry_after_ms;
        self
    }
}

/// Internal error condition set. Not every variant is wire-visible by
/// itself — `as_wire_error` is the single place that decides status and
/// logs at the right level, exactly like `Web3ProxyError::as_response_parts`.
#[derive(Debug, Display, Error, From)]
pub enum WsRouterError {
    #[error(ignore)]
    #[from(ignore)]
    InvalidMessageFormat(Cow<'static, str>),
    #[display(fmt = "{:?}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    ValidationFailed(Vec<String>),
    #[error(ignore)]
    #[from(ignore)]
    UnsupportedMessageType(Cow<'static, str>),
    AuthenticationFailed,
    #[error(ignore)]
    #[from(ignore)]
    AuthorizationFailed(Cow<'static, str>),
    NotFound,
    #[error(ignore)]
    #[from(ignore)]
    AlreadyExists(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    FailedPrecondition(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    InvalidArgument(Cow<'static, str>),
    #[display(fmt = "resource exhausted: {}", message)]
    #[from(ignore)]
    ResourceExhausted {
        message: Cow<'static, str>,
        retry_after_ms: Option<u64>,
    },
    ResourceNotFound,
    ConnectionClosed,
    #[display(fmt = "invalid topic {}: {}", topic, reason)]
    #[from(ignore)]
    InvalidTopic {
        topic: String,
        reason: Cow<'static, str>,
    },
    TopicLimitExceeded,
    #[error(ignore)]
    #[from(ignore)]
    AdapterError(anyhow::Error),
    /// A batch Topics op failed and rollback of already-committed adapter
    /// calls was attempted; `rollback_failed` lists the topics whose
    /// inverse adapter call also failed (spec §7 "rollback failures are
    /// surfaced via `details.rollbackFailed`").
    #[display(fmt = "adapter error during batch op: {}; rollback_failed={:?}", source, rollback_failed)]
    #[error(ignore)]
    #[from(ignore)]
    TopicsBatchRollback {
        source: anyhow::Error,
        rollback_failed: Vec<String>,
    },
    #[error(ignore)]
    Anyhow(anyhow::Error),
    Arc(Arc<Self>),
    #[display(fmt = "{:?}, {}", _0, _1)]
    #[error(ignore)]
    #[from(ignore)]
    WithContext(Option<Box<WsRouterError>>, Cow<'static, str>),
}

impl WsRouterError {
    pub fn as_wire_error(&self) -> WsError {
        match self {
            Self::InvalidMessageFormat(msg) => {
                trace!(%msg, "invalid message format");
                WsError::new(ErrorCode::InvalidMessageFormat, msg.clone())
            }
            Self::ValidationFailed(issues) => {
                debug!(?issues, "validation failed");
                WsError::new(ErrorCode::ValidationFailed, "validation failed")
                    .with_details(serde_json::json!({ "issues": issues }))
            }
            Self::UnsupportedMessageType(t) => {
                trace!(%t, "unsupported message type");
                WsError::new(
                    ErrorCode::UnsupportedMessageType,
                    format!("unsupported message type: {}", t),
                )
            }
            Self::AuthenticationFailed => {
                trace!("authentication failed");
                WsError::new(ErrorCode::AuthenticationFailed, "authentication failed")
            }
            Self::AuthorizationFailed(msg) => {
                trace!(%msg, "authorization failed");
                WsError::new(ErrorCode::AuthorizationFailed, format!("forbidden: {}", msg))
            }
            Self::NotFound => WsError::new(ErrorCode::NotFound, "not found"),
            Self::AlreadyExists(what) => {
                trace!(%what, "already exists");
                WsError::new(ErrorCode::AlreadyExists, format!("already exists: {}", what))
            }
            Self::FailedPrecondition(msg) => {
                trace!(%msg, "failed precondition");
                WsError::new(ErrorCode::FailedPrecondition, msg.clone())
            }
            Self::InvalidArgument(msg) => {
                trace!(%msg, "invalid argument");
                WsError::new(ErrorCode::InvalidArgument, msg.clone())
            }
            Self::ResourceExhausted {
                message,
                retry_after_ms,
            } => {
                debug!(%message, ?retry_after_ms, "resource exhausted");
                WsError::new(ErrorCode::ResourceExhausted, message.clone())
                    .retryable(*retry_after_ms)
            }
            Self::ResourceNotFound => WsError::new(ErrorCode::ResourceNotFound, "resource not found"),
            Self::ConnectionClosed => {
                trace!("connection closed");
                WsError::new(ErrorCode::ConnectionClosed, "connection closed")
            }
            Self::InvalidTopic { topic, reason } => {
                trace!(%topic, %reason, "invalid topic");
                WsError::new(ErrorCode::InvalidTopic, format!("invalid topic: {}", topic))
                    .with_details(serde_json::json!({ "reason": reason }))
            }
            Self::TopicLimitExceeded => {
                debug!("topic limit exceeded");
                WsError::new(ErrorCode::TopicLimitExceeded, "topic limit exceeded")
            }
            Self::AdapterError(err) => {
                warn!(?err, "adapter error");
                WsError::new(ErrorCode::AdapterError, format!("adapter error: {}", err))
            }
            Self::TopicsBatchRollback { source, rollback_failed } => {
                warn!(?source, ?rollback_failed, "adapter error during batch op, rollback attempted");
                WsError::new(ErrorCode::AdapterError, format!("adapter error: {}", source))
                    .with_details(serde_json::json!({ "rollbackFailed": rollback_failed }))
            }
            Self::Anyhow(err) => {
                error!(?err, "internal error");
                WsError::new(ErrorCode::InternalServerError, "internal server error")
            }
            Self::Arc(err) => err.as_wire_error(),
            Self::WithContext(err, msg) => match err {
                Some(err) => {
                    warn!(?err, %msg, "error with context");
                    err.as_wire_error()
                }
                None => {
                    warn!(%msg, "error with context");
                    WsError::new(ErrorCode::InternalServerError, msg.clone())
                }
            },
        }
    }
}

pub trait WsRouterErrorContext<T> {
    fn ws_context<S: Into<Cow<'static, str>>>(self, msg: S) -> WsRouterResult<T>;
}

impl<T> WsRouterErrorContext<T> for Option<T> {
    fn ws_context<S: Into<Cow<'static, str>>>(self, msg: S) -> WsRouterResult<T> {
        self.ok_or(WsRouterError::WithContext(None, msg.into()))
    }
}

impl<T, E> WsRouterErrorContext<T> for Result<T, E>
where
    E: Into<WsRouterError>,
{
    fn ws_context<S: Into<Cow<'static, str>>>(self, msg: S) -> WsRouterResult<T> {
        self.map_err(|err| WsRouterError::WithContext(Some(Box::new(err.into())), msg.into()))
    }
}
