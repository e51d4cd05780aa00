//! API Error Taxonomy
//!
//! Maps every component error onto the HTTP surface: validation 400,
//! authentication 401, authorization 403, not-found 404, conflict 409,
//! expired 410, downstream 502. Already-claimed settlements are not
//! errors - they surface as success-shaped receipts upstream of this
//! module.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::duel::DuelError;
use crate::ledger::LedgerError;
use crate::network::auth::AuthError;
use crate::queue::QueueError;
use crate::settle::SettleError;

/// API-surface errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or invalid request.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid credentials.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed.
    #[error("{0}")]
    Forbidden(String),

    /// Target row does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Stale version or conflicting state; re-read and retry.
    #[error("{0}")]
    Conflict(String),

    /// The window for this operation has closed.
    #[error("{0}")]
    Expired(String),

    /// Payment/payout provider failure; try again.
    #[error("{0}")]
    Downstream(String),
}

/// JSON error body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Expired(_) => StatusCode::GONE,
            ApiError::Downstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized(_) => "authentication_error",
            ApiError::Forbidden(_) => "authorization_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Expired(_) => "expired",
            ApiError::Downstream(_) => "downstream_failure",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Unauthorized(e.to_string())
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let message = e.to_string();
        match e {
            LedgerError::NotFound => ApiError::NotFound(message),
            LedgerError::WrongOwner | LedgerError::NotRefundEligible => ApiError::Forbidden(message),
            LedgerError::NotConfirmed => ApiError::Validation(message),
            LedgerError::AlreadyConsumed
            | LedgerError::InvalidTransition { .. }
            | LedgerError::RefundInProgress => ApiError::Conflict(message),
            LedgerError::RefundExpired => ApiError::Expired(message),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        let message = e.to_string();
        match e {
            QueueError::AlreadyQueued | QueueError::AlreadyMatched => ApiError::Conflict(message),
            QueueError::StakeCapExceeded { .. }
            | QueueError::PaymentRequired
            | QueueError::FundingMismatch => ApiError::Validation(message),
            QueueError::NotQueued => ApiError::NotFound(message),
            QueueError::Ledger(inner) => inner.into(),
        }
    }
}

impl From<DuelError> for ApiError {
    fn from(e: DuelError) -> Self {
        let message = e.to_string();
        match e {
            DuelError::NotFound => ApiError::NotFound(message),
            DuelError::NotParticipant => ApiError::Forbidden(message),
            DuelError::AlreadyResolved | DuelError::AlreadyTapped | DuelError::Version(_) => {
                ApiError::Conflict(message)
            }
            DuelError::ReadyWindowOver => ApiError::Expired(message),
            DuelError::NotArmed => ApiError::Validation(message),
        }
    }
}

impl From<SettleError> for ApiError {
    fn from(e: SettleError) -> Self {
        let message = e.to_string();
        match e {
            SettleError::NotFound => ApiError::NotFound(message),
            SettleError::NotParticipant
            | SettleError::NotWinner
            | SettleError::UseRefundFlow
            | SettleError::WrongOwner
            | SettleError::NotRefundEligible => ApiError::Forbidden(message),
            SettleError::NotResolved
            | SettleError::RefundInProgress
            | SettleError::Version(_) => ApiError::Conflict(message),
            SettleError::ClaimExpired | SettleError::RefundExpired => ApiError::Expired(message),
            SettleError::WalletUnknown => ApiError::Validation(message),
            SettleError::Downstream(_) => ApiError::Downstream(message),
        }
    }
}
