use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use eyre::Report;

use crate::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum NotaryServerError {
    #[error(transparent)]
    Unexpected(#[from] Report),
    #[error("OT busy")]
    OtBusy,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// Converts server errors into HTTP responses. Protocol violations inside a
/// session surface as 500s; the dispatcher has already scheduled the
/// session's destruction by the time this runs.
impl IntoResponse for NotaryServerError {
    fn into_response(self) -> Response {
        match self {
            NotaryServerError::OtBusy => (StatusCode::CONFLICT, "OT busy").into_response(),
            bad_request @ NotaryServerError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, bad_request.to_string()).into_response()
            }
            not_found @ NotaryServerError::SessionNotFound(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, not_found.to_string()).into_response()
            }
            session @ NotaryServerError::Session(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, session.to_string()).into_response()
            }
            NotaryServerError::Unexpected(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something wrong happened.",
            )
                .into_response(),
        }
    }
}
