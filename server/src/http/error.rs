use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use basalt_transport::{ChunkError, ErrorMessage};
use tracing::{debug, error};

use crate::error::Error;

#[derive(Debug)]
pub enum ErrorReply {
    Storage(Error),
    Decode(ChunkError),
    EmptyBody,
    InvalidQuery(String),
    CannotAccept(String),
    PayloadTooLarge(usize),
    NotMaster,
}

impl From<Error> for ErrorReply {
    fn from(e: Error) -> Self {
        Self::Storage(e)
    }
}

impl ErrorReply {
    fn status(&self) -> StatusCode {
        match self {
            Self::Storage(e) => storage_status(e),
            Self::Decode(_)
            | Self::EmptyBody
            | Self::InvalidQuery(_)
            | Self::CannotAccept(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotMaster => StatusCode::NOT_FOUND,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Storage(e) => e.to_string(),
            Self::Decode(e) => format!("invalid record batch: {e}"),
            Self::EmptyBody => "no body provided".to_string(),
            Self::InvalidQuery(reason) => format!("invalid query: {reason}"),
            Self::CannotAccept(content) => format!("cannot parse Content-Type '{content}'"),
            Self::PayloadTooLarge(max) => format!("payload exceeds {max} bytes"),
            Self::NotMaster => "this server is not a config master".to_string(),
        }
    }
}

fn storage_status(e: &Error) -> StatusCode {
    match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::IllegalArgument(_) => StatusCode::BAD_REQUEST,
        Error::IllegalState(_) | Error::ConcurrentModification(_) | Error::AlreadyRunning(_) => {
            StatusCode::CONFLICT
        }
        Error::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ErrorReply {
    fn into_response(self) -> Response {
        let code = self.status();
        let message = self.message();
        if code.is_server_error() {
            error!("{code}: {message}");
        } else {
            debug!("{code}: {message}");
        }

        (
            code,
            Json(ErrorMessage {
                code: code.as_u16(),
                message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn storage_errors_map_to_status_codes() {
        let cases = [
            (Error::NotFound("t".into()), StatusCode::NOT_FOUND),
            (Error::IllegalArgument("a".into()), StatusCode::BAD_REQUEST),
            (Error::IllegalState("frozen".into()), StatusCode::CONFLICT),
            (Error::ConcurrentModification("v".into()), StatusCode::CONFLICT),
            (Error::AlreadyRunning("split".into()), StatusCode::CONFLICT),
            (Error::NotImplemented("log".into()), StatusCode::NOT_IMPLEMENTED),
            (Error::runtime("boom"), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Cancelled, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ErrorReply::from(error).into_response().status(), status);
        }
    }

    #[test]
    fn request_errors_are_bad_requests() {
        assert_eq!(
            ErrorReply::InvalidQuery("missing".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorReply::PayloadTooLarge(10).into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ErrorReply::NotMaster.into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
