use axum::{
    async_trait,
    extract::{
        rejection::{BytesRejection, FailedToBufferBody},
        FromRef, FromRequest, Request,
    },
    http::header::CONTENT_TYPE,
};
use bytes::Bytes;

use basalt_transport::{decode_records, ReplicateRecord, CONTENT_TYPE_ARROW};

use super::{error::ErrorReply, Config};

/// Body of a replication request: an arrow IPC file of record versions.
pub(crate) struct ReplicateRequest(pub(crate) Vec<ReplicateRecord>);

#[async_trait]
impl<S> FromRequest<S> for ReplicateRequest
where
    Config: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ErrorReply;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let max_request_bytes = Config::from_ref(state).max_request_bytes;

        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if content_type != CONTENT_TYPE_ARROW {
            return Err(ErrorReply::CannotAccept(content_type.to_string()));
        }

        let bytes = Bytes::from_request(req, state).await.map_err(|e| match e {
            BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
                ErrorReply::PayloadTooLarge(max_request_bytes)
            }
            _ => ErrorReply::EmptyBody,
        })?;
        if bytes.is_empty() {
            return Err(ErrorReply::EmptyBody);
        }

        decode_records(&bytes)
            .map(ReplicateRequest)
            .map_err(ErrorReply::Decode)
    }
}
