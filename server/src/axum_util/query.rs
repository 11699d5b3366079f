use axum::extract;
use axum::http;
use serde::de;
use tracing::debug;

use crate::http::error::ErrorReply;

/// Deepest `a[b][c]` nesting accepted in a query string.
const MAX_DEPTH: usize = 2;

/// Query string extractor backed by `serde_qs`, so nested parameters and
/// hex ids decode the same way the client encodes them.
///
/// A request without a query string decodes as an empty one: parameter
/// structs whose fields all have defaults accept it, and the rest reject
/// with the name of the first missing field.
#[derive(Debug)]
pub struct Query<T>(pub T);

impl<T: de::DeserializeOwned> Query<T> {
    fn parse(raw: &str) -> Result<Self, ErrorReply> {
        serde_qs::Config::new(MAX_DEPTH, false)
            .deserialize_str(raw)
            .map(Query)
            .map_err(|e| {
                debug!("rejecting query {raw:?}: {e}");
                ErrorReply::InvalidQuery(e.to_string())
            })
    }
}

#[axum::async_trait]
impl<T, S> extract::FromRequestParts<S> for Query<T>
where
    T: de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ErrorReply;

    async fn from_request_parts(
        parts: &mut http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Self::parse(parts.uri.query().unwrap_or_default())
    }
}
