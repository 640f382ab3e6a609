pub mod health;
pub mod lookup;
pub mod put;
pub mod query;
pub mod suggest;

use axum::body::{Body, Bytes};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt};
use serde::Serialize;

/// Stream a sequence of values as one JSON array, serializing each element
/// as it arrives so the HTTP writer backpressures the producer. An error
/// mid-stream is logged under a correlation code and aborts the body; the
/// status line has already been sent by then.
pub(crate) fn json_array_response<T, S>(stream: S) -> Response
where
    T: Serialize,
    S: Stream<Item = anyhow::Result<T>> + Send + 'static,
{
    let mut first = true;
    let items = stream.map(move |item| -> Result<Bytes, std::io::Error> {
        match item {
            Ok(value) => {
                let mut buf = if first {
                    first = false;
                    Vec::new()
                } else {
                    Vec::from(&b","[..])
                };
                serde_json::to_writer(&mut buf, &value).map_err(std::io::Error::other)?;
                Ok(Bytes::from(buf))
            }
            Err(err) => {
                let code = uuid::Uuid::new_v4();
                tracing::error!("response stream failed [{code}]: {err:#}");
                Err(std::io::Error::other(format!("internal error [{code}]")))
            }
        }
    });
    let open = futures_util::stream::once(async { Ok(Bytes::from_static(b"[")) });
    let close = futures_util::stream::once(async { Ok(Bytes::from_static(b"]")) });
    let body = Body::from_stream(open.chain(items).chain(close));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn collect(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn streams_a_json_array() {
        let stream = futures_util::stream::iter(vec![Ok(1u32), Ok(2), Ok(3)]);
        let body = collect(json_array_response(stream)).await;
        assert_eq!(body, "[1,2,3]");
    }

    #[tokio::test]
    async fn empty_stream_is_an_empty_array() {
        let stream = futures_util::stream::iter(Vec::<anyhow::Result<u32>>::new());
        let body = collect(json_array_response(stream)).await;
        assert_eq!(body, "[]");
    }
}
