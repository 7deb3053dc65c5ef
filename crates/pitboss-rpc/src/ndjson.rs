//! Newline-delimited JSON framing for job streams.
//!
//! One `JobFrame` per line, `application/x-ndjson`. The encoder turns a
//! relayed frame stream into a response body; the decoder turns a chunked
//! byte stream back into frames, reassembling lines split across chunks.

use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::warn;

use pitboss_contracts::{error::PitbossError, wire::JobFrame};
use pitboss_core::traits::{FrameStream, JobFrames};

pub const CONTENT_TYPE: &str = "application/x-ndjson";

/// One frame as one line, newline included.
pub fn encode_line(frame: &JobFrame) -> Bytes {
    let mut line = serde_json::to_vec(frame).unwrap_or_else(|e| {
        warn!(error = %e, "job frame encoding failed");
        br#"{"type":"error","code":"internal","message":"frame encoding failed"}"#.to_vec()
    });
    line.push(b'\n');
    Bytes::from(line)
}

/// Stream `frames` as the response body.
pub fn ndjson_response(frames: JobFrames) -> Response {
    let body = Body::from_stream(frames.map(|f| Ok::<_, std::convert::Infallible>(encode_line(&f))));
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

/// Parse a chunked NDJSON body into frames. A transport failure yields one
/// `UpstreamUnavailable` error and ends the stream; so does a line that is
/// not a frame, as `Internal`.
pub fn decode_frames<S, E>(body: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let frames = async_stream::stream! {
        futures_util::pin_mut!(body);
        let mut buf: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(PitbossError::UpstreamUnavailable { reason: format!("job stream broke: {e}") });
                    return;
                }
            };
            buf.extend_from_slice(&bytes);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                match parse_line(&line) {
                    Some(Ok(frame)) => yield Ok(frame),
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    None => {}
                }
            }
        }

        if let Some(result) = parse_line(&buf) {
            yield result;
        }
    };
    Box::pin(frames)
}

fn parse_line(line: &[u8]) -> Option<Result<JobFrame, PitbossError>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(
        serde_json::from_slice::<JobFrame>(line)
            .map_err(|e| PitbossError::internal(format!("malformed job frame: {e}"))),
    )
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use bytes::Bytes;
    use futures_util::{stream, StreamExt};

    use pitboss_contracts::{
        error::ErrorKind,
        wire::{FrameKind, JobFrame},
    };

    use super::{decode_frames, encode_line, ndjson_response};

    #[tokio::test]
    async fn response_is_one_frame_per_line() {
        let frames = stream::iter(vec![JobFrame::progress(25, "quarter"), JobFrame::done(b"r".to_vec())]);
        let response = ndjson_response(Box::pin(frames));
        assert_eq!(response.headers()["content-type"], "application/x-ndjson");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"progress\""));
        assert!(lines[1].contains("\"type\":\"done\""));
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let whole = [encode_line(&JobFrame::log("first")), encode_line(&JobFrame::done(Vec::new()))].concat();
        let (a, b) = whole.split_at(7);
        let (b, c) = b.split_at(b.len() - 3);
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::copy_from_slice(a)),
            Ok(Bytes::copy_from_slice(b)),
            Ok(Bytes::copy_from_slice(c)),
        ];

        let frames: Vec<_> = decode_frames(stream::iter(chunks)).collect().await;
        let kinds: Vec<FrameKind> = frames.into_iter().map(|f| f.unwrap().kind).collect();
        assert_eq!(kinds, vec![FrameKind::Log, FrameKind::Done]);
    }

    #[tokio::test]
    async fn final_line_without_newline_is_parsed() {
        let chunks: Vec<Result<Bytes, String>> = vec![Ok(Bytes::from_static(br#"{"type":"done"}"#))];
        let frames: Vec<_> = decode_frames(stream::iter(chunks)).collect().await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].as_ref().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn transport_and_parse_failures_end_the_stream() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(encode_line(&JobFrame::log("ok"))),
            Err("connection reset".to_string()),
            Ok(encode_line(&JobFrame::log("never seen"))),
        ];
        let frames: Vec<_> = decode_frames(stream::iter(chunks)).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].as_ref().unwrap_err().kind(), ErrorKind::UpstreamUnavailable);

        let chunks: Vec<Result<Bytes, String>> = vec![Ok(Bytes::from_static(b"not json\n"))];
        let frames: Vec<_> = decode_frames(stream::iter(chunks)).collect().await;
        assert_eq!(frames[0].as_ref().unwrap_err().kind(), ErrorKind::Internal);
    }
}
