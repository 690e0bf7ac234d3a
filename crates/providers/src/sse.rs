//! Server-sent event framing shared by the HTTP providers.
//!
//! Bytes are buffered until a full line is available, so multi-byte UTF-8
//! characters split across network reads are decoded intact. Only `data:`
//! lines are surfaced; comments and other SSE fields are skipped.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    /// The OpenAI-style `data: [DONE]` sentinel.
    Done,
}

/// Splits a byte stream into SSE data frames. A read error is yielded once and
/// ends the frame stream.
pub fn sse_frames<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseFrame, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), false),
        |(mut stream, mut buffer, finished)| async move {
            if finished {
                return None;
            }

            loop {
                if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let mut line = buffer.split_to(newline + 1);
                    line.truncate(newline);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    if let Some(frame) = parse_line(&line) {
                        return Some((Ok(frame), (stream, buffer, false)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(err)) => return Some((Err(err), (stream, buffer, true))),
                    None => {
                        let rest = buffer.split();
                        return parse_line(&rest).map(|frame| (Ok(frame), (stream, buffer, true)));
                    }
                }
            }
        },
    )
}

/// Invalid UTF-8 is replaced rather than dropped so every data line still
/// reaches the normalizer.
fn parse_line(line: &[u8]) -> Option<SseFrame> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line
        .strip_prefix("data:")
        .map(str::trim)
        .filter(|data| !data.is_empty())?;
    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    Some(SseFrame::Data(data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(parts: Vec<&[u8]>) -> Vec<Result<SseFrame, String>> {
        let source = futures::stream::iter(
            parts
                .into_iter()
                .map(|part| Ok::<_, String>(Bytes::copy_from_slice(part)))
                .collect::<Vec<_>>(),
        );
        sse_frames(source).collect().await
    }

    #[tokio::test]
    async fn reassembles_lines_split_across_reads() {
        let frames = collect(vec![
            b"data: {\"result\":\"a\"",
            b"}\n\ndata: {\"result\":\"b\"}\n",
            b"\n",
        ])
        .await;
        assert_eq!(
            frames,
            vec![
                Ok(SseFrame::Data("{\"result\":\"a\"}".to_string())),
                Ok(SseFrame::Data("{\"result\":\"b\"}".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn keeps_multibyte_characters_split_mid_sequence() {
        let text = "data: 你好\n".as_bytes();
        let (head, tail) = text.split_at(8);
        let frames = collect(vec![head, tail]).await;
        assert_eq!(frames, vec![Ok(SseFrame::Data("你好".to_string()))]);
    }

    #[tokio::test]
    async fn invalid_utf8_data_line_is_kept() {
        let frames = collect(vec![
            b"data: {\"result\":\"\xff\"}\n\ndata: {\"result\":\"b\"}\n",
        ])
        .await;
        assert_eq!(
            frames,
            vec![
                Ok(SseFrame::Data("{\"result\":\"\u{FFFD}\"}".to_string())),
                Ok(SseFrame::Data("{\"result\":\"b\"}".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn skips_comments_and_other_fields() {
        let frames = collect(vec![
            b": keep-alive\r\nevent: message\r\nid: 3\r\ndata:{\"x\":1}\r\n\r\ndata: [DONE]\r\n\r\n",
        ])
        .await;
        assert_eq!(
            frames,
            vec![
                Ok(SseFrame::Data("{\"x\":1}".to_string())),
                Ok(SseFrame::Done),
            ]
        );
    }

    #[tokio::test]
    async fn flushes_trailing_line_without_newline() {
        let frames = collect(vec![b"data: {\"is_end\":true}"]).await;
        assert_eq!(
            frames,
            vec![Ok(SseFrame::Data("{\"is_end\":true}".to_string()))]
        );
    }

    #[tokio::test]
    async fn read_error_ends_the_stream() {
        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: 1\n")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"data: 2\n")),
        ]);
        let frames: Vec<_> = sse_frames(source).collect().await;
        assert_eq!(
            frames,
            vec![
                Ok(SseFrame::Data("1".to_string())),
                Err("connection reset".to_string()),
            ]
        );
    }
}
