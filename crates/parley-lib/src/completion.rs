//! Streaming chat completions from an OpenAI-compatible model server.
//!
//! LM Studio (and llama.cpp, vLLM, …) answer `POST /v1/chat/completions`
//! with `stream: true` as server-sent events:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//! data: {"choices":[{"delta":{"content":"lo."}}]}
//! data: [DONE]
//! ```
//!
//! [`LmStudioClient`] turns that into a [`FragmentStream`] of text pieces.
//! Dropping the stream closes the connection, which is how an in-flight
//! reply is cancelled.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_core::types::{ChatMessage, ChatRequest};

use crate::error::ChatError;

/// Lazily produced reply text, in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Something that can open a streaming reply for a chat history.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream, ChatError>;
}

/// Client for a local OpenAI-compatible server.
#[derive(Clone)]
pub struct LmStudioClient {
    client: reqwest::Client,
    base_url: String,
    idle_timeout: Duration,
}

impl LmStudioClient {
    /// `timeout` bounds both connecting and every wait for the next chunk.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ChatError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            idle_timeout: timeout,
        })
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    stream: bool,
}

impl<'a> CompletionBody<'a> {
    fn from_request(request: &'a ChatRequest) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            temperature: request.params.temperature,
            seed: request.params.seed,
            max_tokens: request.params.max_tokens.filter(|&n| n > 0),
            stop: &request.params.stop,
            stream: true,
        }
    }
}

#[async_trait]
impl CompletionClient for LmStudioClient {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream, ChatError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!("stream: POST {url} ({} messages)", request.messages.len());

        let idle = self.idle_timeout;
        let send = self
            .client
            .post(&url)
            .json(&CompletionBody::from_request(request))
            .send();
        let resp = tokio::time::timeout(idle, send)
            .await
            .map_err(|_| ChatError::Timeout(idle))?
            .map_err(|e| ChatError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Status { status, body });
        }

        Ok(decode_fragments(resp.bytes_stream(), idle))
    }
}

/// Turn a raw SSE body into reply fragments. Waiting longer than `idle` for
/// the next chunk ends the stream with [`ChatError::Timeout`].
pub fn decode_fragments<S, B, E>(bytes: S, idle: Duration) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::default();
        'read: loop {
            let chunk = match tokio::time::timeout(idle, bytes.next()).await {
                Err(_) => Err(ChatError::Timeout(idle))?,
                Ok(None) => break 'read,
                Ok(Some(Err(e))) => Err(ChatError::Stream(e.to_string()))?,
                Ok(Some(Ok(chunk))) => chunk,
            };

            for line in decoder.push(chunk.as_ref()) {
                match parse_sse_line(&line)? {
                    SseEvent::Fragment(text) => yield text,
                    SseEvent::Done => break 'read,
                    SseEvent::Skip => {}
                }
            }
        }
        debug!("stream: closed");
    };
    Box::pin(stream)
}

// ─── SSE parsing ───────────────────────────────────────────────────────────

/// Splits a byte stream into text lines.
///
/// Buffers raw bytes until a `\n`, so multi-byte characters split across
/// network chunks come out whole.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Feed bytes, returning every line completed by them (without the
    /// line terminator).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }
}

/// Meaning of one SSE line.
#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    Fragment(String),
    Done,
    /// Comments, keep-alives, empty deltas, role-only deltas.
    Skip,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// Interpret a single `data:` line.
pub fn parse_sse_line(line: &str) -> Result<SseEvent, ChatError> {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: StreamChunk =
        serde_json::from_str(payload).map_err(|_| ChatError::Malformed(payload.to_string()))?;

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ChatError::Stream(message));
    }

    let text = chunk.choices.into_iter().next().and_then(|choice| {
        choice
            .text
            .filter(|t| !t.is_empty())
            .or_else(|| choice.delta.and_then(|d| d.content.or(d.text)))
    });

    Ok(match text {
        Some(text) if !text.is_empty() => SseEvent::Fragment(text),
        _ => SseEvent::Skip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use parley_core::types::{Role, SamplingParams};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "local-model".into(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            params: SamplingParams::default(),
        }
    }

    #[test]
    fn parses_delta_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseEvent::Fragment("Hel".into()));
    }

    #[test]
    fn parses_legacy_text_field() {
        let line = r#"data: {"choices":[{"text":"lo.","index":0}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseEvent::Fragment("lo.".into()));
    }

    #[test]
    fn role_only_and_keepalive_lines_are_skipped() {
        let role = r#"data: {"choices":[{"delta":{"role":"assistant","content":null}}]}"#;
        assert_eq!(parse_sse_line(role).unwrap(), SseEvent::Skip);
        assert_eq!(parse_sse_line(": ping").unwrap(), SseEvent::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseEvent::Skip);
        assert_eq!(parse_sse_line("event: message").unwrap(), SseEvent::Skip);
    }

    #[test]
    fn done_marker_ends_stream() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseEvent::Done);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_sse_line("data: {not json"),
            Err(ChatError::Malformed(_))
        ));
    }

    #[test]
    fn server_error_object_becomes_stream_error() {
        let line = r#"data: {"error":{"message":"model unloaded"}}"#;
        match parse_sse_line(line) {
            Err(ChatError::Stream(msg)) => assert_eq!(msg, "model unloaded"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decoder_reassembles_split_utf8() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1; // inside the two-byte é

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let lines = decoder.push(&bytes[split..]);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            parse_sse_line(&lines[0]).unwrap(),
            SseEvent::Fragment("café".into())
        );
    }

    #[test]
    fn decoder_strips_crlf() {
        let mut decoder = SseDecoder::default();
        let lines = decoder.push(b"data: [DONE]\r\n\r\n");
        assert_eq!(lines, vec!["data: [DONE]".to_string(), String::new()]);
    }

    #[test]
    fn body_omits_unset_options() {
        let req = request();
        let json = serde_json::to_value(CompletionBody::from_request(&req)).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["model"], "local-model");
        assert!(json.get("seed").is_none());
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("stop").is_none());

        let mut req = request();
        req.params.seed = Some(7);
        req.params.max_tokens = Some(0);
        req.params.stop = vec!["<|eot_id|>".into()];
        let json = serde_json::to_value(CompletionBody::from_request(&req)).unwrap();
        assert_eq!(json["seed"], 7);
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["stop"][0], "<|eot_id|>");
    }

    #[tokio::test]
    async fn streams_fragments_until_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"there.\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .json_body_partial(
                        r#"{"stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
                    );
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;

        let client = LmStudioClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        let stream = client.stream_chat(&request()).await.unwrap();
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, vec!["Hello ", "there."]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500).body("no model loaded");
            })
            .await;

        let client = LmStudioClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        match client.stream_chat(&request()).await {
            Err(ChatError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "no model loaded");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn stalled_body_times_out_after_the_last_fragment() {
        let first = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n";
        let bytes = stream::iter([Ok::<_, String>(first)]).chain(stream::pending());
        let idle = Duration::from_millis(100);

        let mut fragments = decode_fragments(bytes, idle);
        assert_eq!(fragments.next().await.unwrap().unwrap(), "Hi");
        match fragments.next().await {
            Some(Err(ChatError::Timeout(waited))) => assert_eq!(waited, idle),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(fragments.next().await.is_none());
    }

    #[tokio::test]
    async fn broken_body_is_a_stream_error() {
        let bytes = stream::iter([
            Ok("data: {\"choices\":[{\"text\":\"a\"}]}\n"),
            Err("connection reset"),
        ]);
        let results: Vec<_> = decode_fragments(bytes, Duration::from_secs(1)).collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "a");
        assert!(matches!(&results[1], Err(ChatError::Stream(msg)) if msg == "connection reset"));
    }

    #[tokio::test]
    async fn silent_server_times_out_before_headers() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let client = LmStudioClient::new(&server.base_url(), Duration::from_millis(100)).unwrap();
        assert!(matches!(
            client.stream_chat(&request()).await,
            Err(ChatError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_a_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LmStudioClient::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            client.stream_chat(&request()).await,
            Err(ChatError::Request(_))
        ));
    }
}
