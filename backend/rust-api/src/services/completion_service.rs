use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::models::Exercise;

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Completion provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Completion provider reported an error: {0}")]
    Provider(String),
    #[error("Completion stream ended before the provider finished")]
    Truncated,
    #[error("Completion stream returned no data")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
}

impl CompletionRequest {
    /// Prompt asking the model to grade `code` as an implementation of
    /// `exercise` and to close with the verdict marker.
    pub fn grading(code: &str, exercise: Exercise) -> Self {
        Self {
            prompt: format!(
                "Is the following code snippet a correct implementation of {} in typescript? - \"{}\". \
                 Only respond using comments and code directly without using markdown. \
                 End your response with {{ passed: true }} if the implementation is correct, \
                 otherwise end it with {{ passed: false }}.",
                exercise,
                code.trim()
            ),
        }
    }

    pub fn raw(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

/// Lazily produced feedback text; the concatenation of all chunks is the
/// full response.
pub type CompletionStream = BoxStream<'static, Result<String, CompletionError>>;

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, CompletionError>;
}

/// Drains `stream` into one string, handing every chunk to `on_chunk` as it
/// arrives. Fails on the first stream error or when nothing was produced.
pub async fn collect_completion<F>(
    mut stream: CompletionStream,
    mut on_chunk: F,
) -> Result<String, CompletionError>
where
    F: FnMut(&str),
{
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        on_chunk(&chunk);
        text.push_str(&chunk);
    }

    if text.trim().is_empty() {
        return Err(CompletionError::Empty);
    }
    Ok(text)
}

/// OpenAI-compatible `chat/completions` client with `stream: true`.
pub struct OpenAiCompletionService {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompletionService {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletionService {
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, CompletionError> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = json!({
            "model": self.model,
            "stream": true,
            "temperature": 0,
            "messages": [
                { "role": "user", "content": request.prompt }
            ],
        });

        tracing::debug!("Opening completion stream: model={}", self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Completion provider rejected request: status={}", status);
            return Err(CompletionError::Status { status, body });
        }

        Ok(chat_chunk_stream(response.bytes_stream()))
    }
}

/// Frames decoded from a chat-completions SSE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatStreamFrame {
    Delta(String),
    Done,
    Error(String),
}

/// Incremental parser for chat-completions SSE bodies. Buffers raw bytes so
/// multi-byte characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct ChatStreamParser {
    buffer: Vec<u8>,
    done: bool,
}

impl ChatStreamParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ChatStreamFrame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(split) = find_frame_end(&self.buffer) {
            let (end, separator_len) = split;
            let raw: Vec<u8> = self.buffer.drain(..end + separator_len).collect();
            let frame = String::from_utf8_lossy(&raw[..end]);

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            if payload == "[DONE]" {
                self.done = true;
                frames.push(ChatStreamFrame::Done);
                break;
            }
            if let Some(frame) = map_payload(&payload) {
                let is_error = matches!(frame, ChatStreamFrame::Error(_));
                frames.push(frame);
                if is_error {
                    self.done = true;
                    break;
                }
            }
        }

        frames
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn map_payload(payload: &str) -> Option<ChatStreamFrame> {
    let value: Value = serde_json::from_str(payload).ok()?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown provider error");
        return Some(ChatStreamFrame::Error(message.to_string()));
    }

    let content = value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()?;
    Some(ChatStreamFrame::Delta(content.to_string()))
}

struct ChunkStreamState<S> {
    bytes: Pin<Box<S>>,
    parser: ChatStreamParser,
    pending: VecDeque<Result<String, CompletionError>>,
    finished: bool,
}

/// Turns a raw SSE byte stream into text chunks. A body that ends without
/// `[DONE]` yields a trailing `Truncated` error.
pub fn chat_chunk_stream<S, B, E>(bytes: S) -> CompletionStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<CompletionError> + Send + 'static,
{
    let state = ChunkStreamState {
        bytes: Box::pin(bytes),
        parser: ChatStreamParser::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.parser.feed(chunk.as_ref()) {
                        match frame {
                            ChatStreamFrame::Delta(text) if !text.is_empty() => {
                                state.pending.push_back(Ok(text));
                            }
                            ChatStreamFrame::Delta(_) => {}
                            ChatStreamFrame::Done => state.finished = true,
                            ChatStreamFrame::Error(message) => {
                                state.pending.push_back(Err(CompletionError::Provider(message)));
                                state.finished = true;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(e.into()));
                }
                None => {
                    state.finished = true;
                    if !state.parser.is_done() {
                        state.pending.push_back(Err(CompletionError::Truncated));
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({ "choices": [{ "index": 0, "delta": { "content": text } }] })
        )
    }

    #[test]
    fn parse_frames_incrementally() {
        let mut parser = ChatStreamParser::default();
        let body = format!("{}{}data: [DONE]\n\n", delta("// looks "), delta("right"));
        let (first, second) = body.split_at(17);

        let mut frames = parser.feed(first.as_bytes());
        assert!(frames.is_empty());
        frames.extend(parser.feed(second.as_bytes()));

        assert_eq!(
            frames,
            vec![
                ChatStreamFrame::Delta("// looks ".into()),
                ChatStreamFrame::Delta("right".into()),
                ChatStreamFrame::Done,
            ]
        );
        assert!(parser.is_done());
    }

    #[test]
    fn multibyte_characters_split_across_chunks() {
        let mut parser = ChatStreamParser::default();
        let body = delta("résumé");
        let bytes = body.as_bytes();
        let cut = body.find('é').unwrap() + 1;

        assert!(parser.feed(&bytes[..cut]).is_empty());
        assert_eq!(
            parser.feed(&bytes[cut..]),
            vec![ChatStreamFrame::Delta("résumé".into())]
        );
    }

    #[test]
    fn role_only_and_comment_frames_are_skipped() {
        let mut parser = ChatStreamParser::default();
        let role = format!(
            "data: {}\n\n",
            json!({ "choices": [{ "delta": { "role": "assistant" } }] })
        );
        let frames = parser.feed(format!(": keep-alive\n\n{}", role).as_bytes());
        assert!(frames.is_empty());
    }

    #[test]
    fn provider_error_frame_stops_parsing() {
        let mut parser = ChatStreamParser::default();
        let body = format!(
            "data: {}\n\n{}",
            json!({ "error": { "message": "rate limited" } }),
            delta("ignored")
        );
        assert_eq!(
            parser.feed(body.as_bytes()),
            vec![ChatStreamFrame::Error("rate limited".into())]
        );
    }

    #[tokio::test]
    async fn chunk_stream_collects_full_text() {
        let body = vec![
            Ok::<_, CompletionError>(delta("// binary search ").into_bytes()),
            Ok(delta("{ passed: true }").into_bytes()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let mut seen = Vec::new();
        let text = collect_completion(chat_chunk_stream(stream::iter(body)), |chunk| {
            seen.push(chunk.to_string())
        })
        .await
        .unwrap();

        assert_eq!(text, "// binary search { passed: true }");
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn chunk_stream_without_done_is_truncated() {
        let body = vec![Ok::<_, CompletionError>(delta("partial").into_bytes())];
        let err = collect_completion(chat_chunk_stream(stream::iter(body)), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Truncated));
    }

    #[tokio::test]
    async fn empty_completion_is_an_error() {
        let body = vec![Ok::<_, CompletionError>(b"data: [DONE]\n\n".to_vec())];
        let err = collect_completion(chat_chunk_stream(stream::iter(body)), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Empty));
    }

    #[test]
    fn grading_prompt_mentions_exercise_and_marker() {
        let request = CompletionRequest::grading("  function f() {}\n", Exercise::BinarySearch);
        assert!(request
            .prompt
            .contains("correct implementation of Binary search in typescript"));
        assert!(request.prompt.contains("\"function f() {}\""));
        assert!(request.prompt.contains("{ passed: true }"));
    }
}
