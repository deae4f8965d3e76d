//! 생성 모듈 - OpenAI 호환 Chat Completions
//!
//! 질의 변환(HyDE, multi-query, step-back)과 최종 답변 생성에 쓰입니다.
//! 스트리밍은 SSE `data:` 라인을 읽는 별도 태스크가 bounded 채널로 토큰을 흘려보내며,
//! 수신 측이 닫히면 업스트림 읽기를 중단합니다.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::OpenAiConfig;

/// 스트리밍 채널 버퍼 크기
const STREAM_BUFFER: usize = 64;

// ============================================================================
// Types
// ============================================================================

/// 토큰 사용량
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// 비스트리밍 생성 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

/// 스트리밍 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// 텍스트 조각
    Token(String),
    /// 마지막 사용량 레코드
    Usage(TokenUsage),
}

pub type TokenStream = ReceiverStream<Result<StreamEvent>>;

// ============================================================================
// GenerationProvider Trait
// ============================================================================

/// 생성 프로바이더 트레이트
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// 시스템 프롬프트 + 사용자 메시지로 한 번에 생성
    async fn generate(&self, system_prompt: &str, user_message: &str, temperature: f64)
        -> Result<Generation>;

    /// 스트리밍 생성
    ///
    /// 스트림을 drop하면 업스트림 요청도 중단됩니다.
    async fn generate_stream(
        &self,
        system_prompt: &str,
        user_message: &str,
        temperature: f64,
    ) -> Result<TokenStream>;

    fn model(&self) -> &str;
}

// ============================================================================
// OpenAI Generation
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenAiGeneration {
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGeneration {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            max_tokens,
            client,
        })
    }

    pub fn from_config(config: &OpenAiConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .context("OpenAI API key not found. Set OPENAI_API_KEY environment variable.")?;
        Self::new(api_key, &config.base_url, &config.llm_model, config.max_tokens)
    }

    fn request<'a>(
        &'a self,
        system_prompt: &'a str,
        user_message: &'a str,
        temperature: f64,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_message,
                },
            ],
            temperature,
            max_tokens: self.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI chat error ({}): {}", status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGeneration {
    async fn generate(
        &self,
        system_prompt: &str,
        user_message: &str,
        temperature: f64,
    ) -> Result<Generation> {
        let request = self.request(system_prompt, user_message, temperature, false);
        let response = self.send(&request).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(Generation {
            text,
            usage: parsed.usage.unwrap_or_default(),
        })
    }

    async fn generate_stream(
        &self,
        system_prompt: &str,
        user_message: &str,
        temperature: f64,
    ) -> Result<TokenStream> {
        let request = self.request(system_prompt, user_message, temperature, true);
        let response = self.send(&request).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let stream = response.bytes_stream();
        tokio::spawn(async move {
            forward_sse(stream, tx).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// SSE Parsing
// ============================================================================

/// 바이트 스트림을 읽어 토큰/사용량 이벤트로 전달
///
/// 수신 측이 닫히면 즉시 반환하며, 응답 본문도 함께 drop됩니다.
async fn forward_sse<S>(mut stream: S, tx: mpsc::Sender<Result<StreamEvent>>)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut parser = SseParser::default();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Receiver dropped, stopping stream");
                return;
            }
            next = stream.next() => next,
        };

        let Some(chunk) = next else {
            break;
        };

        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx
                    .send(Err(anyhow::anyhow!("Stream read failed: {}", e)))
                    .await;
                return;
            }
        };

        for line in parser.push(&bytes) {
            match line {
                SseLine::Done => return,
                SseLine::Invalid(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                SseLine::Events(events) => {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            tracing::debug!("Receiver dropped, stopping stream");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// 파싱된 SSE 라인 하나
#[derive(Debug)]
enum SseLine {
    Events(Vec<StreamEvent>),
    Done,
    Invalid(anyhow::Error),
}

/// 청크 경계에 걸친 UTF-8 / 라인을 버퍼링하는 증분 파서
#[derive(Debug, Default)]
struct SseParser {
    bytes: Vec<u8>,
    text: String,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.bytes.extend_from_slice(chunk);
        loop {
            let (end, complete) = match std::str::from_utf8(&self.bytes) {
                Ok(s) => (s.len(), true),
                // 잘못된 바이트는 U+FFFD로 바꿔 넘김
                Err(e) => match e.error_len() {
                    Some(len) => (e.valid_up_to() + len, false),
                    // 청크 끝에서 잘린 문자는 다음 청크를 기다림
                    None => (e.valid_up_to(), true),
                },
            };
            let decoded: Vec<u8> = self.bytes.drain(..end).collect();
            self.text.push_str(&String::from_utf8_lossy(&decoded));
            if complete {
                break;
            }
        }

        let mut lines = Vec::new();
        while let Some(end) = self.text.find('\n') {
            let line: String = self.text.drain(..=end).collect();
            if let Some(parsed) = parse_line(line.trim()) {
                lines.push(parsed);
            }
        }
        lines
    }
}

fn parse_line(line: &str) -> Option<SseLine> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseLine::Done);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let mut events: Vec<StreamEvent> = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .filter(|c| !c.is_empty())
                .map(StreamEvent::Token)
                .collect();
            if let Some(usage) = chunk.usage {
                events.push(StreamEvent::Usage(usage));
            }
            Some(SseLine::Events(events))
        }
        Err(e) => Some(SseLine::Invalid(
            anyhow::Error::new(e).context("Failed to parse stream chunk"),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(lines: &[SseLine]) -> Vec<String> {
        lines
            .iter()
            .filter_map(|l| match l {
                SseLine::Events(events) => Some(events.clone()),
                _ => None,
            })
            .flatten()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_parse_content_and_usage() {
        let mut parser = SseParser::default();
        let lines = parser.push(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
              data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":2}}\n\n\
              data: [DONE]\n\n",
        );

        assert_eq!(tokens(&lines), vec!["Hel", "lo"]);
        assert!(lines.iter().any(|l| matches!(
            l,
            SseLine::Events(e) if e.contains(&StreamEvent::Usage(TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 2
            }))
        )));
        assert!(matches!(lines.last(), Some(SseLine::Done)));
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: {\"choices\":[{\"delta\":").is_empty());
        let lines = parser.push(b"{\"content\":\"abc\"}}]}\n");
        assert_eq!(tokens(&lines), vec!["abc"]);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let payload = "data: {\"choices\":[{\"delta\":{\"content\":\"한글\"}}]}\n".as_bytes();
        // '한'의 3바이트 중간에서 자름
        let cut = payload.iter().position(|&b| b >= 0x80).unwrap() + 1;

        let mut parser = SseParser::default();
        assert!(parser.push(&payload[..cut]).is_empty());
        let lines = parser.push(&payload[cut..]);
        assert_eq!(tokens(&lines), vec!["한글"]);
    }

    #[test]
    fn test_invalid_utf8_does_not_stall() {
        let mut parser = SseParser::default();
        let lines = parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\xffb\"}}]}\n");
        assert_eq!(tokens(&lines), vec!["a\u{FFFD}b"]);

        let lines = parser.push(b"\xfe\ndata: [DONE]\n");
        assert!(matches!(lines.as_slice(), [SseLine::Done]));
        assert!(parser.bytes.is_empty());
    }

    #[test]
    fn test_ignores_comments_and_blank_lines() {
        let mut parser = SseParser::default();
        let lines = parser.push(b": keep-alive\n\nevent: ping\n");
        assert!(lines.is_empty());
    }

    #[test]
    fn test_invalid_json_reported() {
        let mut parser = SseParser::default();
        let lines = parser.push(b"data: {not json}\n");
        assert!(matches!(lines.as_slice(), [SseLine::Invalid(_)]));
    }

    #[tokio::test]
    async fn test_forward_sse_stops_at_done() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n")),
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
            )),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        forward_sse(futures::stream::iter(chunks), tx).await;

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event.unwrap());
        }
        assert_eq!(received, vec![StreamEvent::Token("a".to_string())]);
    }

    #[test]
    fn test_stream_request_includes_usage_option() {
        let generator =
            OpenAiGeneration::new("key", "https://api.openai.com/v1", "gpt-4o", 256).unwrap();
        let request = generator.request("sys", "user", 0.2, true);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "user");

        let json = serde_json::to_value(generator.request("s", "u", 0.2, false)).unwrap();
        assert!(json.get("stream_options").is_none());
    }
}
