//! HTTP 响应体的行级解析：SSE（OpenAI / Anthropic）与 NDJSON（Ollama）
//!
//! 响应字节流经 tokio_util::io::StreamReader 转为 AsyncBufRead，再按行读取。

use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;

use crate::llm::LlmError;

/// 一个 SSE 事件：可选 event 名 + 多行 data 拼接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

fn body_lines(
    response: reqwest::Response,
) -> impl Stream<Item = Result<String, LlmError>> + Send {
    let bytes = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader = StreamReader::new(Box::pin(bytes));
    async_stream::try_stream! {
        let mut lines = reader.lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| LlmError::Stream(e.to_string()))?
        {
            yield line;
        }
    }
}

/// 按 SSE 规则组装事件：空行结束一个事件，`:` 开头为注释
pub fn sse_events(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, LlmError>> + Send {
    let lines = body_lines(response);
    async_stream::try_stream! {
        let mut parser = SseParser::default();
        futures_util::pin_mut!(lines);
        while let Some(line) = lines.next().await {
            if let Some(event) = parser.feed(&line?) {
                yield event;
            }
        }
        if let Some(event) = parser.flush() {
            yield event;
        }
    }
}

/// 每个非空行一个 JSON 对象
pub fn ndjson_values(
    response: reqwest::Response,
) -> impl Stream<Item = Result<serde_json::Value, LlmError>> + Send {
    let lines = body_lines(response);
    async_stream::try_stream! {
        futures_util::pin_mut!(lines);
        while let Some(line) = lines.next().await {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| LlmError::InvalidResponse(format!("bad NDJSON line: {}", e)))?;
            yield value;
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub(crate) fn feed(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    pub(crate) fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_events() {
        let mut parser = SseParser::default();
        assert!(parser.feed(": keep-alive").is_none());
        assert!(parser.feed("event: content_block_delta").is_none());
        assert!(parser.feed("data: {\"a\":1}").is_none());
        let event = parser.feed("").unwrap();
        assert_eq!(event.event.as_deref(), Some("content_block_delta"));
        assert_eq!(event.data, "{\"a\":1}");

        assert!(parser.feed("data: line1").is_none());
        assert!(parser.feed("data: line2\r").is_none());
        let event = parser.feed("").unwrap();
        assert_eq!(event.event, None);
        assert_eq!(event.data, "line1\nline2");

        assert!(parser.feed("").is_none());
    }
}
