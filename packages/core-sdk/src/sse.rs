use std::fmt::Display;

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StreamError;

const DATA_PREFIX: &[u8] = b"data: ";
const DONE_SENTINEL: &[u8] = b"[DONE]";

/**
 * \brief 解码器产出的增量；通道关闭即表示流结束。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Text(String),
    Error(StreamError),
    Done,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Option<Vec<ChunkChoice>>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Ignore,
    Text(String),
    Done,
    Fail(StreamError),
}

/**
 * \brief 在独立任务中解码 SSE 字节流，返回单消费者通道。
 * \details 任务退出（正常结束、解析失败、读失败、取消）时发送端随之释放，通道必然关闭。
 */
pub fn decode<S, B, E>(body: S, cancel: CancellationToken) -> mpsc::UnboundedReceiver<StreamDelta>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_decoder(body, tx, cancel));
    rx
}

async fn run_decoder<S, B, E>(
    body: S,
    tx: mpsc::UnboundedSender<StreamDelta>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut body = Box::pin(body);
    let mut buf = Vec::<u8>::new();
    // buf[..scanned] 已确认不含换行
    let mut scanned = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = tx.send(StreamDelta::Error(StreamError::Cancelled));
                return;
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                buf.extend_from_slice(bytes.as_ref());
                while let Some(offset) = buf[scanned..].iter().position(|b| *b == b'\n') {
                    let line = buf.drain(..=scanned + offset).collect::<Vec<u8>>();
                    scanned = 0;
                    if !forward(parse_line(&line), &tx) {
                        return;
                    }
                }
                scanned = buf.len();
            }
            Some(Err(e)) => {
                let _ = tx.send(StreamDelta::Error(StreamError::Read(e.to_string())));
                return;
            }
            None => {
                if !buf.is_empty() {
                    forward(parse_line(&buf), &tx);
                }
                return;
            }
        }
    }
}

/// Returns whether decoding should continue.
fn forward(frame: Frame, tx: &mpsc::UnboundedSender<StreamDelta>) -> bool {
    match frame {
        Frame::Ignore => true,
        // 消费端已放弃时提前结束
        Frame::Text(text) => tx.send(StreamDelta::Text(text)).is_ok(),
        Frame::Done => {
            let _ = tx.send(StreamDelta::Done);
            false
        }
        Frame::Fail(err) => {
            debug!(error = %err, "stream terminated with error frame");
            let _ = tx.send(StreamDelta::Error(err));
            false
        }
    }
}

fn parse_line(line: &[u8]) -> Frame {
    let line = trim_line_end(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Frame::Ignore;
    };
    if payload == DONE_SENTINEL {
        return Frame::Done;
    }

    let chunk: ChatChunk = match serde_json::from_slice(payload) {
        Ok(chunk) => chunk,
        Err(e) => return Frame::Fail(StreamError::Parse(e.to_string())),
    };

    if let Some(err) = chunk.error {
        let message = match err.kind {
            Some(kind) if err.message.is_empty() => kind,
            _ => err.message,
        };
        return Frame::Fail(StreamError::Upstream(message));
    }

    let message = chunk.message.as_ref().and_then(Value::as_str).unwrap_or_default();
    match chunk.code.as_ref().map(code_value) {
        Some(Err(err)) => return Frame::Fail(err),
        Some(Ok(code)) if code != 0 => {
            return Frame::Fail(StreamError::Upstream(message.to_string()))
        }
        _ => {}
    }

    let Some(choices) = chunk.choices else {
        // 兼容层的自定义错误帧：只有 {"message": "..."}
        if chunk.code.is_none() && !message.is_empty() {
            return Frame::Fail(StreamError::Upstream(message.to_string()));
        }
        return Frame::Ignore;
    };

    match choices.into_iter().next() {
        Some(ChunkChoice {
            delta: Some(ChunkDelta {
                content: Some(content),
            }),
        }) => Frame::Text(content),
        _ => Frame::Ignore,
    }
}

/// `code` must be an integer; anything else is a malformed frame.
fn code_value(code: &Value) -> Result<i64, StreamError> {
    match code {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| StreamError::Parse(format!("invalid code: {}", n))),
        other => Err(StreamError::Parse(format!("invalid code: {}", other))),
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
