use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Proxy, RequestBuilder, Response, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RelayError;
use crate::models::{ChatMessage, HistoryEntry};
use crate::sse::{self, StreamDelta};

/** \brief 绘画可选模型，随机挑选其一 */
pub const PAINT_MODELS: [&str; 2] = ["dall-e-3", "pg.dall-e-3"];

/**
 * \brief 发往 `/v1/chat/completions` 的请求体。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

/**
 * \brief 发往 `/v1/images/generations` 的请求体。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub quality: String,
    pub n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub style: String,
}

impl ImageRequest {
    /**
     * \brief 默认参数：standard 画质、vivid 风格、单张。
     */
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            quality: "standard".to_string(),
            n: 1,
            size: None,
            style: "vivid".to_string(),
        }
    }
}

/**
 * \brief 构造 HTTP 客户端。
 * \param proxies 代理地址，支持 http/https/socks5；空串表示直连
 * \param timeout 建连超时；响应体读取不设上限，由取消令牌终止
 */
pub fn build_client(proxies: &str, timeout: Duration) -> Result<Client, RelayError> {
    let mut builder = Client::builder().connect_timeout(timeout);
    let proxies = proxies.trim();
    if !proxies.is_empty() {
        let url = Url::parse(proxies)
            .map_err(|e| RelayError::Config(format!("invalid proxy {}: {}", proxies, e)))?;
        match url.scheme() {
            "http" | "https" | "socks5" => {
                let proxy = Proxy::all(url.as_str())
                    .map_err(|e| RelayError::Config(format!("invalid proxy {}: {}", proxies, e)))?;
                builder = builder.proxy(proxy);
            }
            other => {
                return Err(RelayError::Config(format!(
                    "unsupported proxy scheme: {}",
                    other
                )))
            }
        }
    }
    builder
        .build()
        .map_err(|e| RelayError::Config(format!("build http client failed: {}", e)))
}

/**
 * \brief 历史（新到旧）+ 当前输入 → 上游消息列表（旧到新）。
 */
pub fn build_messages(histories: &[HistoryEntry], content: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(histories.len() * 2 + 1);
    for entry in histories.iter().rev() {
        messages.push(ChatMessage::user(entry.user_content.clone()));
        messages.push(ChatMessage::assistant(entry.assistant_content.clone()));
    }
    messages.push(ChatMessage::user(content));
    messages
}

/**
 * \brief 发起流式补全请求，成功后把响应体交给 SSE 解码任务。
 * \param timeout 拿到响应头的时限；之后的流式读取不计时
 * \return 单次请求专用的增量通道；非 200 状态直接返回传输错误。
 */
pub async fn start_chat_stream(
    client: &Client,
    base_url: &str,
    api_key: &str,
    request: &ChatRequest,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<UnboundedReceiver<StreamDelta>, RelayError> {
    let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
    debug!(%url, model = %request.model, messages = request.messages.len(), "chat request");

    let builder = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .json(request);
    let resp = send_within(builder, timeout).await?;

    if resp.status() != StatusCode::OK {
        return Err(status_error(resp).await);
    }
    Ok(sse::decode(resp.bytes_stream(), cancel))
}

/**
 * \brief 调用绘画接口并下载第一张图片。
 * \param timeout 两次请求各自的整体时限（含响应体）
 */
pub async fn generate_image(
    client: &Client,
    paint_url: &str,
    paint_key: &str,
    request: &ImageRequest,
    timeout: Duration,
) -> Result<Vec<u8>, RelayError> {
    let url = format!("{}/v1/images/generations", paint_url.trim_end_matches('/'));
    debug!(%url, model = %request.model, "image request");

    let resp = client
        .post(url)
        .timeout(timeout)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", paint_key))
        .json(request)
        .send()
        .await?;
    if resp.status() != StatusCode::OK {
        return Err(status_error(resp).await);
    }

    let status = resp.status();
    let body: Value = resp
        .json()
        .await
        .map_err(|e| RelayError::Image(format!("{}: {}", status, e)))?;
    let image_url = extract_image_url(&body)?;

    let resp = client.get(image_url).timeout(timeout).send().await?;
    if resp.status() != StatusCode::OK {
        return Err(status_error(resp).await);
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| RelayError::Image(format!("下载图片失败 > {}", e)))?;
    Ok(bytes.to_vec())
}

fn extract_image_url(body: &Value) -> Result<String, RelayError> {
    if let Some(err) = body.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(RelayError::Image(message));
    }
    body.get("data")
        .and_then(|d| d.get(0))
        .and_then(|d| d.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RelayError::Image("请求失败".to_string()))
}

/// Bounds only the wait for response headers.
async fn send_within(builder: RequestBuilder, timeout: Duration) -> Result<Response, RelayError> {
    match tokio::time::timeout(timeout, builder.send()).await {
        Ok(resp) => Ok(resp?),
        Err(_) => Err(RelayError::Transport(format!(
            "request timed out after {:?}",
            timeout
        ))),
    }
}

async fn status_error(resp: Response) -> RelayError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    RelayError::Status { status, body }
}
