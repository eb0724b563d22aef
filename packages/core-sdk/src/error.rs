use reqwest::StatusCode;
use thiserror::Error;

/**
 * \brief 流式解码阶段的失败类型，随 `StreamDelta::Error` 传递给消费者。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /** \brief 帧 JSON 无法解析 */
    #[error("parse stream frame failed: {0}")]
    Parse(String),
    /** \brief 上游在流内返回的业务错误，保留原文 */
    #[error("{0}")]
    Upstream(String),
    /** \brief 读取响应体失败 */
    #[error("read stream failed: {0}")]
    Read(String),
    #[error("request cancelled")]
    Cancelled,
}

/**
 * \brief 中继层对外暴露的错误。
 */
#[derive(Debug, Error)]
pub enum RelayError {
    /** \brief 建连失败或超时；文本不含请求地址 */
    #[error("{0}")]
    Transport(String),
    /** \brief 上游返回非 200 状态，body 为响应原文 */
    #[error("request failed: {status} -> {body}")]
    Status { status: StatusCode, body: String },
    #[error(transparent)]
    Stream(#[from] StreamError),
    /** \brief 存储读写失败 */
    #[error("storage: {0}")]
    Persistence(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("config: {0}")]
    Config(String),
    #[error("image: {0}")]
    Image(String),
}

impl RelayError {
    /**
     * \brief 是否属于需要触发全局冷却的限流/坏请求类错误。
     * \details 只看上游状态码（429/400），不匹配错误文本。
     */
    pub fn is_throttling(&self) -> bool {
        match self {
            RelayError::Status { status, .. } => {
                matches!(*status, StatusCode::TOO_MANY_REQUESTS | StatusCode::BAD_REQUEST)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        // 对外文本不带请求地址
        let err = err.without_url();
        match err.status() {
            Some(status) => RelayError::Status {
                status,
                body: err.to_string(),
            },
            None => RelayError::Transport(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Persistence(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: StatusCode, body: &str) -> RelayError {
        RelayError::Status {
            status: code,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_throttling_signatures() {
        assert!(status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_throttling());
        assert!(status(StatusCode::BAD_REQUEST, "").is_throttling());
        assert!(!status(StatusCode::BAD_GATEWAY, "").is_throttling());
        assert!(!RelayError::Transport("request timed out after 400ms".into()).is_throttling());
        assert!(!RelayError::Stream(StreamError::Upstream("429".into())).is_throttling());
    }

    #[test]
    fn test_status_is_classified_by_code_not_body() {
        let err = status(
            StatusCode::INTERNAL_SERVER_ERROR,
            "prompt is longer than 400 tokens (429 max)",
        );
        assert!(!err.is_throttling());
        assert_eq!(
            err.to_string(),
            "request failed: 500 Internal Server Error -> prompt is longer than 400 tokens (429 max)"
        );
    }

    #[test]
    fn test_upstream_error_keeps_message() {
        let err: RelayError = StreamError::Upstream("quota exceeded".into()).into();
        assert_eq!(err.to_string(), "quota exceeded");
    }
}
