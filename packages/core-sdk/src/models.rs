use std::fmt;

use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};

/** \brief 会话标识：群消息取群号，私聊取用户号。 */
pub type ConversationKey = i64;

/** \brief 平台侧的消息编号。 */
pub type MessageId = i64;

/**
 * \brief 上游凭证：名称 + 密钥内容。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /** \brief 凭证名称（/chat 时指定） */
    pub name: String,
    /** \brief Bearer 密钥 */
    pub content: String,
}

/**
 * \brief 全局中继配置，持久化在 config 表。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /** \brief 请求地址 */
    pub base_url: String,
    /** \brief 默认模型 */
    pub model: String,
    /** \brief 代理（http/https/socks5），空串表示直连 */
    #[serde(default)]
    pub proxies: String,
    /** \brief 默认凭证名称 */
    pub default_key: String,
    /** \brief 是否开启模仿（自由发言）模式 */
    #[serde(default)]
    pub imitate: bool,
    /** \brief 自由发言频率（0~100） */
    #[serde(default)]
    pub freq: u8,
    /** \brief 绘画接口地址 */
    #[serde(default)]
    pub paint_url: String,
    /** \brief 绘画密钥 */
    #[serde(default)]
    pub paint_key: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4-turbo".to_string(),
            proxies: String::new(),
            default_key: "gpt".to_string(),
            imitate: false,
            freq: 0,
            paint_url: String::new(),
            paint_key: String::new(),
        }
    }
}

/**
 * \brief 一轮已完成的对话记录。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /** \brief unix 秒 */
    pub timestamp: i64,
    /** \brief 会话标识 */
    pub uid: ConversationKey,
    /** \brief 凭证名称 */
    pub name: String,
    pub user_content: String,
    pub assistant_content: String,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 平台推送过来的一条入站消息。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub user_id: i64,
    /** \brief 群号；私聊为空 */
    #[serde(default)]
    pub group_id: Option<i64>,
    /** \brief 群名片或昵称 */
    #[serde(default)]
    pub nickname: String,
    /** \brief 已提取的纯文本 */
    #[serde(default)]
    pub text: String,
    /** \brief 是否艾特了机器人（私聊恒为 true） */
    #[serde(default)]
    pub to_me: bool,
}

impl InboundMessage {
    /**
     * \brief 计算会话标识：群号优先，否则用户号。
     */
    pub fn conversation_key(&self) -> ConversationKey {
        match self.group_id {
            Some(gid) if gid > 0 => gid,
            _ => self.user_id,
        }
    }

    pub fn is_private(&self) -> bool {
        !matches!(self.group_id, Some(gid) if gid > 0)
    }

    /**
     * \brief 群聊中需要回复引用的消息编号。
     */
    pub fn reply_target(&self) -> Option<MessageId> {
        if self.is_private() {
            None
        } else {
            Some(self.message_id)
        }
    }
}

/**
 * \brief 模仿模式下缓存的近期群消息。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub timestamp: OffsetDateTime,
    pub uid: i64,
    pub nickname: String,
    pub content: String,
}

impl CachedMessage {
    pub fn now(uid: i64, nickname: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            uid,
            nickname: nickname.into(),
            content: content.into(),
        }
    }
}

impl fmt::Display for CachedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = self
            .timestamp
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(
            f,
            "TIME: {}\nUID: {}\nNAME: \"{}\"\nMESSAGE: \n{}",
            stamp, self.uid, self.nickname, self.content
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn inbound(group_id: Option<i64>) -> InboundMessage {
        InboundMessage {
            message_id: 7,
            user_id: 42,
            group_id,
            nickname: "alice".to_string(),
            text: "hello".to_string(),
            to_me: true,
        }
    }

    #[test]
    fn test_conversation_key_prefers_group() {
        assert_eq!(inbound(Some(1001)).conversation_key(), 1001);
        assert_eq!(inbound(None).conversation_key(), 42);
        assert_eq!(inbound(Some(0)).conversation_key(), 42);
    }

    #[test]
    fn test_reply_target_only_in_groups() {
        assert_eq!(inbound(Some(1001)).reply_target(), Some(7));
        assert_eq!(inbound(None).reply_target(), None);
    }

    #[test]
    fn test_cached_message_display() {
        let msg = CachedMessage {
            timestamp: datetime!(2024-03-01 08:05:09 UTC),
            uid: 42,
            nickname: "alice".to_string(),
            content: "hi all".to_string(),
        };
        assert_eq!(
            msg.to_string(),
            "TIME: 2024-03-01 08:05:09\nUID: 42\nNAME: \"alice\"\nMESSAGE: \nhi all"
        );
    }
}
