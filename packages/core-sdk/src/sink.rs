use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::MessageId;

/**
 * \brief 输出端：把文本或图片投递给终端用户。
 * \details 投递尽力而为，失败不回传给中继核心。
 */
pub trait OutputSink: Send + Sync {
    fn send_text(&self, text: &str) -> Option<MessageId>;
    fn send_text_replying_to(&self, message_id: MessageId, text: &str) -> Option<MessageId>;
    fn send_image(&self, reply_to: Option<MessageId>, bytes: &[u8]);
    /** \brief 撤回一条已发送的消息（例如“正在响应...”提示）。 */
    fn delete_message(&self, _message_id: MessageId) {}

    /**
     * \brief 有引用目标时带引用发送，否则直接发送。
     */
    fn send_maybe_replying(&self, reply_to: Option<MessageId>, text: &str) -> Option<MessageId> {
        match reply_to {
            Some(id) => self.send_text_replying_to(id, text),
            None => self.send_text(text),
        }
    }
}

/**
 * \brief 推送到通道的输出事件，HTTP 层据此生成 SSE。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkEvent {
    Text {
        id: MessageId,
        text: String,
    },
    Reply {
        id: MessageId,
        reply_to: MessageId,
        text: String,
    },
    Image {
        reply_to: Option<MessageId>,
        #[serde(skip)]
        bytes: Vec<u8>,
    },
    Delete {
        id: MessageId,
    },
}

/**
 * \brief 把输出写入无界通道的 Sink，自行分配递增消息编号。
 */
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
    next_id: AtomicI64,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_id: AtomicI64::new(1),
            },
            rx,
        )
    }

    fn allocate(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl OutputSink for ChannelSink {
    fn send_text(&self, text: &str) -> Option<MessageId> {
        let id = self.allocate();
        self.tx
            .send(SinkEvent::Text {
                id,
                text: text.to_string(),
            })
            .ok()
            .map(|_| id)
    }

    fn send_text_replying_to(&self, message_id: MessageId, text: &str) -> Option<MessageId> {
        let id = self.allocate();
        self.tx
            .send(SinkEvent::Reply {
                id,
                reply_to: message_id,
                text: text.to_string(),
            })
            .ok()
            .map(|_| id)
    }

    fn send_image(&self, reply_to: Option<MessageId>, bytes: &[u8]) {
        let _ = self.tx.send(SinkEvent::Image {
            reply_to,
            bytes: bytes.to_vec(),
        });
    }

    fn delete_message(&self, message_id: MessageId) {
        let _ = self.tx.send(SinkEvent::Delete { id: message_id });
    }
}

#[cfg(test)]
pub(crate) fn drain_events(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
