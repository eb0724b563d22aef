use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::{self, SegmentOptions};
use crate::db::RelayStore;
use crate::dice::{should_auto_reply, Dice, StdDice};
use crate::error::RelayError;
use crate::llm::{self, ChatRequest, ImageRequest, PAINT_MODELS};
use crate::memory::MemoryCache;
use crate::models::{
    CachedMessage, ConversationKey, Credential, HistoryEntry, InboundMessage, RelayConfig,
};
use crate::rate::RateGate;
use crate::sink::OutputSink;

pub const RESET_REPLY: &str = "已清除上下文！";
pub const THROTTLED_NOTICE: &str = "已限流，请稍后再试...";
pub const PENDING_NOTICE: &str = "正在响应...";

const RESET_KEYWORDS: [&str; 3] = ["reset", "重置记忆", "消除记忆"];
const REACTIONS: [&str; 6] = ["😀", "😂", "🙃", "🥲", "🤔", "🤨"];

static VERIFY_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+ \d+ \d+").expect("noise pattern is valid"));
static CHAT_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^/chat\s+(\S+)\s*(.*)$").expect("chat pattern is valid"));

/** \brief 为每个请求创建独立随机源 */
pub type DiceFactory = Arc<dyn Fn() -> Box<dyn Dice> + Send + Sync>;

/**
 * \brief 中继运行参数。
 */
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /** \brief 同一会话的最小请求间隔 */
    pub interval: Duration,
    /** \brief 上游限流后的全局冷却 */
    pub cooldown: Duration,
    pub memory_capacity: usize,
    pub memory_window: Duration,
    /** \brief 艾特/自由发言读取的历史轮数 */
    pub history_limit: usize,
    /** \brief /chat 读取的历史轮数 */
    pub chat_history_limit: usize,
    pub request_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    /** \brief 分段断句符号（按优先级） */
    pub boundaries: Vec<String>,
    /** \brief 断句时不随当前片段发出、留给下一片段开头的符号 */
    pub non_consuming: Vec<String>,
    /** \brief 机器人昵称；设置后模仿模式下当前消息带 `@昵称 ` 前缀 */
    pub bot_nickname: Option<String>,
    /** \brief 昵称包含这些标记的发言者被忽略 */
    pub ignored_names: Vec<String>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        let symbols = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            interval: Duration::from_secs(3),
            cooldown: Duration::from_secs(60),
            memory_capacity: 10,
            memory_window: Duration::from_secs(10 * 60),
            history_limit: 50,
            chat_history_limit: 100,
            request_timeout: Duration::from_secs(180),
            max_tokens: 2048,
            temperature: 0.8,
            boundaries: symbols(&["!", ".", "?", "！", "。", "？", "\n\n"]),
            non_consuming: symbols(&[".", "。", "\n\n"]),
            bot_nickname: None,
            ignored_names: symbols(&["Q群管家"]),
        }
    }
}

/**
 * \brief 单条入站消息的处理结果，供调用方记录或测试断言。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /** \brief 不满足触发条件，未做任何事 */
    Ignored,
    /** \brief 仅记入近期消息缓存 */
    Observed,
    /** \brief 空消息，回了一个表情 */
    Reacted,
    Reset,
    Throttled,
    Replied(String),
    Painted,
    Failed(String),
}

/**
 * \brief 入站文本去噪：单独的“是”和验证码样式的数字串视为空。
 */
pub fn plain_text(raw: &str) -> &str {
    if raw == "是" || VERIFY_NOISE.is_match(raw) {
        ""
    } else {
        raw
    }
}

/**
 * \brief 解析 `/chat <key> <message>`。
 */
pub fn parse_chat_command(text: &str) -> Option<(String, String)> {
    let caps = CHAT_COMMAND.captures(text.trim())?;
    Some((caps[1].to_string(), caps[2].trim().to_string()))
}

/**
 * \brief 识别绘画前缀（`画` 或 `/paint`），返回提示词。
 */
pub fn paint_prompt(text: &str) -> Option<&str> {
    let text = text.trim();
    text.strip_prefix("/paint")
        .or_else(|| text.strip_prefix('画'))
        .map(str::trim)
}

fn is_reset(text: &str) -> bool {
    RESET_KEYWORDS.contains(&text)
}

struct Turn<'a> {
    event: &'a InboundMessage,
    key: ConversationKey,
    config: &'a RelayConfig,
    credential: Credential,
    histories: Vec<HistoryEntry>,
    content: String,
    explicit: bool,
    clears_memory: bool,
}

/**
 * \brief 中继核心：持有闸门、近期消息缓存与存储，串起各条消息处理流程。
 */
pub struct Relay {
    store: Arc<dyn RelayStore>,
    gate: RateGate,
    memory: MemoryCache,
    options: RelayOptions,
    dice: DiceFactory,
}

impl Relay {
    pub fn new(store: Arc<dyn RelayStore>, options: RelayOptions) -> Self {
        Self {
            store,
            gate: RateGate::new(options.interval, options.cooldown),
            memory: MemoryCache::new(options.memory_capacity, options.memory_window),
            options,
            dice: Arc::new(|| Box::new(StdDice::from_entropy()) as Box<dyn Dice>),
        }
    }

    /**
     * \brief 替换随机源工厂（测试时注入固定序列）。
     */
    pub fn with_dice(mut self, dice: DiceFactory) -> Self {
        self.dice = dice;
        self
    }

    pub fn gate(&self) -> &RateGate {
        &self.gate
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn store(&self) -> &Arc<dyn RelayStore> {
        &self.store
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    fn is_ignored(&self, nickname: &str) -> bool {
        self.options
            .ignored_names
            .iter()
            .any(|marker| !marker.is_empty() && nickname.contains(marker.as_str()))
    }

    /**
     * \brief 入站消息总入口：/chat 命令、绘画、艾特、自由发言依次匹配。
     */
    pub async fn dispatch(&self, event: &InboundMessage, sink: &dyn OutputSink) -> Outcome {
        if let Some((name, text)) = parse_chat_command(&event.text) {
            return self.handle_chat(event, &name, &text, sink).await;
        }
        if event.to_me {
            if let Some(prompt) = paint_prompt(&event.text) {
                return self.paint(event, prompt, sink).await;
            }
            return self.handle_mention(event, sink).await;
        }
        self.observe_ambient(event, sink).await
    }

    /**
     * \brief 艾特机器人（或私聊）时使用默认凭证回复。
     */
    pub async fn handle_mention(&self, event: &InboundMessage, sink: &dyn OutputSink) -> Outcome {
        if self.is_ignored(&event.nickname) {
            return Outcome::Ignored;
        }
        let key = event.conversation_key();
        let config = match self.store.config() {
            Ok(config) => config,
            Err(e) => return self.surface(sink, RelayError::from(e)),
        };

        let text = plain_text(&event.text).trim();
        if text.is_empty() {
            return self.react(sink);
        }

        if is_reset(text) {
            self.memory.clear(key);
            return self.reset(key, &config.default_key, sink);
        }

        if !self.admit_explicit(event, sink) {
            return Outcome::Throttled;
        }

        let histories = match self
            .store
            .find_history(key, &config.default_key, self.options.history_limit)
        {
            Ok(histories) => histories,
            Err(e) => return self.surface(sink, RelayError::from(e)),
        };
        let credential = match self.credential(&config.default_key) {
            Ok(credential) => credential,
            Err(e) => return self.surface(sink, e),
        };

        let content = if config.imitate {
            let current = match &self.options.bot_nickname {
                Some(bot) => format!("@{} {}", bot, text),
                None => text.to_string(),
            };
            let mut parts = self.memory.render_recent(key);
            parts.push(CachedMessage::now(event.user_id, event.nickname.clone(), current).to_string());
            parts.join("\n\n")
        } else {
            text.to_string()
        };

        let turn = Turn {
            event,
            key,
            config: &config,
            credential,
            histories,
            content,
            explicit: true,
            clears_memory: true,
        };
        match self.complete(turn, sink).await {
            Ok(reply) => Outcome::Replied(reply),
            Err(e) => self.surface(sink, e),
        }
    }

    /**
     * \brief `/chat <key> <message>`：使用指定凭证及其独立历史对话。
     */
    pub async fn handle_chat(
        &self,
        event: &InboundMessage,
        name: &str,
        text: &str,
        sink: &dyn OutputSink,
    ) -> Outcome {
        if self.is_ignored(&event.nickname) {
            return Outcome::Ignored;
        }
        let key = event.conversation_key();
        let text = text.trim();
        if text.is_empty() {
            return self.react(sink);
        }
        if is_reset(text) {
            return self.reset(key, name, sink);
        }

        if !self.admit_explicit(event, sink) {
            return Outcome::Throttled;
        }

        let config = match self.store.config() {
            Ok(config) => config,
            Err(e) => return self.surface(sink, RelayError::from(e)),
        };
        let histories = match self
            .store
            .find_history(key, name, self.options.chat_history_limit)
        {
            Ok(histories) => histories,
            Err(e) => return self.surface(sink, RelayError::from(e)),
        };
        let credential = match self.credential(name) {
            Ok(credential) => credential,
            Err(e) => return self.surface(sink, e),
        };

        let turn = Turn {
            event,
            key,
            config: &config,
            credential,
            histories,
            content: text.to_string(),
            explicit: true,
            clears_memory: false,
        };
        match self.complete(turn, sink).await {
            Ok(reply) => Outcome::Replied(reply),
            Err(e) => self.surface(sink, e),
        }
    }

    /**
     * \brief 旁听群消息：记入缓存，按频率抽样决定是否自由发言。
     * \details 这条路径上的任何错误只记日志，不打扰群聊。
     */
    pub async fn observe_ambient(&self, event: &InboundMessage, sink: &dyn OutputSink) -> Outcome {
        if event.to_me || self.is_ignored(&event.nickname) {
            return Outcome::Ignored;
        }
        let config = match self.store.config() {
            Ok(config) if config.imitate => config,
            Ok(_) => return Outcome::Ignored,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "load config failed");
                return Outcome::Failed(e.to_string());
            }
        };
        let credential = match self.store.key(&config.default_key) {
            Ok(Some(credential)) => credential,
            Ok(None) => return Outcome::Ignored,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "load default key failed");
                return Outcome::Failed(e.to_string());
            }
        };

        let text = plain_text(&event.text);
        if text.is_empty() {
            return Outcome::Ignored;
        }
        let key = event.conversation_key();
        self.memory.observe(
            key,
            CachedMessage::now(event.user_id, event.nickname.clone(), text),
        );

        if !self.gate.admit(key) {
            return Outcome::Throttled;
        }

        let draw = (self.dice)().roll(100);
        if !should_auto_reply(config.freq, draw) {
            return Outcome::Observed;
        }

        let histories =
            match self
                .store
                .find_history(key, &credential.name, self.options.history_limit)
            {
                Ok(histories) => histories,
                Err(e) => {
                    error!(key, error = %format!("{:#}", e), "load histories failed");
                    return Outcome::Failed(e.to_string());
                }
            };

        let parts = self.memory.render_recent(key);
        if parts.is_empty() {
            return Outcome::Observed;
        }
        info!(key, draw, freq = config.freq, "ambient reply triggered");

        let turn = Turn {
            event,
            key,
            config: &config,
            credential,
            histories,
            content: parts.join("\n\n"),
            explicit: false,
            clears_memory: true,
        };
        match self.complete(turn, sink).await {
            Ok(reply) => Outcome::Replied(reply),
            Err(e) => {
                warn!(key, error = %e, "ambient reply failed");
                Outcome::Failed(e.to_string())
            }
        }
    }

    /**
     * \brief 绘画：调用图片接口，把图片引用回复给触发消息。
     */
    pub async fn paint(&self, event: &InboundMessage, prompt: &str, sink: &dyn OutputSink) -> Outcome {
        let config = match self.store.config() {
            Ok(config) => config,
            Err(e) => return self.surface(sink, RelayError::from(e)),
        };
        if config.paint_key.is_empty() {
            return self.surface(sink, RelayError::Config("绘画key为空".to_string()));
        }

        let pick = (self.dice)().roll(PAINT_MODELS.len() as u32) as usize;
        let request = ImageRequest::new(PAINT_MODELS[pick], prompt);
        let generated = async {
            let client = llm::build_client(&config.proxies, self.options.request_timeout)?;
            llm::generate_image(
                &client,
                &config.paint_url,
                &config.paint_key,
                &request,
                self.options.request_timeout,
            )
            .await
        }
        .await;

        match generated {
            Ok(bytes) => {
                info!(model = %request.model, size = bytes.len(), "image generated");
                sink.send_image(Some(event.message_id), &bytes);
                Outcome::Painted
            }
            Err(e) => {
                self.gate.observe_failure(&e);
                self.surface(sink, e)
            }
        }
    }

    fn react(&self, sink: &dyn OutputSink) -> Outcome {
        let pick = (self.dice)().roll(REACTIONS.len() as u32) as usize;
        sink.send_text(REACTIONS[pick]);
        Outcome::Reacted
    }

    fn reset(&self, key: ConversationKey, name: &str, sink: &dyn OutputSink) -> Outcome {
        match self.store.clean_histories(key, name) {
            Ok(()) => {
                info!(key, credential = name, "conversation reset");
                sink.send_text(RESET_REPLY);
                Outcome::Reset
            }
            Err(e) => self.surface(sink, RelayError::from(e)),
        }
    }

    /// Cooldown rejections get a visible notice; per-conversation debounce is silent.
    fn admit_explicit(&self, event: &InboundMessage, sink: &dyn OutputSink) -> bool {
        if self.gate.cooling_down() {
            warn!(key = event.conversation_key(), "request throttled");
            sink.send_text_replying_to(event.message_id, THROTTLED_NOTICE);
            return false;
        }
        self.gate.admit(event.conversation_key())
    }

    fn credential(&self, name: &str) -> Result<Credential, RelayError> {
        self.store
            .key(name)?
            .ok_or_else(|| RelayError::KeyNotFound(name.to_string()))
    }

    fn surface(&self, sink: &dyn OutputSink, err: RelayError) -> Outcome {
        error!(error = %err, "request failed");
        sink.send_text(&format!("ERROR: {}", err));
        Outcome::Failed(err.to_string())
    }

    /**
     * \brief 发起补全并按模式投递，成功后写入历史。
     * \details 默认凭证且开启模仿时走分段模式，否则一次性回复。
     */
    async fn complete(&self, turn: Turn<'_>, sink: &dyn OutputSink) -> Result<String, RelayError> {
        let Turn {
            event,
            key,
            config,
            credential,
            histories,
            content,
            explicit,
            clears_memory,
        } = turn;
        let imitate = config.imitate && config.default_key == credential.name;

        let client = llm::build_client(&config.proxies, self.options.request_timeout)?;
        let request = ChatRequest {
            model: config.model.clone(),
            messages: llm::build_messages(&histories, &content),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
            stream: true,
        };

        // 请求结束或被丢弃时一并停止解码任务
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let rx = match llm::start_chat_stream(
            &client,
            &config.base_url,
            &credential.content,
            &request,
            self.options.request_timeout,
            cancel,
        )
        .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.gate.observe_failure(&e);
                return Err(e);
            }
        };

        let reply = if imitate {
            let mut dice = (self.dice)();
            let options = SegmentOptions {
                boundaries: &self.options.boundaries,
                non_consuming: &self.options.non_consuming,
                reply_to: event.reply_target().filter(|_| event.to_me),
            };
            aggregate::segment(rx, options, sink, dice.as_mut()).await?
        } else {
            let reply_to = event.reply_target();
            let pending = sink.send_maybe_replying(reply_to, PENDING_NOTICE);
            let collected = aggregate::collect(rx).await;
            if let Some(id) = pending {
                sink.delete_message(id);
            }
            let reply = collected?;
            sink.send_maybe_replying(reply_to, &reply);
            reply
        };

        if clears_memory {
            self.memory.clear(key);
        }

        let entry = HistoryEntry {
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            uid: key,
            name: credential.name.clone(),
            user_content: content,
            assistant_content: reply.clone(),
        };
        if let Err(e) = self.store.save_history(&entry) {
            error!(key, credential = %credential.name, error = %format!("{:#}", e), "save history failed");
            if explicit {
                sink.send_text(&format!("ERROR: {}", RelayError::from(e)));
            }
        }
        Ok(reply)
    }
}
