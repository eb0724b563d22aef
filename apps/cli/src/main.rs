use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use chatrelay_core_sdk::db::{self, SqliteStore};
use chatrelay_core_sdk::models::{Credential, InboundMessage, MessageId};
use chatrelay_core_sdk::relay::{Outcome, Relay, RelayOptions};
use chatrelay_core_sdk::server::{self, AppState};
use chatrelay_core_sdk::sink::OutputSink;
use chatrelay_core_sdk::telemetry;

/**
 * \brief CLI 程序入口：配置管理、单次对话与 HTTP 服务。
 */
#[derive(Parser, Debug)]
#[command(name = "chatrelay", version, about = "LLM chat relay")]
struct Cli {
    /** \brief 日志目录 */
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,
    /** \brief RUST_LOG 未设置时的日志级别 */
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 写入请求地址、模型与默认凭证。
     */
    Init {
        #[arg(long, default_value = "https://api.openai.com")]
        base_url: String,
        #[arg(long, default_value = "gpt-4-turbo")]
        model: String,
        /** \brief 默认凭证名称 */
        #[arg(long, default_value = "gpt")]
        key_name: String,
        /** \brief 默认凭证密钥 */
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "")]
        proxies: String,
    },

    /** \brief 查看或修改全局配置 */
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /** \brief 凭证管理 */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief 以艾特机器人的方式发送一条消息，回复打印到终端。
     * \details 指定 --key 时等同于 `/chat <key> <prompt>`。
     */
    Chat {
        #[arg(long)]
        key: Option<String>,
        /** \brief 用户号 */
        #[arg(long, default_value_t = 1)]
        uid: i64,
        /** \brief 群号；不填视为私聊 */
        #[arg(long)]
        group: Option<i64>,
        #[arg(long, default_value = "cli")]
        nickname: String,
        /** \brief 图片保存目录 */
        #[arg(long, default_value = ".")]
        image_dir: PathBuf,
        prompt: String,
    },

    /** \brief 历史记录管理 */
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5180")]
        addr: String,
        /** \brief 机器人昵称，用于模仿模式下的上下文 */
        #[arg(long)]
        bot_nickname: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Set {
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /** \brief 代理，传空串取消 */
        #[arg(long)]
        proxies: Option<String>,
        #[arg(long)]
        default_key: Option<String>,
        #[arg(long)]
        imitate: Option<bool>,
        /** \brief 自由发言频率 0~100 */
        #[arg(long)]
        freq: Option<u8>,
        #[arg(long)]
        paint_url: Option<String>,
        #[arg(long)]
        paint_key: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    Set { name: String, content: String },
    Del { name: String },
    List,
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    /**
     * \brief 清除指定凭证的历史；指定 --uid 时只清该会话。
     */
    Clear {
        name: String,
        #[arg(long)]
        uid: Option<i64>,
    },
}

/**
 * \brief 把中继输出打印到终端的 Sink，图片写入文件。
 */
struct ConsoleSink {
    image_dir: PathBuf,
    next_id: AtomicI64,
}

impl ConsoleSink {
    fn new(image_dir: PathBuf) -> Self {
        Self {
            image_dir,
            next_id: AtomicI64::new(1),
        }
    }

    fn emit(&self, prefix: &str, text: &str) -> Option<MessageId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}{}", prefix, text).ok()?;
        out.flush().ok()?;
        Some(id)
    }
}

impl OutputSink for ConsoleSink {
    fn send_text(&self, text: &str) -> Option<MessageId> {
        self.emit("", text)
    }

    fn send_text_replying_to(&self, message_id: MessageId, text: &str) -> Option<MessageId> {
        self.emit(&format!("[re #{}] ", message_id), text)
    }

    fn send_image(&self, _reply_to: Option<MessageId>, bytes: &[u8]) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = self.image_dir.join(format!("image-{}.png", id));
        match std::fs::write(&path, bytes) {
            Ok(()) => println!("[image saved to {}]", path.display()),
            Err(e) => eprintln!("save image failed: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_dir, &cli.log_level);

    let store = Arc::new(SqliteStore::open_default().context("open database failed")?);

    match cli.command {
        Commands::Init {
            base_url,
            model,
            key_name,
            api_key,
            proxies,
        } => {
            store
                .with_conn(|conn| {
                    let mut config = db::get_config(conn)?;
                    config.base_url = base_url;
                    config.model = model;
                    config.proxies = proxies;
                    config.default_key = key_name.clone();
                    db::update_config(conn, &config)?;
                    db::save_key(
                        conn,
                        &Credential {
                            name: key_name.clone(),
                            content: api_key,
                        },
                    )
                })
                .context("save config failed")?;
            println!("Saved default key {}", key_name);
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = store
                    .with_conn(db::get_config)
                    .context("load config failed")?;
                println!("***  config  ***\n");
                println!("proxies: {}", config.proxies);
                println!("baseUrl: {}", config.base_url);
                println!("model: {}", config.model);
                println!("key: {}", config.default_key);
                println!("imitate: {}", config.imitate);
                println!("freq: {}%", config.freq);
                println!("paintUrl: {}", config.paint_url);
                println!("paintKey: {}", config.paint_key);
            }
            ConfigAction::Set {
                base_url,
                model,
                proxies,
                default_key,
                imitate,
                freq,
                paint_url,
                paint_key,
            } => {
                if freq.is_some_and(|f| f > 100) {
                    bail!("freq must be within 0~100");
                }
                store
                    .with_conn(|conn| {
                        let mut config = db::get_config(conn)?;
                        if let Some(v) = base_url {
                            config.base_url = v;
                        }
                        if let Some(v) = model {
                            config.model = v;
                        }
                        if let Some(v) = proxies {
                            config.proxies = v;
                        }
                        if let Some(v) = default_key {
                            config.default_key = v;
                        }
                        if let Some(v) = imitate {
                            config.imitate = v;
                        }
                        if let Some(v) = freq {
                            config.freq = v;
                        }
                        if let Some(v) = paint_url {
                            config.paint_url = v;
                        }
                        if let Some(v) = paint_key {
                            config.paint_key = v;
                        }
                        db::update_config(conn, &config)
                    })
                    .context("update config failed")?;
                info!("config updated");
                println!("已更新配置。");
            }
        },
        Commands::Key { action } => match action {
            KeyAction::Set { name, content } => {
                store
                    .with_conn(|conn| db::save_key(conn, &Credential { name, content }))
                    .context("save key failed")?;
                println!("添加key成功。");
            }
            KeyAction::Del { name } => {
                store
                    .with_conn(|conn| db::delete_key(conn, &name))
                    .context("delete key failed")?;
                println!("已删除该key。");
            }
            KeyAction::List => {
                let (config, keys) = store
                    .with_conn(|conn| Ok((db::get_config(conn)?, db::list_keys(conn)?)))
                    .context("list keys failed")?;
                let names: Vec<String> = keys
                    .into_iter()
                    .map(|k| k.name)
                    .filter(|name| *name != config.default_key)
                    .collect();
                println!("***  keys  ***\n");
                if names.is_empty() {
                    println!("   ~ none ~");
                }
                for name in names {
                    println!("{}", name);
                }
            }
        },
        Commands::Chat {
            key,
            uid,
            group,
            nickname,
            image_dir,
            prompt,
        } => {
            let relay = Relay::new(store.clone(), RelayOptions::default());
            let sink = ConsoleSink::new(image_dir);
            let event = InboundMessage {
                message_id: 0,
                user_id: uid,
                group_id: group,
                nickname,
                text: prompt.clone(),
                to_me: true,
            };
            let outcome = match key {
                Some(name) => relay.handle_chat(&event, &name, &prompt, &sink).await,
                None => relay.dispatch(&event, &sink).await,
            };
            info!(?outcome, "chat finished");
            if let Outcome::Failed(reason) = outcome {
                bail!("chat failed: {}", reason);
            }
        }
        Commands::History { action } => match action {
            HistoryAction::Clear { name, uid } => {
                let removed = store
                    .with_conn(|conn| match uid {
                        Some(uid) => db::clean_histories(conn, uid, &name),
                        None => db::clean_all_histories(conn, &name),
                    })
                    .context("clean histories failed")?;
                println!("已清理 {} 条记录 ~", removed);
            }
        },
        Commands::Serve { addr, bot_nickname } => {
            let options = RelayOptions {
                bot_nickname,
                ..RelayOptions::default()
            };
            let relay = Arc::new(Relay::new(store.clone(), options));
            server::run(&addr, AppState::new(relay, store)).await?;
        }
    }

    Ok(())
}
