use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/**
 * \brief 初始化全局日志：控制台 + 按天滚动的 JSON 文件（logs/chatrelay.log.*）。
 * \param log_dir 日志目录；无法创建时只输出到控制台
 * \param level   RUST_LOG 未设置时使用的默认级别
 * \details 重复调用时静默忽略。
 */
pub fn init<P: AsRef<Path>>(log_dir: P, level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("chatrelay.log")
        .build(log_dir.as_ref())
        .map_err(|e| eprintln!("file logging disabled: {}", e))
        .ok()
        .map(|appender| {
            fmt::layer()
                .json()
                .with_writer(appender)
                .with_ansi(false)
        });

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
