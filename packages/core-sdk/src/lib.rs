pub mod aggregate;
pub mod db;
pub mod dice;
pub mod emoji;
pub mod error;
pub mod llm;
pub mod memory;
pub mod models;
pub mod rate;
pub mod relay;
pub mod server;
pub mod sink;
pub mod sse;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::db;
    pub use crate::error::{RelayError, StreamError};
    pub use crate::llm;
    pub use crate::models;
    pub use crate::relay::{Relay, RelayOptions};
    pub use crate::server;
    pub use crate::sink::OutputSink;
    pub use crate::telemetry;
}
