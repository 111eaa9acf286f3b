//! 可观测性
//!
//! 日志默认 info，可通过 RUST_LOG 覆盖（如 `RUST_LOG=dtt=debug`）。
//! 输出写到 stderr，stdout 留给控制台对话。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
