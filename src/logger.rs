use tracing_subscriber::EnvFilter;

/// 初始化日志，`RUST_LOG` 未设置时默认 info
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .try_init();
}
