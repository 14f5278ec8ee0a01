use crate::config::AnimationConfig;

/// Installs the global logger. `RUST_LOG` wins over the configured filter.
/// Later calls are ignored, so tests and embedders can call this freely.
pub fn init(filter: &str) {
    let env = env_logger::Env::default().default_filter_or(filter.to_string());
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();
}

pub fn init_from_config(config: &AnimationConfig) {
    init(&config.log_filter);
}
