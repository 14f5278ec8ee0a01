use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct AnimationConfig {
    #[serde(default)]
    pub use_worker: bool,
    #[serde(default = "AnimationConfig::default_worker_queue_depth")]
    pub worker_queue_depth: usize,
    #[serde(default = "AnimationConfig::default_worker_thread_name")]
    pub worker_thread_name: String,
    #[serde(default = "AnimationConfig::default_max_bones")]
    pub max_bones: usize,
    #[serde(default = "AnimationConfig::default_log_filter")]
    pub log_filter: String,
}

impl AnimationConfig {
    /// Upper bound on joints per model; matches the shader's bone uniform array.
    pub const MAX_BONES: usize = 256;

    const fn default_worker_queue_depth() -> usize {
        256
    }

    fn default_worker_thread_name() -> String {
        "animation-worker".to_string()
    }

    const fn default_max_bones() -> usize {
        Self::MAX_BONES
    }

    fn default_log_filter() -> String {
        "info".to_string()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse animation config")
    }
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            use_worker: false,
            worker_queue_depth: Self::default_worker_queue_depth(),
            worker_thread_name: Self::default_worker_thread_name(),
            max_bones: Self::default_max_bones(),
            log_filter: Self::default_log_filter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_uses_defaults() {
        let cfg = AnimationConfig::from_json_str("{}").expect("parse empty config");
        assert!(!cfg.use_worker);
        assert_eq!(cfg.worker_queue_depth, 256);
        assert_eq!(cfg.max_bones, AnimationConfig::MAX_BONES);
        assert_eq!(cfg.worker_thread_name, "animation-worker");
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn load_reads_overrides_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp config");
        write!(file, r#"{{ "use_worker": true, "max_bones": 64 }}"#).expect("write config");
        let cfg = AnimationConfig::load(file.path()).expect("load config");
        assert!(cfg.use_worker);
        assert_eq!(cfg.max_bones, 64);
        assert_eq!(cfg.worker_queue_depth, 256);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = AnimationConfig::load_or_default("does/not/exist/animation.json");
        assert!(!cfg.use_worker);
        assert_eq!(cfg.max_bones, AnimationConfig::MAX_BONES);
    }
}
