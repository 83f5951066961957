//! Log options / 日志配置
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable compact lines
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    pub disabled: bool,
    /// EnvFilter directive, e.g. "info" or "sb_core::dns=debug"
    pub level: String,
    pub timestamp: bool,
    pub format: LogFormat,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            disabled: false,
            level: "info".to_string(),
            timestamp: true,
            format: LogFormat::Compact,
        }
    }
}
