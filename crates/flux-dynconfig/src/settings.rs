use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// 环境变量前缀，例如 `FLUX_DYNCONFIG_POLLING_INTERVAL_SECS=30`
pub const ENV_PREFIX: &str = "FLUX_DYNCONFIG";

/// 轮询配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// 轮询间隔（秒）
    pub polling_interval_secs: u64,
    /// 单个配置源的拉取超时（毫秒）
    pub source_timeout_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            polling_interval_secs: 60,
            source_timeout_ms: 1000,
        }
    }
}

impl PollingSettings {
    pub fn new(polling_interval_secs: u64, source_timeout_ms: u64) -> Self {
        Self {
            polling_interval_secs,
            source_timeout_ms,
        }
    }

    /// 用可选值覆盖当前配置
    pub fn with_overrides(self, polling_interval_secs: Option<u64>, source_timeout_ms: Option<u64>) -> Self {
        Self {
            polling_interval_secs: polling_interval_secs.unwrap_or(self.polling_interval_secs),
            source_timeout_ms: source_timeout_ms.unwrap_or(self.source_timeout_ms),
        }
    }

    /// 轮询间隔，最小 1 秒
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs.max(1))
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    /// 从 TOML 文件加载，环境变量优先；文件不存在时使用默认值
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut builder = Config::builder();

        if path.exists() {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
