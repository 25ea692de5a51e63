use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// 配置源返回的原始键值
pub type SourceValues = HashMap<String, Value>;

/// 配置源抽象
///
/// 每次调用 `fetch` 都应返回该源当前完整的键值集合。
/// 调用方会用超时包裹 `fetch`，超时或出错只影响当轮刷新。
#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    /// 拉取配置
    async fn fetch(&self) -> Result<SourceValues>;

    /// 配置源名称，用于日志
    fn name(&self) -> &str;

    /// 监听配置变更；不支持监听的源返回 `None`
    async fn watch(&self) -> Result<Option<ConfigWatcher>> {
        Ok(None)
    }
}

/// 配置监听器
pub struct ConfigWatcher {
    rx: mpsc::Receiver<()>,
    // 底层监听器需要和接收端同生命周期
    _guard: Option<Box<dyn Send>>,
}

impl ConfigWatcher {
    pub fn new(rx: mpsc::Receiver<()>) -> Self {
        Self { rx, _guard: None }
    }

    pub fn with_guard(rx: mpsc::Receiver<()>, guard: impl Send + 'static) -> Self {
        Self {
            rx,
            _guard: Some(Box::new(guard)),
        }
    }

    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// 测试用配置源：可注入失败与延迟
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::memory_source::MemoryConfigurationSource;

    #[derive(Clone)]
    pub struct FlakySource {
        pub inner: MemoryConfigurationSource,
        failing: Arc<AtomicBool>,
        delay_ms: Arc<AtomicU64>,
    }

    impl FlakySource {
        pub fn new(name: &str) -> Self {
            Self {
                inner: MemoryConfigurationSource::named(name),
                failing: Arc::new(AtomicBool::new(false)),
                delay_ms: Arc::new(AtomicU64::new(0)),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn set_delay(&self, delay: Duration) {
            self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConfigurationSource for FlakySource {
        async fn fetch(&self) -> Result<SourceValues> {
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("source {} is unavailable", self.inner.name()));
            }
            self.inner.fetch().await
        }

        fn name(&self) -> &str {
            self.inner.name()
        }
    }
}
