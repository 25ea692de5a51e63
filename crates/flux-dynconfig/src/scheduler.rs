use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::file_source::FileConfigurationSource;
use crate::memory_source::MemoryConfigurationSource;
use crate::settings::PollingSettings;
use crate::source::ConfigurationSource;
use crate::store::{PropertyStore, RefreshReport};

#[derive(Default)]
struct Tasks {
    timer: Option<JoinHandle<()>>,
    watchers: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }
}

/// 轮询调度器
///
/// 按固定间隔触发存储刷新；上一轮未结束时跳过本次触发，刷新不会重叠。
pub struct PollingScheduler {
    store: PropertyStore,
    tasks: Mutex<Tasks>,
}

impl PollingScheduler {
    pub fn new(store: PropertyStore) -> Self {
        Self {
            store,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    /// 配置轮询间隔与超时
    ///
    /// 应在读取任何属性之前调用一次；轮询运行中重新配置只对下一次 `start` 生效。
    pub fn init(
        &self,
        polling_interval_secs: Option<u64>,
        source_timeout_ms: Option<u64>,
    ) -> SourceBuilder<'_> {
        if self.is_running() {
            warn!("Polling is already running, new interval applies after restart");
        }
        let settings = self
            .store
            .settings()
            .with_overrides(polling_interval_secs, source_timeout_ms);
        self.store.configure(settings);
        SourceBuilder { scheduler: self }
    }

    pub fn is_running(&self) -> bool {
        self.tasks()
            .timer
            .as_ref()
            .map(|timer| !timer.is_finished())
            .unwrap_or(false)
    }

    /// 启动定时轮询，并为支持监听的配置源启动文件监听
    ///
    /// 必须在 tokio 运行时中调用；已在运行时不做任何事。
    pub async fn start(&self) {
        if self.is_running() {
            debug!("Polling already running");
            return;
        }

        let mut watchers = Vec::new();
        for source in self.store.sources() {
            let mut watcher = match source.watch().await {
                Ok(Some(watcher)) => watcher,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to watch source {}: {}", source.name(), e);
                    continue;
                }
            };
            let store = self.store.clone();
            let name = source.name().to_string();
            watchers.push(tokio::spawn(async move {
                while watcher.recv().await.is_some() {
                    debug!("Source {} changed, refreshing", name);
                    store.refresh().await;
                }
                warn!("Watcher for source {} closed", name);
            }));
        }

        let period = self.store.settings().polling_interval();
        let store = self.store.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if store.try_refresh().await.is_none() {
                    warn!("Previous refresh cycle still running, skipping this tick");
                }
            }
        });

        let mut tasks = self.tasks();
        tasks.abort_all();
        tasks.timer = Some(timer);
        tasks.watchers = watchers;

        info!("Started polling every {:?}", period);
    }

    /// 停止定时轮询与文件监听
    pub fn stop(&self) {
        let mut tasks = self.tasks();
        if tasks.timer.is_some() {
            info!("Stopping polling");
        }
        tasks.abort_all();
    }

    /// 立即执行一轮完整刷新，返回时所有变更均已生效
    pub async fn refresh_now(&self) -> RefreshReport {
        self.store.refresh().await
    }

    /// 可选地追加一个配置源，强制刷新，并确保定时轮询已启动
    ///
    /// 传入的配置源拉取失败时返回错误，定时轮询不受影响。
    pub async fn start_polling(
        &self,
        source: Option<Arc<dyn ConfigurationSource>>,
    ) -> Result<RefreshReport> {
        let report = match source {
            Some(source) => self.store.add_source_and_refresh(source).await?,
            None => self.store.refresh().await,
        };
        self.start().await;
        Ok(report)
    }

    /// 停止轮询，清空注册表与配置源，可选地重新配置
    pub fn reset(&self, polling_interval_secs: Option<u64>, source_timeout_ms: Option<u64>) {
        self.stop();
        let settings = self
            .store
            .settings()
            .with_overrides(polling_interval_secs, source_timeout_ms);
        self.store.reset(Some(settings));
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.tasks().abort_all();
    }
}

/// 配置源构建器，由 `init` 返回
pub struct SourceBuilder<'a> {
    scheduler: &'a PollingScheduler,
}

impl<'a> SourceBuilder<'a> {
    pub fn add_source(self, source: Arc<dyn ConfigurationSource>) -> Self {
        self.scheduler.store.add_source(source);
        self
    }

    pub fn add_memory(self, source: MemoryConfigurationSource) -> Self {
        self.add_source(Arc::new(source))
    }

    pub fn add_file(self, path: impl Into<PathBuf>) -> Self {
        self.add_source(Arc::new(FileConfigurationSource::new(path)))
    }

    pub fn settings(&self) -> PollingSettings {
        self.scheduler.store.settings()
    }

    /// 首次刷新后启动定时轮询
    pub async fn start_polling(self) -> Result<RefreshReport> {
        self.scheduler.start_polling(None).await
    }
}
