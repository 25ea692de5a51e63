use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::chained::ChainedDynamicProperty;
use crate::error::{DynConfigError, Result};
use crate::notifier::{ChangeNotifier, Subscription};
use crate::property::{DynamicProperty, PropertyCell, PropertyChange};
use crate::settings::PollingSettings;
use crate::source::{ConfigurationSource, SourceValues};

/// 配置源失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Timeout(Duration),
    Error(String),
}

/// 单个配置源在一轮刷新中的失败记录
#[derive(Debug, Clone)]
pub struct SourceFailure {
    /// 注册顺序
    pub index: usize,
    pub source_name: String,
    pub kind: FailureKind,
}

impl From<SourceFailure> for DynConfigError {
    fn from(failure: SourceFailure) -> Self {
        match failure.kind {
            FailureKind::Timeout(timeout) => DynConfigError::SourceTimeout {
                source_name: failure.source_name,
                timeout,
            },
            FailureKind::Error(reason) => DynConfigError::SourceFetch {
                source_name: failure.source_name,
                reason,
            },
        }
    }
}

/// 一轮刷新的结果
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// 有效值发生变化的属性
    pub changed: Vec<String>,
    pub failures: Vec<SourceFailure>,
    pub sources: usize,
    pub elapsed: Duration,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_for(&self, index: usize) -> Option<&SourceFailure> {
        self.failures.iter().find(|f| f.index == index)
    }
}

/// 合并状态，只在刷新锁内访问
#[derive(Default)]
struct MergeState {
    epoch: u64,
    /// 每个配置源最近一次成功拉取的结果，按注册顺序
    contributions: Vec<Option<SourceValues>>,
    /// 上一轮合并结果
    snapshot: HashMap<String, Value>,
}

impl MergeState {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }

    /// 按注册顺序叠加，后注册的配置源优先
    fn merged(&self) -> HashMap<String, Value> {
        let mut merged = HashMap::new();
        for values in self.contributions.iter().flatten() {
            for (key, value) in values {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

pub(crate) struct StoreShared {
    registry: DashMap<String, Arc<PropertyCell>>,
    sources: RwLock<Vec<Arc<dyn ConfigurationSource>>>,
    merge: Mutex<MergeState>,
    settings: RwLock<PollingSettings>,
    pub(crate) global: ChangeNotifier<PropertyChange>,
    epoch: AtomicU64,
}

impl StoreShared {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// 按名称查找未释放的属性
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<PropertyCell>> {
        self.registry
            .get(name)
            .map(|entry| entry.value().clone())
            .filter(|cell| !cell.is_disposed())
    }
}

/// 比较两次合并结果，返回变化的键；`None` 表示键已消失
fn diff_snapshots(
    previous: &HashMap<String, Value>,
    next: &HashMap<String, Value>,
) -> Vec<(String, Option<Value>)> {
    let mut changes: Vec<(String, Option<Value>)> = next
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), Some(value.clone())))
        .collect();

    changes.extend(
        previous
            .keys()
            .filter(|key| !next.contains_key(*key))
            .map(|key| (key.clone(), None)),
    );

    changes.sort_by(|a, b| a.0.cmp(&b.0));
    changes
}

async fn fetch_source(
    source: &dyn ConfigurationSource,
    timeout: Duration,
) -> std::result::Result<SourceValues, FailureKind> {
    match tokio::time::timeout(timeout, source.fetch()).await {
        Ok(Ok(values)) => Ok(values),
        Ok(Err(e)) => Err(FailureKind::Error(e.to_string())),
        Err(_) => Err(FailureKind::Timeout(timeout)),
    }
}

/// 属性存储
///
/// 保存属性注册表与有序的配置源列表，负责合并各配置源的结果并分发变更通知。
/// 克隆共享同一个存储。
#[derive(Clone)]
pub struct PropertyStore {
    shared: Arc<StoreShared>,
}

impl PropertyStore {
    pub fn new(settings: PollingSettings) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                registry: DashMap::new(),
                sources: RwLock::new(Vec::new()),
                merge: Mutex::new(MergeState::default()),
                settings: RwLock::new(settings),
                global: ChangeNotifier::new(),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> PollingSettings {
        *self
            .shared
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn configure(&self, settings: PollingSettings) {
        *self
            .shared
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
        debug!(
            "Polling configured: interval={}s, source timeout={}ms",
            settings.polling_interval_secs, settings.source_timeout_ms
        );
    }

    // ---- 配置源 ----

    /// 追加配置源，返回其注册顺序；越晚注册优先级越高
    pub fn add_source(&self, source: Arc<dyn ConfigurationSource>) -> usize {
        let mut sources = self
            .shared
            .sources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        info!("Registered configuration source: {}", source.name());
        sources.push(source);
        sources.len() - 1
    }

    /// 追加配置源并立即刷新；该配置源拉取失败时返回错误
    pub async fn add_source_and_refresh(
        &self,
        source: Arc<dyn ConfigurationSource>,
    ) -> Result<RefreshReport> {
        let index = self.add_source(source);
        let report = self.refresh().await;
        match report.failure_for(index) {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(report),
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources().len()
    }

    pub(crate) fn sources(&self) -> Vec<Arc<dyn ConfigurationSource>> {
        self.shared
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ---- 刷新 ----

    /// 强制刷新：等待正在进行的刷新结束后执行一轮完整的合并
    ///
    /// 返回时所有变更都已应用并通知完毕。
    pub async fn refresh(&self) -> RefreshReport {
        let merge = self.shared.merge.lock().await;
        self.refresh_locked(merge).await
    }

    /// 已有刷新在进行时直接返回 `None`
    pub async fn try_refresh(&self) -> Option<RefreshReport> {
        let merge = self.shared.merge.try_lock().ok()?;
        Some(self.refresh_locked(merge).await)
    }

    async fn refresh_locked(&self, mut merge: MutexGuard<'_, MergeState>) -> RefreshReport {
        let started = Instant::now();
        let epoch = self.shared.epoch();
        if merge.epoch != epoch {
            *merge = MergeState::new(epoch);
        }

        let sources = self.sources();
        let timeout = self.settings().source_timeout();
        let mut report = RefreshReport {
            sources: sources.len(),
            ..Default::default()
        };

        if merge.contributions.len() < sources.len() {
            merge.contributions.resize(sources.len(), None);
        }

        for (index, source) in sources.iter().enumerate() {
            match fetch_source(source.as_ref(), timeout).await {
                Ok(values) => {
                    merge.contributions[index] = Some(values);
                }
                Err(kind) => {
                    // 保留该配置源上一轮的结果
                    warn!("Configuration source {} failed: {:?}", source.name(), kind);
                    report.failures.push(SourceFailure {
                        index,
                        source_name: source.name().to_string(),
                        kind,
                    });
                }
            }
        }

        if self.shared.epoch() != epoch {
            debug!("Store was reset during refresh, discarding results");
            report.elapsed = started.elapsed();
            return report;
        }

        let merged = merge.merged();
        let mut pending = Vec::new();
        let mut retired = Vec::new();

        for (name, value) in diff_snapshots(&merge.snapshot, &merged) {
            if self.shared.epoch() != epoch {
                break;
            }
            let existing = self.shared.registry.get(&name).map(|e| e.value().clone());
            match (existing, value) {
                (Some(cell), None) => {
                    // 自动注册的属性随键一起消失，其余属性回落到默认值
                    if let Some(change) = cell.retire() {
                        self.shared
                            .registry
                            .remove_if(&name, |_, current| Arc::ptr_eq(current, &cell));
                        debug!("Property removed with its source key: {}", name);
                        retired.push((cell, change));
                    } else if let Some(change) = cell.apply_override(None) {
                        pending.push((cell, change));
                    }
                }
                (Some(cell), value) => {
                    if let Some(change) = cell.apply_override(value) {
                        pending.push((cell, change));
                    }
                }
                (None, Some(value)) => {
                    if let Some(entry) = self.register_from_source(&name, value, epoch) {
                        pending.push(entry);
                    }
                }
                (None, None) => {}
            }
        }

        if self.shared.epoch() != epoch {
            debug!("Store was reset while applying changes, discarding results");
            report.elapsed = started.elapsed();
            return report;
        }

        merge.snapshot = merged;
        drop(merge);

        for (cell, change) in pending {
            report.changed.push(change.name.clone());
            cell.publish(change);
        }
        for (cell, change) in retired {
            report.changed.push(change.name.clone());
            cell.publish_retired(change);
        }

        report.elapsed = started.elapsed();
        debug!(
            "Refresh completed: {} sources, {} changed, {} failed in {:?}",
            report.sources,
            report.changed.len(),
            report.failures.len(),
            report.elapsed
        );
        report
    }

    /// 配置源中新出现的键自动注册为属性，默认值为 null
    ///
    /// 插入后存储已被重置时撤销插入，保证旧配置源的键不会进入新的注册表。
    fn register_from_source(
        &self,
        name: &str,
        value: Value,
        epoch: u64,
    ) -> Option<(Arc<PropertyCell>, PropertyChange)> {
        match self.shared.registry.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                let cell = PropertyCell::from_source(name, value, Some(self.shared.global.clone()));
                entry.insert(cell.clone());
                if self.shared.epoch() != epoch {
                    self.shared
                        .registry
                        .remove_if(name, |_, current| Arc::ptr_eq(current, &cell));
                    cell.detach();
                    return None;
                }
                debug!("Property created from source: {}", name);
                let change = cell.created();
                Some((cell, change))
            }
            Entry::Occupied(entry) => {
                let cell = entry.get().clone();
                drop(entry);
                cell.apply_override(Some(value)).map(|change| (cell, change))
            }
        }
    }

    /// 上一轮合并结果
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.shared.merge.lock().await.snapshot.clone()
    }

    // ---- 属性 ----

    fn get_or_insert(&self, name: &str, default_value: Value) -> (Arc<PropertyCell>, bool) {
        match self.shared.registry.entry(name.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let cell = PropertyCell::new(
                    name,
                    default_value,
                    None,
                    Some(self.shared.global.clone()),
                );
                entry.insert(cell.clone());
                (cell, true)
            }
        }
    }

    fn publish_created(cell: &PropertyCell) {
        debug!("Property registered: {}", cell.name());
        cell.publish(cell.created());
    }

    /// 创建属性；`name` 为 `None` 时创建不注册的匿名属性
    pub fn as_property<T>(&self, value: T, name: Option<&str>) -> Result<DynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let Some(name) = name else {
            return DynamicProperty::anonymous(value);
        };

        let (cell, created) = self.get_or_insert(name, serde_json::to_value(value)?);
        if !created {
            return Err(DynConfigError::DuplicateProperty(name.to_string()));
        }
        Self::publish_created(&cell);
        Ok(DynamicProperty::from_cell(cell))
    }

    pub fn get_property<T>(&self, name: &str) -> Option<DynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.shared
            .registry
            .get(name)
            .map(|entry| DynamicProperty::from_cell(entry.value().clone()))
    }

    /// 读取属性值；属性不存在、已释放或类型不符时返回 `None`
    pub fn get_property_value<T>(&self, name: &str) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.get_property::<T>(name)?.value().ok()
    }

    pub fn get_or_create_property<T>(&self, name: &str, default_value: T) -> Result<DynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let (cell, created) = self.get_or_insert(name, serde_json::to_value(default_value)?);
        if created {
            Self::publish_created(&cell);
        }
        Ok(DynamicProperty::from_cell(cell))
    }

    /// 已存在时更新默认值，否则创建
    pub fn set_or_create_property<T>(&self, name: &str, default_value: T) -> Result<DynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let raw = serde_json::to_value(default_value)?;
        let (cell, created) = self.get_or_insert(name, raw.clone());
        if created {
            Self::publish_created(&cell);
        } else if let Some(change) = cell.set_default(raw)? {
            cell.publish(change);
        }
        Ok(DynamicProperty::from_cell(cell))
    }

    /// 创建链式属性，`names` 的第一个为主属性，其余依次作为后备
    pub fn as_chained_property<T, I, S>(
        &self,
        default_value: T,
        names: I,
    ) -> Result<ChainedDynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ChainedDynamicProperty::new(&self.shared, names, default_value)
    }

    /// 服务级属性：先取 `{service}.{name}`，不存在时取共享的 `name`
    pub fn as_shared_property<T>(
        &self,
        service: &str,
        name: &str,
        default_value: T,
    ) -> Result<ChainedDynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.as_chained_property(
            default_value,
            [format!("{}.{}", service, name), name.to_string()],
        )
    }

    // ---- 订阅 ----

    /// 订阅属性变更；指定 `name` 时只订阅该属性，并立即回放其最近一次事件
    pub fn on_property_changed<F>(
        &self,
        handler: F,
        name: Option<&str>,
    ) -> Result<Subscription<PropertyChange>>
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        match name {
            Some(name) => {
                let cell = self
                    .shared
                    .registry
                    .get(name)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| DynConfigError::PropertyNotFound(name.to_string()))?;
                Ok(cell.subscribe(handler))
            }
            None => Ok(self.shared.global.subscribe(handler)),
        }
    }

    /// 以异步通道的形式订阅全部属性变更
    pub fn subscribe_channel(&self) -> tokio::sync::mpsc::UnboundedReceiver<PropertyChange> {
        self.shared.global.subscribe_channel()
    }

    /// 全局订阅者数量（包含链式属性的内部订阅）
    pub fn subscriber_count(&self) -> usize {
        self.shared.global.subscriber_count()
    }

    // ---- 查询 ----

    pub fn contains(&self, name: &str) -> bool {
        self.shared.registry.contains_key(name)
    }

    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.registry.is_empty()
    }

    // ---- 生命周期 ----

    /// 清空配置源、注册表与合并结果，并释放之前创建的所有属性
    ///
    /// 主要用于测试隔离，不建议在稳定运行时调用。
    pub fn reset(&self, settings: Option<PollingSettings>) {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        self.shared
            .sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let cells: Vec<Arc<PropertyCell>> = self
            .shared
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.shared.registry.clear();
        for cell in cells {
            cell.detach();
        }

        self.shared.global.clear();

        // 刷新进行中时由刷新自己根据 epoch 丢弃旧状态
        if let Ok(mut merge) = self.shared.merge.try_lock() {
            *merge = MergeState::new(epoch);
        }

        if let Some(settings) = settings {
            self.configure(settings);
        }

        info!("Property store reset");
    }
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new(PollingSettings::default())
    }
}
