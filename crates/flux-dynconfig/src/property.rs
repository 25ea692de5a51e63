use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{DynConfigError, Result};
use crate::notifier::{ChangeNotifier, Subscription};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// 属性被创建（首次可观察到的值）
    Created,
    /// 有效值发生变化
    Updated,
    /// 属性被释放，之后不会再有事件
    Disposed,
}

/// 属性变更事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyChange {
    pub name: String,
    pub value: Value,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl PropertyChange {
    pub fn new(name: impl Into<String>, value: Value, kind: ChangeKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// 按类型读取事件携带的值
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.value.clone()).ok()
    }
}

/// 属性的统一接口，普通属性和链式属性都实现它
pub trait Property<T>: Send + Sync {
    fn name(&self) -> &str;

    /// 当前有效值
    fn value(&self) -> Result<T>;

    /// 设置默认值
    fn set(&self, value: T) -> Result<()>;

    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    /// 订阅本属性的变更，订阅时立即回放最近一次事件
    fn subscribe(
        &self,
        handler: Box<dyn Fn(&PropertyChange) + Send + Sync>,
    ) -> Subscription<PropertyChange>;
}

#[derive(Debug, Clone)]
struct PropertyState {
    default_value: Value,
    override_value: Option<Value>,
    /// 由配置源自动注册，且从未设置过默认值
    source_only: bool,
    disposed: bool,
}

impl PropertyState {
    fn effective(&self) -> &Value {
        self.override_value.as_ref().unwrap_or(&self.default_value)
    }
}

/// 属性存储单元，按 JSON 值保存，读取时再转换为具体类型
pub(crate) struct PropertyCell {
    name: String,
    state: ArcSwap<PropertyState>,
    // 串行化写入（默认值与来源覆盖值）
    write: Mutex<()>,
    notifier: ChangeNotifier<PropertyChange>,
    global: Option<ChangeNotifier<PropertyChange>>,
}

impl PropertyCell {
    pub(crate) fn new(
        name: impl Into<String>,
        default_value: Value,
        override_value: Option<Value>,
        global: Option<ChangeNotifier<PropertyChange>>,
    ) -> Arc<Self> {
        Self::build(name.into(), default_value, override_value, false, global)
    }

    /// 配置源中新出现的键，默认值为 null
    pub(crate) fn from_source(
        name: impl Into<String>,
        value: Value,
        global: Option<ChangeNotifier<PropertyChange>>,
    ) -> Arc<Self> {
        Self::build(name.into(), Value::Null, Some(value), true, global)
    }

    fn build(
        name: String,
        default_value: Value,
        override_value: Option<Value>,
        source_only: bool,
        global: Option<ChangeNotifier<PropertyChange>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: ArcSwap::from_pointee(PropertyState {
                default_value,
                override_value,
                source_only,
                disposed: false,
            }),
            write: Mutex::new(()),
            notifier: ChangeNotifier::with_replay(),
            global,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.load().disposed
    }

    pub(crate) fn has_override(&self) -> bool {
        self.state.load().override_value.is_some()
    }

    pub(crate) fn value(&self) -> Result<Value> {
        let state = self.state.load();
        if state.disposed {
            return Err(DynConfigError::Disposed(self.name.clone()));
        }
        Ok(state.effective().clone())
    }

    /// 首次创建时的事件
    pub(crate) fn created(&self) -> PropertyChange {
        let state = self.state.load();
        PropertyChange::new(self.name.clone(), state.effective().clone(), ChangeKind::Created)
    }

    /// 更新 `f` 后的状态，有效值变化时返回事件
    fn update<F>(&self, f: F) -> Option<PropertyChange>
    where
        F: FnOnce(&mut PropertyState),
    {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.state.load_full();
        if current.disposed {
            return None;
        }

        let mut next = (*current).clone();
        f(&mut next);
        let changed = next.effective() != current.effective();
        let value = next.effective().clone();
        self.state.store(Arc::new(next));

        changed.then(|| PropertyChange::new(self.name.clone(), value, ChangeKind::Updated))
    }

    pub(crate) fn set_default(&self, value: Value) -> Result<Option<PropertyChange>> {
        if self.is_disposed() {
            return Err(DynConfigError::Disposed(self.name.clone()));
        }
        Ok(self.update(|state| {
            state.default_value = value;
            state.source_only = false;
        }))
    }

    /// 来自配置源的覆盖值，`None` 表示恢复默认值
    pub(crate) fn apply_override(&self, value: Option<Value>) -> Option<PropertyChange> {
        self.update(|state| state.override_value = value)
    }

    /// 标记为已释放，返回最后一次事件；重复释放返回 `None`
    pub(crate) fn mark_disposed(&self) -> Option<PropertyChange> {
        self.mark_disposed_if(|_| true)
    }

    /// 键已从所有配置源消失：仅对自动注册的属性生效
    pub(crate) fn retire(&self) -> Option<PropertyChange> {
        self.mark_disposed_if(|state| state.source_only)
    }

    fn mark_disposed_if<F>(&self, predicate: F) -> Option<PropertyChange>
    where
        F: FnOnce(&PropertyState) -> bool,
    {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.state.load_full();
        if current.disposed || !predicate(&current) {
            return None;
        }

        let mut next = (*current).clone();
        next.disposed = true;
        let value = next.effective().clone();
        self.state.store(Arc::new(next));

        Some(PropertyChange::new(self.name.clone(), value, ChangeKind::Disposed))
    }

    /// 依次发布到本属性通道和全局通道
    pub(crate) fn publish(&self, change: PropertyChange) {
        self.notifier.emit(change.clone());
        if let Some(global) = &self.global {
            global.emit(change);
        }
    }

    pub(crate) fn dispose(&self) {
        if let Some(change) = self.mark_disposed() {
            self.publish(change);
        }
        self.notifier.close();
    }

    /// 发布 `retire` 产生的事件并关闭通道
    pub(crate) fn publish_retired(&self, change: PropertyChange) {
        self.publish(change);
        self.notifier.close();
    }

    /// 不发事件直接释放，用于整体重置
    pub(crate) fn detach(&self) {
        self.mark_disposed();
        self.notifier.close();
    }

    pub(crate) fn subscribe<F>(&self, handler: F) -> Subscription<PropertyChange>
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.notifier.subscribe(handler)
    }
}

/// 动态属性
///
/// 有效值 = 配置源提供的覆盖值，若不存在则为默认值。
/// `set` 只修改默认值，配置源的值始终优先。
pub struct DynamicProperty<T> {
    cell: Arc<PropertyCell>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DynamicProperty<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for DynamicProperty<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicProperty")
            .field("name", &self.cell.name)
            .field("state", &*self.cell.state.load_full())
            .finish()
    }
}

impl<T> DynamicProperty<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn from_cell(cell: Arc<PropertyCell>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// 创建不注册到任何存储的匿名属性
    pub fn anonymous(value: T) -> Result<Self> {
        let cell = PropertyCell::new("", serde_json::to_value(value)?, None, None);
        let created = cell.created();
        cell.publish(created);
        Ok(Self::from_cell(cell))
    }

    pub fn name(&self) -> &str {
        self.cell.name()
    }

    /// 当前有效值，已释放的属性返回错误
    pub fn value(&self) -> Result<T> {
        let raw = self.cell.value()?;
        serde_json::from_value(raw).map_err(|source| DynConfigError::TypeMismatch {
            name: self.cell.name.clone(),
            source,
        })
    }

    /// 未转换的原始值
    pub fn raw_value(&self) -> Result<Value> {
        self.cell.value()
    }

    /// 更新默认值，有效值变化时才会发出通知
    pub fn set(&self, value: T) -> Result<()> {
        let raw = serde_json::to_value(value)?;
        if let Some(change) = self.cell.set_default(raw)? {
            self.cell.publish(change);
        }
        Ok(())
    }

    /// 当前值是否来自配置源
    pub fn has_override(&self) -> bool {
        self.cell.has_override()
    }

    pub fn is_disposed(&self) -> bool {
        self.cell.is_disposed()
    }

    /// 释放属性：发出最后一次通知并关闭通道
    pub fn dispose(&self) {
        self.cell.dispose();
    }

    pub fn on_changed<F>(&self, handler: F) -> Subscription<PropertyChange>
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.cell.subscribe(handler)
    }
}

impl<T> Property<T> for DynamicProperty<T>
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        DynamicProperty::name(self)
    }

    fn value(&self) -> Result<T> {
        DynamicProperty::value(self)
    }

    fn set(&self, value: T) -> Result<()> {
        DynamicProperty::set(self, value)
    }

    fn dispose(&self) {
        DynamicProperty::dispose(self)
    }

    fn is_disposed(&self) -> bool {
        DynamicProperty::is_disposed(self)
    }

    fn subscribe(
        &self,
        handler: Box<dyn Fn(&PropertyChange) + Send + Sync>,
    ) -> Subscription<PropertyChange> {
        self.on_changed(handler)
    }
}
