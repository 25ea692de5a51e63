use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use crate::error::{DynConfigError, Result};
use crate::notifier::{ChangeNotifier, Subscription};
use crate::property::{ChangeKind, Property, PropertyChange};
use crate::store::StoreShared;

struct ChainState {
    fallback_names: Vec<String>,
    default_value: Value,
    active_name: Option<String>,
    /// 上一次解析得到的值，用于去重通知
    last_value: Option<Value>,
    /// `set` 之后显式值永久优先
    pinned: bool,
    disposed: bool,
}

struct ChainInner {
    store: Weak<StoreShared>,
    epoch: u64,
    primary: String,
    state: Mutex<ChainState>,
    notifier: ChangeNotifier<PropertyChange>,
    subscription: Mutex<Option<Subscription<PropertyChange>>>,
}

impl ChainInner {
    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 存储被重置或销毁后返回 `None`
    fn store(&self) -> Option<Arc<StoreShared>> {
        self.store.upgrade().filter(|store| store.epoch() == self.epoch)
    }

    fn disposed_error(&self) -> DynConfigError {
        DynConfigError::Disposed(self.primary.clone())
    }

    /// 重新选择生效的属性，值变化时返回事件
    fn resolve(&self) -> Option<PropertyChange> {
        let store = self.store()?;
        let mut state = self.lock();
        if state.disposed {
            return None;
        }

        let active = if state.pinned {
            None
        } else {
            state
                .fallback_names
                .iter()
                .find_map(|name| store.lookup(name).map(|cell| (name.clone(), cell)))
        };

        let value = active
            .as_ref()
            .and_then(|(_, cell)| cell.value().ok())
            .unwrap_or_else(|| state.default_value.clone());
        state.active_name = active.map(|(name, _)| name);

        if state.last_value.as_ref() == Some(&value) {
            return None;
        }

        let kind = if state.last_value.is_none() {
            ChangeKind::Created
        } else {
            ChangeKind::Updated
        };
        state.last_value = Some(value.clone());
        Some(PropertyChange::new(self.primary.clone(), value, kind))
    }

    fn refresh(&self) {
        if let Some(change) = self.resolve() {
            debug!("Chained property {} resolved to {}", change.name, change.value);
            self.publish(change);
        }
    }

    /// 依次发布到本属性通道和存储的全局通道
    ///
    /// 其他链式属性收到该事件后重新解析，值未变化时不会再次发布。
    fn publish(&self, change: PropertyChange) {
        self.notifier.emit(change.clone());
        if let Some(store) = self.store() {
            store.global.emit(change);
        }
    }

    fn detach(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }
}

impl Drop for ChainInner {
    fn drop(&mut self) {
        self.detach();
    }
}

/// 链式属性
///
/// 按顺序查找后备属性名，取第一个在注册表中存在的属性的值（无论该值来自
/// 配置源还是属性自身的默认值）；都不存在时使用自身默认值。
/// 只保存属性名，每次解析都重新查表，因此能感知之后才注册的同名属性。
/// 解析结果变化时同时发布到本属性通道和存储的全局通道，但链式属性本身不进入注册表。
///
/// **注意：`set` 是单向操作。** 调用后后备列表被截断为主属性名，显式设置的值
/// 永久优先，之后注册的任何同名属性都不会再生效，且无法恢复原来的后备列表。
pub struct ChainedDynamicProperty<T> {
    inner: Arc<ChainInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ChainedDynamicProperty<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ChainedDynamicProperty<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ChainedDynamicProperty")
            .field("fallback_names", &state.fallback_names)
            .field("active_name", &state.active_name)
            .field("pinned", &state.pinned)
            .finish()
    }
}

impl<T> ChainedDynamicProperty<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new<I, S>(store: &Arc<StoreShared>, names: I, default_value: T) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fallback_names: Vec<String> = names.into_iter().map(Into::into).collect();
        let Some(primary) = fallback_names.first().cloned() else {
            return Err(DynConfigError::EmptyFallbackChain);
        };

        let inner = Arc::new(ChainInner {
            store: Arc::downgrade(store),
            epoch: store.epoch(),
            primary,
            state: Mutex::new(ChainState {
                fallback_names,
                default_value: serde_json::to_value(default_value)?,
                active_name: None,
                last_value: None,
                pinned: false,
                disposed: false,
            }),
            notifier: ChangeNotifier::with_replay(),
            subscription: Mutex::new(None),
        });

        // 任意属性变化都重新解析
        let weak = Arc::downgrade(&inner);
        let subscription = store.global.subscribe(move |_| {
            if let Some(chain) = weak.upgrade() {
                chain.refresh();
            }
        });
        *inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        inner.refresh();

        Ok(Self {
            inner,
            _marker: PhantomData,
        })
    }

    /// 主属性名
    pub fn name(&self) -> &str {
        &self.inner.primary
    }

    pub fn fallback_names(&self) -> Vec<String> {
        self.inner.lock().fallback_names.clone()
    }

    /// 当前生效的属性名，`None` 表示使用默认值
    pub fn active_name(&self) -> Option<String> {
        self.inner.lock().active_name.clone()
    }

    pub fn is_pinned(&self) -> bool {
        self.inner.lock().pinned
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed || self.inner.store().is_none()
    }

    pub fn raw_value(&self) -> Result<Value> {
        let store = self.inner.store().ok_or_else(|| self.inner.disposed_error())?;
        let state = self.inner.lock();
        if state.disposed {
            return Err(self.inner.disposed_error());
        }

        if let Some(cell) = state.active_name.as_deref().and_then(|name| store.lookup(name)) {
            return cell.value();
        }
        Ok(state.default_value.clone())
    }

    pub fn value(&self) -> Result<T> {
        let raw = self.raw_value()?;
        serde_json::from_value(raw).map_err(|source| DynConfigError::TypeMismatch {
            name: self.inner.primary.clone(),
            source,
        })
    }

    /// 设置显式值（单向操作）
    ///
    /// 截断后备列表为主属性名，并使该值永久优先。
    pub fn set(&self, value: T) -> Result<()> {
        let raw = serde_json::to_value(value)?;
        if self.inner.store().is_none() {
            return Err(self.inner.disposed_error());
        }

        {
            let mut state = self.inner.lock();
            if state.disposed {
                return Err(self.inner.disposed_error());
            }
            state.default_value = raw;
            state.fallback_names.truncate(1);
            state.pinned = true;
        }

        self.inner.refresh();
        Ok(())
    }

    /// 释放：发出最后一次通知，关闭通道并停止跟随全局变更
    pub fn dispose(&self) {
        let last = {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.last_value.clone().unwrap_or(Value::Null)
        };

        self.inner.detach();
        self.inner.publish(PropertyChange::new(
            self.inner.primary.clone(),
            last,
            ChangeKind::Disposed,
        ));
        self.inner.notifier.close();
    }

    /// 订阅本链式属性的变更，订阅时立即回放最近一次事件
    pub fn on_changed<F>(&self, handler: F) -> Subscription<PropertyChange>
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(handler)
    }
}

impl<T> Property<T> for ChainedDynamicProperty<T>
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        ChainedDynamicProperty::name(self)
    }

    fn value(&self) -> Result<T> {
        ChainedDynamicProperty::value(self)
    }

    fn set(&self, value: T) -> Result<()> {
        ChainedDynamicProperty::set(self, value)
    }

    fn dispose(&self) {
        ChainedDynamicProperty::dispose(self)
    }

    fn is_disposed(&self) -> bool {
        ChainedDynamicProperty::is_disposed(self)
    }

    fn subscribe(
        &self,
        handler: Box<dyn Fn(&PropertyChange) + Send + Sync>,
    ) -> Subscription<PropertyChange> {
        self.on_changed(handler)
    }
}
