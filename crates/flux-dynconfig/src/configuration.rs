use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::chained::ChainedDynamicProperty;
use crate::error::Result;
use crate::notifier::Subscription;
use crate::property::{DynamicProperty, PropertyChange};
use crate::scheduler::{PollingScheduler, SourceBuilder};
use crate::settings::PollingSettings;
use crate::store::PropertyStore;

lazy_static! {
    static ref SCHEDULER: PollingScheduler =
        PollingScheduler::new(PropertyStore::new(PollingSettings::default()));
}

/// 进程级动态配置入口
///
/// 所有函数都作用于同一个全局存储与调度器。需要隔离的场景直接使用
/// [`PropertyStore`] 与 [`PollingScheduler`]。
pub struct DynamicConfiguration;

impl DynamicConfiguration {
    /// 配置轮询间隔（秒）与配置源超时（毫秒），返回配置源构建器
    ///
    /// ```ignore
    /// DynamicConfiguration::init(Some(30), None)
    ///     .add_file("config/properties.toml")
    ///     .start_polling()
    ///     .await?;
    /// ```
    pub fn init(
        polling_interval_secs: Option<u64>,
        source_timeout_ms: Option<u64>,
    ) -> SourceBuilder<'static> {
        SCHEDULER.init(polling_interval_secs, source_timeout_ms)
    }

    pub fn instance() -> &'static PropertyStore {
        SCHEDULER.store()
    }

    pub fn scheduler() -> &'static PollingScheduler {
        &SCHEDULER
    }

    pub fn as_property<T>(value: T, name: Option<&str>) -> Result<DynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        Self::instance().as_property(value, name)
    }

    /// 链式属性：依次尝试 `name` 与 `fallbacks`，都不存在时使用 `default_value`
    pub fn as_chained_property<T>(
        default_value: T,
        name: &str,
        fallbacks: &[&str],
    ) -> Result<ChainedDynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let names = std::iter::once(name).chain(fallbacks.iter().copied());
        Self::instance().as_chained_property(default_value, names)
    }

    pub fn as_shared_property<T>(
        service: &str,
        name: &str,
        default_value: T,
    ) -> Result<ChainedDynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        Self::instance().as_shared_property(service, name, default_value)
    }

    pub fn get_property<T>(name: &str) -> Option<DynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        Self::instance().get_property(name)
    }

    pub fn get_property_value<T>(name: &str) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
    {
        Self::instance().get_property_value(name)
    }

    pub fn get_or_create_property<T>(name: &str, default_value: T) -> Result<DynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        Self::instance().get_or_create_property(name, default_value)
    }

    pub fn set_or_create_property<T>(name: &str, default_value: T) -> Result<DynamicProperty<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        Self::instance().set_or_create_property(name, default_value)
    }

    pub fn on_property_changed<F>(
        handler: F,
        name: Option<&str>,
    ) -> Result<Subscription<PropertyChange>>
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        Self::instance().on_property_changed(handler, name)
    }

    /// 停止轮询并清空全局存储，之前取得的属性全部失效
    pub fn reset(polling_interval_secs: Option<u64>, source_timeout_ms: Option<u64>) {
        SCHEDULER.reset(polling_interval_secs, source_timeout_ms);
    }
}
