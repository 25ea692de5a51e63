use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::source::{ConfigurationSource, SourceValues};

/// 内存配置源
///
/// 克隆共享同一份数据，适合测试或由运维接口直接写入。
#[derive(Clone)]
pub struct MemoryConfigurationSource {
    name: String,
    values: Arc<DashMap<String, Value>>,
}

impl MemoryConfigurationSource {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Arc::new(DashMap::new()),
        }
    }

    /// 写入一个值，下一轮刷新生效
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn clear(&self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for MemoryConfigurationSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigurationSource for MemoryConfigurationSource {
    async fn fetch(&self) -> Result<SourceValues> {
        Ok(self
            .values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
