use anyhow::{anyhow, Result};
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::source::{ConfigWatcher, ConfigurationSource, SourceValues};

/// 文件配置源
///
/// 每次拉取都重新读取文件。`.json` 按 JSON 解析，其余按 TOML 解析；
/// 嵌套表展开为点分隔的属性名，例如 `[server] port = 80` 对应 `server.port`。
pub struct FileConfigurationSource {
    path: PathBuf,
    name: String,
}

impl FileConfigurationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("file:{}", path.display());
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_json(&self) -> bool {
        self.path.extension().and_then(|s| s.to_str()) == Some("json")
    }

    fn parse(&self, content: &str) -> Result<Value> {
        if self.is_json() {
            Ok(serde_json::from_str(content)?)
        } else {
            // 默认使用 TOML
            let table: toml::Table = toml::from_str(content)?;
            Ok(serde_json::to_value(table)?)
        }
    }
}

/// 把嵌套对象展开成扁平的键值
fn flatten(prefix: Option<&str>, value: Value, out: &mut SourceValues) {
    match value {
        Value::Object(map) => flatten_map(prefix, map, out),
        leaf => {
            if let Some(key) = prefix {
                out.insert(key.to_string(), leaf);
            }
        }
    }
}

fn flatten_map(prefix: Option<&str>, map: Map<String, Value>, out: &mut SourceValues) {
    for (key, value) in map {
        let full = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key,
        };
        flatten(Some(&full), value, out);
    }
}

#[async_trait]
impl ConfigurationSource for FileConfigurationSource {
    async fn fetch(&self) -> Result<SourceValues> {
        debug!("Loading properties from file: {:?}", self.path);

        let content = fs::read_to_string(&self.path).await?;
        let Value::Object(root) = self.parse(&content)? else {
            return Err(anyhow!("Config file {:?} must contain a table", self.path));
        };

        let mut values = SourceValues::new();
        flatten_map(None, root, &mut values);
        Ok(values)
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self) -> Result<Option<ConfigWatcher>> {
        let (tx, rx) = mpsc::channel(10);
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(Event { kind, .. }) => {
                    if matches!(kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        debug!("Config file changed: {:?}", path);
                        // 队列满时丢弃，下一轮刷新会读取最新内容
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => {
                    error!("Watch error: {}", e);
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        debug!("File watcher started for: {:?}", self.path);

        Ok(Some(ConfigWatcher::with_guard(rx, watcher)))
    }
}
