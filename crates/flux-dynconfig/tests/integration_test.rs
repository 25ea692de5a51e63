use flux_dynconfig::{
    ChangeKind, DynConfigError, MemoryConfigurationSource, PollingScheduler, PollingSettings,
    PropertyChange, PropertyStore,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct RetryPolicy {
    attempts: u32,
    backoff_ms: u64,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scheduler() -> PollingScheduler {
    init_tracing();
    PollingScheduler::new(PropertyStore::new(PollingSettings::new(1, 500)))
}

#[tokio::test]
async fn test_file_and_memory_sources_layer_in_order() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("properties.toml");
    std::fs::write(
        &path,
        r#"
[server]
port = 8080
host = "localhost"
"#,
    )
    .unwrap();

    let scheduler = scheduler();
    let overrides = MemoryConfigurationSource::named("overrides");
    let report = assert_ok!(
        scheduler
            .init(None, None)
            .add_file(&path)
            .add_memory(overrides.clone())
            .start_polling()
            .await
    );
    assert!(report.is_clean());
    assert_eq!(report.sources, 2);

    let store = scheduler.store();
    let port = store.get_property::<u16>("server.port").unwrap();
    assert_eq!(port.value().unwrap(), 8080);
    assert_eq!(store.get_property_value::<String>("server.host").as_deref(), Some("localhost"));

    // 后注册的配置源优先
    overrides.set("server.port", 9090);
    scheduler.refresh_now().await;
    assert_eq!(port.value().unwrap(), 9090);

    // 移除后回落到文件中的值
    overrides.remove("server.port");
    scheduler.refresh_now().await;
    assert_eq!(port.value().unwrap(), 8080);

    // 文件内容变化在下一轮刷新生效
    std::fs::write(&path, "[server]\nport = 7070\n").unwrap();
    scheduler.refresh_now().await;
    assert_eq!(port.value().unwrap(), 7070);

    // 配置源自动注册的属性随键一起移除
    assert!(store.get_property::<String>("server.host").is_none());

    scheduler.stop();
}

#[tokio::test]
async fn test_unreadable_file_keeps_previous_values() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("properties.json");
    std::fs::write(&path, r#"{"retries": 3}"#).unwrap();

    let scheduler = scheduler();
    scheduler.init(None, None).add_file(&path);
    scheduler.refresh_now().await;
    assert_eq!(scheduler.store().get_property_value::<u32>("retries"), Some(3));

    std::fs::write(&path, "{ not json").unwrap();
    let report = scheduler.refresh_now().await;

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].source_name.starts_with("file:"));
    assert_eq!(scheduler.store().get_property_value::<u32>("retries"), Some(3));
}

#[tokio::test]
async fn test_structured_values_and_change_stream() {
    let scheduler = scheduler();
    let store = scheduler.store();
    let source = MemoryConfigurationSource::new();
    store.add_source(Arc::new(source.clone()));

    let policy = store
        .as_property(
            RetryPolicy {
                attempts: 1,
                backoff_ms: 100,
            },
            Some("http.retry"),
        )
        .unwrap();

    let mut rx = store.subscribe_channel();

    source.set(
        "http.retry",
        serde_json::json!({ "attempts": 5, "backoff_ms": 250 }),
    );
    let report = scheduler.refresh_now().await;
    assert_eq!(report.changed, vec!["http.retry".to_string()]);

    let change = rx.recv().await.unwrap();
    assert_eq!(change.kind, ChangeKind::Updated);
    assert_eq!(
        change.value_as::<RetryPolicy>(),
        Some(RetryPolicy {
            attempts: 5,
            backoff_ms: 250
        })
    );
    assert_eq!(policy.value().unwrap().attempts, 5);

    // 同值重新写入不产生事件
    source.set(
        "http.retry",
        serde_json::json!({ "backoff_ms": 250, "attempts": 5 }),
    );
    let report = scheduler.refresh_now().await;
    assert!(report.changed.is_empty());
    assert!(rx.try_recv().is_err());

    // 类型不符时返回错误而不是默认值
    let as_number = store.get_property::<u64>("http.retry").unwrap();
    let err = assert_err!(as_number.value());
    assert!(matches!(err, DynConfigError::TypeMismatch { .. }));
}

#[tokio::test]
async fn test_shared_property_follows_sources() {
    let scheduler = scheduler();
    let store = scheduler.store();
    let source = MemoryConfigurationSource::new();
    store.add_source(Arc::new(source.clone()));

    let timeout = store.as_shared_property("billing", "timeout_ms", 1000u64).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    timeout.on_changed(move |change: &PropertyChange| {
        sink.lock().unwrap().push(change.value.clone());
    });

    source.set("timeout_ms", 2000);
    scheduler.refresh_now().await;
    assert_eq!(timeout.value().unwrap(), 2000);
    assert_eq!(timeout.active_name().as_deref(), Some("timeout_ms"));

    source.set("billing.timeout_ms", 3000);
    scheduler.refresh_now().await;
    assert_eq!(timeout.value().unwrap(), 3000);
    assert_eq!(timeout.active_name().as_deref(), Some("billing.timeout_ms"));

    // 服务级的键消失后回落到共享的键
    source.remove("billing.timeout_ms");
    scheduler.refresh_now().await;
    assert_eq!(timeout.value().unwrap(), 2000);
    assert_eq!(timeout.active_name().as_deref(), Some("timeout_ms"));

    let values = seen.lock().unwrap().clone();
    assert_eq!(
        values,
        vec![
            serde_json::json!(1000),
            serde_json::json!(2000),
            serde_json::json!(3000),
            serde_json::json!(2000),
        ]
    );
}

#[tokio::test]
async fn test_reset_invalidates_handles() {
    let scheduler = scheduler();
    let store = scheduler.store();
    let source = MemoryConfigurationSource::new();
    source.set("k", 1);
    store.add_source(Arc::new(source));
    scheduler.refresh_now().await;

    let property = store.get_property::<i32>("k").unwrap();
    let chained = store.as_chained_property(0, ["k"]).unwrap();
    assert_eq!(chained.value().unwrap(), 1);

    scheduler.reset(None, None);

    assert!(property.is_disposed());
    assert!(chained.is_disposed());
    assert!(matches!(property.value(), Err(DynConfigError::Disposed(_))));
    assert!(store.get_property::<i32>("k").is_none());

    // 重置后可以重新注册同名属性
    let fresh = assert_ok!(store.as_property(5, Some("k")));
    assert_eq!(fresh.value().unwrap(), 5);
}
