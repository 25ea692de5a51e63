use flux_dynconfig::{DynConfigError, DynamicConfiguration, MemoryConfigurationSource};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

// 全局实例在整个测试二进制中共享，所以只保留一个测试
#[tokio::test]
async fn test_global_configuration_lifecycle() {
    let source = MemoryConfigurationSource::new();
    source.set("tenant.default", "acme");

    let report = DynamicConfiguration::init(Some(30), Some(200))
        .add_memory(source.clone())
        .start_polling()
        .await
        .unwrap();
    assert!(report.is_clean());
    assert!(DynamicConfiguration::scheduler().is_running());
    assert_eq!(
        DynamicConfiguration::instance().settings().polling_interval_secs,
        30
    );

    assert_eq!(
        DynamicConfiguration::get_property_value::<String>("tenant.default").as_deref(),
        Some("acme")
    );

    let test = DynamicConfiguration::as_property(10, Some("test")).unwrap();
    assert!(matches!(
        DynamicConfiguration::as_property(11, Some("test")),
        Err(DynConfigError::DuplicateProperty(_))
    ));

    let total = Arc::new(AtomicI64::new(0));
    let sum = total.clone();
    let _subscription = DynamicConfiguration::on_property_changed(
        move |change| {
            if let Some(value) = change.value_as::<i64>() {
                sum.fetch_add(value, Ordering::SeqCst);
            }
        },
        Some("test"),
    )
    .unwrap();
    test.set(15).unwrap();
    test.set(20).unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 45);

    let chained = DynamicConfiguration::as_chained_property(30, "limit", &["limit.shared"]).unwrap();
    assert_eq!(chained.value().unwrap(), 30);
    DynamicConfiguration::get_or_create_property("limit.shared", 20).unwrap();
    assert_eq!(chained.value().unwrap(), 20);

    let updated = DynamicConfiguration::set_or_create_property("limit.shared", 25).unwrap();
    assert_eq!(updated.value().unwrap(), 25);
    assert_eq!(chained.value().unwrap(), 25);

    let shared = DynamicConfiguration::as_shared_property("billing", "tenant.default", "none".to_string())
        .unwrap();
    assert_eq!(shared.value().unwrap(), "acme");

    assert!(DynamicConfiguration::get_property::<i32>("missing").is_none());

    DynamicConfiguration::reset(Some(5), None);

    assert!(!DynamicConfiguration::scheduler().is_running());
    assert!(DynamicConfiguration::instance().is_empty());
    assert_eq!(DynamicConfiguration::instance().source_count(), 0);
    assert_eq!(
        DynamicConfiguration::instance().settings().polling_interval_secs,
        5
    );
    assert!(test.is_disposed());
    assert!(chained.is_disposed());
}
