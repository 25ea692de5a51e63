use std::time::Duration;
use thiserror::Error;

/// 动态配置统一错误类型
#[derive(Error, Debug)]
pub enum DynConfigError {
    #[error("Property already registered: {0}")]
    DuplicateProperty(String),

    #[error("Can not use a disposed property: {0} (was the store reset?)")]
    Disposed(String),

    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    #[error("A chained property needs at least one property name")]
    EmptyFallbackChain,

    #[error("Property {name} holds a value of another type: {source}")]
    TypeMismatch {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Source {source_name} failed: {reason}")]
    SourceFetch { source_name: String, reason: String },

    #[error("Source {source_name} timed out after {timeout:?}")]
    SourceTimeout {
        source_name: String,
        timeout: Duration,
    },

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, DynConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DynConfigError::DuplicateProperty("timeout".to_string());
        assert_eq!(err.to_string(), "Property already registered: timeout");

        let err = DynConfigError::SourceTimeout {
            source_name: "memory".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn test_type_mismatch_keeps_source() {
        let source = serde_json::from_value::<u32>(serde_json::json!("abc")).unwrap_err();
        let err = DynConfigError::TypeMismatch {
            name: "port".to_string(),
            source,
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
