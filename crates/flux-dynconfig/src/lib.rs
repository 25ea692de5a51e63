// Export modules
pub mod chained;
pub mod configuration;
pub mod error;
pub mod file_source;
pub mod memory_source;
pub mod notifier;
pub mod property;
pub mod scheduler;
pub mod settings;
pub mod source;
pub mod store;

// Re-exports
pub use chained::ChainedDynamicProperty;
pub use configuration::DynamicConfiguration;
pub use error::{DynConfigError, Result};
pub use file_source::FileConfigurationSource;
pub use memory_source::MemoryConfigurationSource;
pub use notifier::{ChangeNotifier, Subscription};
pub use property::{ChangeKind, DynamicProperty, Property, PropertyChange};
pub use scheduler::{PollingScheduler, SourceBuilder};
pub use settings::PollingSettings;
pub use source::{ConfigWatcher, ConfigurationSource, SourceValues};
pub use store::{FailureKind, PropertyStore, RefreshReport, SourceFailure};
