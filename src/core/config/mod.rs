pub mod data;
pub mod io;
pub mod orchestrator;
pub mod source;

pub use data::{
    ConnectionConfig, ConsumerConfig, ConsumerPolicyKind, EnvValue, EventStoreConfig,
    GatewayConfig, OAuthConfig, PermissionsConfig, SessionsConfig, TargetServerDescriptor,
    TokenStorage, ToolGroup, ToolSelector, TransportConfig,
};
pub use io::ConfigError;
pub use orchestrator::FileConfigSource;
pub use source::{ConfigSource, ConfigStore, SharedConfigSource};
