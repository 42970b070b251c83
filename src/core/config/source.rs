use std::sync::{Arc, RwLock};

use crate::core::config::data::GatewayConfig;
use crate::core::sync;

/// Read-only view of the current configuration plus a monotonically
/// increasing version counter. Consumers poll the counter.
pub trait ConfigSource: Send + Sync {
    /// Version and snapshot read together.
    fn current(&self) -> (u64, Arc<GatewayConfig>);

    fn version(&self) -> u64 {
        self.current().0
    }

    fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current().1
    }
}

pub type SharedConfigSource = Arc<dyn ConfigSource>;

struct Versioned {
    version: u64,
    config: Arc<GatewayConfig>,
}

/// In-memory configuration holder; every replacement bumps the version.
pub struct ConfigStore {
    state: RwLock<Versioned>,
}

impl ConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            state: RwLock::new(Versioned {
                version: 1,
                config: Arc::new(config),
            }),
        }
    }

    pub fn shared(config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn replace(&self, config: GatewayConfig) -> u64 {
        let mut state = sync::write(&self.state);
        state.version += 1;
        state.config = Arc::new(config);
        state.version
    }

    /// Applies `mutator` to a copy of the current config and publishes it.
    pub fn update(&self, mutator: impl FnOnce(&mut GatewayConfig)) -> u64 {
        let mut state = sync::write(&self.state);
        let mut working = GatewayConfig::clone(&state.config);
        mutator(&mut working);
        state.version += 1;
        state.config = Arc::new(working);
        state.version
    }
}

impl ConfigSource for ConfigStore {
    fn current(&self) -> (u64, Arc<GatewayConfig>) {
        let state = sync::read(&self.state);
        (state.version, state.config.clone())
    }
}
