//! Per-consumer tool access policy.
//!
//! The engine compiles the permission section of the gateway config into a
//! [`CompiledPolicy`] and swaps it wholesale whenever the config source's
//! version counter advances, so a lookup only ever reads one complete policy.

pub mod policy;

use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::core::config::SharedConfigSource;
use crate::core::sync;
use crate::core::{GatewayError, GatewayResult};

pub use policy::{CompiledPolicy, ConsumerPolicy, Effect, ServiceRule};

pub struct PermissionEngine {
    source: SharedConfigSource,
    compiled: RwLock<Option<Arc<CompiledPolicy>>>,
    rebuild: Mutex<()>,
}

impl PermissionEngine {
    pub fn new(source: SharedConfigSource) -> Self {
        Self {
            source,
            compiled: RwLock::new(None),
            rebuild: Mutex::new(()),
        }
    }

    /// Compiles the current configuration. Calling it again recompiles.
    pub fn initialize(&self) -> GatewayResult<()> {
        let _guard = sync::lock(&self.rebuild);
        let (version, config) = self.source.current();
        let compiled = CompiledPolicy::compile(version, &config)?;
        info!(
            version,
            consumers = compiled.consumers.len(),
            "Permission policy compiled"
        );
        *sync::write(&self.compiled) = Some(Arc::new(compiled));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        sync::read(&self.compiled).is_some()
    }

    pub fn has_permission(
        &self,
        consumer: Option<&str>,
        service: &str,
        tool: &str,
    ) -> GatewayResult<bool> {
        let policy = self.current_policy()?;
        let allowed = policy.permits(consumer, service, tool);
        debug!(
            consumer = consumer.unwrap_or("-"),
            service, tool, allowed, "Permission check"
        );
        Ok(allowed)
    }

    /// Like [`Self::has_permission`] but a refusal is an error.
    pub fn check(&self, consumer: Option<&str>, service: &str, tool: &str) -> GatewayResult<()> {
        if self.has_permission(consumer, service, tool)? {
            Ok(())
        } else {
            Err(GatewayError::PermissionDenied {
                consumer: consumer.map(str::to_string),
                service: service.to_string(),
                tool: tool.to_string(),
            })
        }
    }

    /// The policy for the latest config version, recompiling first if the
    /// source moved. A failed recompile keeps the previous policy installed
    /// and reports the error.
    pub fn current_policy(&self) -> GatewayResult<Arc<CompiledPolicy>> {
        let installed = self.installed()?;
        let (version, config) = self.source.current();
        if installed.version >= version {
            return Ok(installed);
        }

        let _guard = sync::lock(&self.rebuild);
        let installed = self.installed()?;
        if installed.version >= version {
            return Ok(installed);
        }
        let compiled = CompiledPolicy::compile(version, &config).map_err(|err| {
            warn!(version, error = %err, "Permission policy recompile failed");
            GatewayError::from(err)
        })?;
        let compiled = Arc::new(compiled);
        *sync::write(&self.compiled) = Some(compiled.clone());
        info!(
            from_version = installed.version,
            to_version = version,
            "Permission policy recompiled"
        );
        Ok(compiled)
    }

    fn installed(&self) -> GatewayResult<Arc<CompiledPolicy>> {
        sync::read(&self.compiled)
            .clone()
            .ok_or(GatewayError::NotInitialized {
                component: "permission engine",
            })
    }
}
