//! Named registry of runnable resources.
//!
//! [`ResourceManager`] fans `start`/`stop` out to every registered resource
//! and hands out proxies by name. Proxies are reference counted: when the
//! last consumer of a resource calls [`ResourceManager::unlink`], the
//! resource is paused until new work arrives.

use std::collections::HashMap;
use std::sync::Arc;

use flowpool_core::Config;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::pipeline::DataTransformer;
use crate::proxy::Proxy;
use crate::resource::{RunnableResource, StopReport};

/// Errors from the resource manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Resource already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Resource not found: {name}")]
    NotFound { name: String },
}

/// Registry of resources keyed by name.
#[derive(Debug, Default)]
pub struct ResourceManager {
    resources: RwLock<HashMap<String, RunnableResource>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, resource: RunnableResource) -> Result<(), ManagerError> {
        let name = resource.name().to_string();
        let mut resources = self.resources.write().await;
        if resources.contains_key(&name) {
            return Err(ManagerError::AlreadyRegistered { name });
        }
        debug!(resource = %name, "Registering resource");
        resources.insert(name, resource);
        drop(resources);
        Ok(())
    }

    /// Register several resources; stops at the first duplicate.
    pub async fn register_resources(
        &self,
        resources: impl IntoIterator<Item = RunnableResource>,
    ) -> Result<(), ManagerError> {
        for resource in resources {
            self.register(resource).await?;
        }
        Ok(())
    }

    /// Proxy for the named resource. Counts as one link.
    pub async fn get_resource(&self, name: &str) -> Result<Proxy, ManagerError> {
        self.resource(name)
            .await
            .map(|resource| resource.proxy())
            .ok_or_else(|| ManagerError::NotFound {
                name: name.to_string(),
            })
    }

    /// The registered resource itself, for inspection.
    pub async fn resource(&self, name: &str) -> Option<RunnableResource> {
        self.resources.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.resources.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start every registered resource.
    pub async fn start(&self) {
        let resources = self.snapshot().await;
        info!(count = resources.len(), "Starting resources");
        for resource in resources {
            resource.start().await;
        }
    }

    /// Stop every registered resource, returning each one's stop report.
    pub async fn stop(&self) -> HashMap<String, StopReport> {
        let resources = self.snapshot().await;
        info!(count = resources.len(), "Stopping resources");
        let mut reports = HashMap::new();
        for resource in resources {
            let report = resource.stop().await;
            reports.insert(resource.name().to_string(), report);
        }
        reports
    }

    /// Release one link on the named resource. Unknown names are ignored.
    pub async fn unlink(&self, name: &str) -> Option<StopReport> {
        match self.resource(name).await {
            Some(resource) => resource.unlink().await,
            None => {
                debug!(resource = %name, "Unlink for unknown resource ignored");
                None
            }
        }
    }

    async fn snapshot(&self) -> Vec<RunnableResource> {
        self.resources.read().await.values().cloned().collect()
    }
}

/// Objects shared by the service's pipelines and resources. Built once by
/// the top-level service and passed down explicitly.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<Config>,
    pub manager: Arc<ResourceManager>,
    pub transformer: Arc<DataTransformer>,
}

impl ServiceContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            manager: Arc::new(ResourceManager::new()),
            transformer: Arc::new(DataTransformer::new()),
        }
    }

    #[must_use]
    pub fn with_transformer(mut self, transformer: DataTransformer) -> Self {
        self.transformer = Arc::new(transformer);
        self
    }

    /// Stop every resource. Call once on service shutdown.
    pub async fn shutdown(&self) -> HashMap<String, StopReport> {
        self.manager.stop().await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::launcher::ThreadLauncher;
    use crate::resource::{ResourceSettings, ResourceState};
    use serde_json::json;
    use std::time::Duration;

    fn resource(name: &str, lazy: bool) -> RunnableResource {
        let mut settings = ResourceSettings::new(name, "echo").lazy(lazy);
        settings.poll_interval = Duration::from_millis(10);
        settings.new_msg_check_interval = Duration::from_millis(10);
        RunnableResource::new(
            settings,
            Arc::new(ThreadLauncher::new(HandlerRegistry::builtin())),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let manager = ResourceManager::new();
        manager.register(resource("a", false)).await.unwrap();
        let err = manager.register(resource("a", false)).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRegistered { name } if name == "a"));
    }

    #[tokio::test]
    async fn unknown_resource_is_not_found() {
        let manager = ResourceManager::new();
        let err = manager.get_resource("ghost").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { .. }));
        assert!(manager.unlink("ghost").await.is_none());
    }

    #[tokio::test]
    async fn start_and_stop_fan_out() {
        let manager = ResourceManager::new();
        manager
            .register_resources([resource("eager", false), resource("lazy", true)])
            .await
            .unwrap();
        assert_eq!(manager.names().await, vec!["eager", "lazy"]);

        manager.start().await;
        let eager = manager.resource("eager").await.unwrap();
        let lazy = manager.resource("lazy").await.unwrap();
        assert_eq!(eager.state(), ResourceState::Started);
        assert_eq!(lazy.state(), ResourceState::LazyWaiting);

        let proxy = manager.get_resource("eager").await.unwrap();
        let reply = proxy.request_value(json!({"text": "t"})).await.unwrap();
        assert_eq!(reply["text"], "t");

        let reports = manager.stop().await;
        assert_eq!(reports["eager"].joined_workers, 1);
        assert_eq!(reports["lazy"], StopReport::default());
        assert_eq!(eager.state(), ResourceState::Stopped);
        assert_eq!(lazy.state(), ResourceState::Stopped);
    }

    #[tokio::test]
    async fn links_are_counted_per_get() {
        let manager = ResourceManager::new();
        manager.register(resource("r", false)).await.unwrap();
        manager.start().await;

        let _p1 = manager.get_resource("r").await.unwrap();
        let _p2 = manager.get_resource("r").await.unwrap();
        assert!(manager.unlink("r").await.is_none());
        let report = manager.unlink("r").await.unwrap();
        assert_eq!(report.joined_workers, 1);

        let r = manager.resource("r").await.unwrap();
        assert_eq!(r.state(), ResourceState::LazyWaiting);
        manager.stop().await;
    }
}
