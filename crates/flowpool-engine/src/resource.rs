//! Runnable resources: a queue pair plus a lazily started, self-pausing
//! worker pool.
//!
//! A resource owns its two queues for its whole life; only the workers come
//! and go. States:
//!
//! - `Stopped`: no workers, no watchers.
//! - `LazyWaiting`: a watcher polls the inbound queue and starts the workers
//!   on the first message it sees.
//! - `Started`: workers run; a second watcher pauses the resource once no
//!   task has been dispatched for `max_inactivity`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use flowpool_core::Config;
use flowpool_core::config::ResourceDefaults;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::handler::WorkerContext;
use crate::launcher::WorkerLauncher;
use crate::pool::{ActivityClock, RespawnPolicy, WorkerPool};
use crate::proxy::{Proxy, ReplyRouter};
use crate::queue::{ResultMessage, TaskMessage, TaskQueue};

/// Everything needed to run one resource.
#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub name: String,
    /// Name of the handler the workers run.
    pub handler: String,
    pub replicas: usize,
    pub lazy: bool,
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub max_inactivity: Duration,
    pub usage_check_interval: Duration,
    pub new_msg_check_interval: Duration,
    pub async_task_limit: usize,
    pub respawn: RespawnPolicy,
    /// Passed to the handler verbatim in its worker context.
    pub handler_settings: Value,
}

impl ResourceSettings {
    /// One eager replica with the built-in resource defaults.
    pub fn new(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::with_defaults(name, handler, &ResourceDefaults::default())
    }

    fn with_defaults(
        name: impl Into<String>,
        handler: impl Into<String>,
        defaults: &ResourceDefaults,
    ) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            replicas: 1,
            lazy: false,
            queue_capacity: defaults.queue_capacity,
            poll_interval: defaults.poll_interval(),
            max_inactivity: defaults.max_inactivity(),
            usage_check_interval: defaults.usage_check_interval(),
            new_msg_check_interval: defaults.new_msg_check_interval(),
            async_task_limit: defaults.async_task_limit,
            respawn: RespawnPolicy {
                initial_delay: Duration::from_millis(defaults.respawn_initial_delay_ms),
                max_delay: Duration::from_millis(defaults.respawn_max_delay_ms),
                max_attempts: None,
            },
            handler_settings: Value::Null,
        }
    }

    /// Settings for `name` from the loaded configuration: resource defaults
    /// first, then the per-name override if there is one.
    pub fn from_config(name: impl Into<String>, handler: impl Into<String>, config: &Config) -> Self {
        let mut settings = Self::with_defaults(name, handler, &config.resources);
        if let Some(layer) = config.overrides.get(&settings.name) {
            if let Some(replicas) = layer.replicas {
                settings.replicas = replicas;
            }
            if let Some(lazy) = layer.lazy {
                settings.lazy = lazy;
            }
            if let Some(limit) = layer.async_task_limit {
                settings.async_task_limit = limit;
            }
        }
        settings
    }

    #[must_use]
    pub const fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    #[must_use]
    pub const fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    #[must_use]
    pub fn with_handler_settings(mut self, settings: Value) -> Self {
        self.handler_settings = settings;
        self
    }

    /// The serialisable snapshot sent to worker `index`.
    pub fn worker_context(&self, index: usize) -> WorkerContext {
        WorkerContext {
            resource: self.name.clone(),
            handler: self.handler.clone(),
            worker_index: index,
            async_task_limit: self.async_task_limit,
            settings: self.handler_settings.clone(),
        }
    }

    fn validate(&self) -> Result<(), ResourceError> {
        let reason = if self.name.is_empty() {
            "name must not be empty"
        } else if self.handler.is_empty() {
            "handler must not be empty"
        } else if self.replicas == 0 {
            "replicas must be at least 1"
        } else {
            return Ok(());
        };
        Err(ResourceError::InvalidSettings {
            name: self.name.clone(),
            reason: reason.to_string(),
        })
    }
}

/// Errors constructing a resource.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Invalid settings for resource '{name}': {reason}")]
    InvalidSettings { name: String, reason: String },
}

/// A resource's inbound and outbound queues.
#[derive(Debug, Clone)]
pub struct QueuePair {
    pub inbound: TaskQueue<TaskMessage>,
    pub outbound: TaskQueue<ResultMessage>,
}

impl QueuePair {
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            inbound: TaskQueue::new(capacity, poll_interval),
            outbound: TaskQueue::new(capacity, poll_interval),
        }
    }

    /// Whether both handles point at the same underlying queues.
    pub fn same_as(&self, other: &Self) -> bool {
        self.inbound.same_queue(&other.inbound) && self.outbound.same_queue(&other.outbound)
    }
}

/// Lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Stopped,
    LazyWaiting,
    Started,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::LazyWaiting => "lazy-waiting",
            Self::Started => "started",
        })
    }
}

/// What a `stop()` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// STOP messages enqueued (one per worker).
    pub stop_messages: usize,
    /// Worker slots joined.
    pub joined_workers: usize,
}

#[derive(Default)]
struct Lifecycle {
    pool: Option<WorkerPool>,
    /// Set once the lazy watcher has been armed by `start()`.
    lazy_armed: bool,
    lazy_watcher: Option<JoinHandle<()>>,
    idle_watcher: Option<JoinHandle<()>>,
}

struct ResourceInner {
    settings: Arc<ResourceSettings>,
    launcher: Arc<dyn WorkerLauncher>,
    queues: QueuePair,
    clock: ActivityClock,
    router: Arc<ReplyRouter>,
    state: watch::Sender<ResourceState>,
    lifecycle: Mutex<Lifecycle>,
    links: AtomicUsize,
}

/// A named worker pool with a stable queue pair.
#[derive(Clone)]
pub struct RunnableResource {
    inner: Arc<ResourceInner>,
}

impl std::fmt::Debug for RunnableResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableResource")
            .field("name", &self.inner.settings.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RunnableResource {
    pub fn new(
        settings: ResourceSettings,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, ResourceError> {
        settings.validate()?;
        let queues = QueuePair::new(settings.queue_capacity, settings.poll_interval);
        let router = Arc::new(ReplyRouter::new(
            settings.name.clone(),
            queues.outbound.clone(),
        ));
        let (state, _) = watch::channel(ResourceState::Stopped);
        Ok(Self {
            inner: Arc::new(ResourceInner {
                settings: Arc::new(settings),
                launcher,
                queues,
                clock: ActivityClock::new(),
                router,
                state,
                lifecycle: Mutex::new(Lifecycle::default()),
                links: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn settings(&self) -> &ResourceSettings {
        &self.inner.settings
    }

    pub fn queues(&self) -> QueuePair {
        self.inner.queues.clone()
    }

    pub fn state(&self) -> ResourceState {
        *self.inner.state.borrow()
    }

    pub fn started(&self) -> bool {
        self.state() == ResourceState::Started
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ResourceState> {
        self.inner.state.subscribe()
    }

    /// Number of outstanding proxies handed out by [`proxy`](Self::proxy).
    pub fn link_count(&self) -> usize {
        self.inner.links.load(Ordering::SeqCst)
    }

    /// Client handle for this resource. Each call counts as one link that
    /// must later be released with [`unlink`](Self::unlink).
    pub fn proxy(&self) -> Proxy {
        self.inner.links.fetch_add(1, Ordering::SeqCst);
        Proxy::new(
            self.inner.settings.name.clone(),
            self.inner.queues.inbound.clone(),
            Arc::clone(&self.inner.router),
        )
    }

    /// Start the resource. Idempotent: a started resource returns its
    /// queues unchanged. A lazy resource only arms its watcher the first
    /// time; the workers start once a message arrives. Every later start,
    /// including one after `stop()`, spawns the workers right away.
    pub async fn start(&self) -> QueuePair {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.pool.is_some() {
            return self.queues();
        }
        if self.inner.settings.lazy && !lifecycle.lazy_armed {
            lifecycle.lazy_armed = true;
            self.arm_lazy_watcher(&mut lifecycle);
        } else {
            self.spawn_workers(&mut lifecycle);
        }
        drop(lifecycle);
        self.queues()
    }

    /// Stop every worker and return to `Stopped`. A no-op when no workers
    /// are running (a lazy-waiting resource just disarms its watcher).
    pub async fn stop(&self) -> StopReport {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let report = self.stop_locked(&mut lifecycle).await;
        drop(lifecycle);
        report
    }

    /// Stop the workers, then wait lazily for the next message. A no-op on
    /// a stopped resource.
    pub async fn pause(&self) -> StopReport {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let report = self.pause_locked(&mut lifecycle).await;
        drop(lifecycle);
        report
    }

    /// Release one link. When the last link is released the resource is
    /// paused. Returns the pause report in that case.
    pub async fn unlink(&self) -> Option<StopReport> {
        let previous = self
            .inner
            .links
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        if previous == 1 {
            info!(resource = %self.name(), "Last link released, pausing");
            Some(self.pause().await)
        } else {
            None
        }
    }

    fn set_state(&self, state: ResourceState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!(resource = %self.name(), from = %previous, to = %state, "Resource state changed");
        }
    }

    fn spawn_workers(&self, lifecycle: &mut Lifecycle) {
        if let Some(watcher) = lifecycle.lazy_watcher.take() {
            watcher.abort();
        }
        self.inner.clock.touch();
        lifecycle.pool = Some(WorkerPool::spawn(
            &self.inner.settings,
            &self.inner.launcher,
            &self.inner.queues,
            &self.inner.clock,
        ));
        lifecycle.idle_watcher = Some(self.spawn_idle_watcher());
        self.set_state(ResourceState::Started);
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) -> StopReport {
        if let Some(watcher) = lifecycle.lazy_watcher.take() {
            watcher.abort();
        }
        if let Some(watcher) = lifecycle.idle_watcher.take() {
            watcher.abort();
        }
        let Some(pool) = lifecycle.pool.take() else {
            self.set_state(ResourceState::Stopped);
            return StopReport::default();
        };

        let inbound = &self.inner.queues.inbound;
        let replicas = pool.size();
        let guard = inbound.lock_puts().await;
        for _ in 0..replicas {
            guard.put(TaskMessage::stop()).await;
        }
        debug!(resource = %self.name(), replicas, "STOP messages enqueued");
        let joined = pool.join().await;
        drop(guard);

        // Workers that died before taking their STOP leave it behind.
        let purged = inbound.retain(|message| !message.is_stop());
        if purged > 0 {
            warn!(resource = %self.name(), purged, "Purged unconsumed STOP messages");
        }

        self.set_state(ResourceState::Stopped);
        info!(resource = %self.name(), joined, "Resource stopped");
        StopReport {
            stop_messages: replicas,
            joined_workers: joined,
        }
    }

    async fn pause_locked(&self, lifecycle: &mut Lifecycle) -> StopReport {
        if lifecycle.pool.is_none() && lifecycle.lazy_watcher.is_none() {
            return StopReport::default();
        }
        let report = self.stop_locked(lifecycle).await;
        lifecycle.lazy_armed = true;
        self.arm_lazy_watcher(lifecycle);
        report
    }

    fn arm_lazy_watcher(&self, lifecycle: &mut Lifecycle) {
        if let Some(previous) = lifecycle.lazy_watcher.take() {
            previous.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        let inbound = self.inner.queues.inbound.clone();
        let interval = self.inner.settings.new_msg_check_interval;
        lifecycle.lazy_watcher = Some(tokio::spawn(lazy_watch(weak, inbound, interval)));
        self.set_state(ResourceState::LazyWaiting);
    }

    fn spawn_idle_watcher(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let check = self.inner.settings.usage_check_interval;
        let max_inactivity = self.inner.settings.max_inactivity;
        tokio::spawn(idle_watch(weak, check, max_inactivity))
    }
}

async fn lazy_watch(weak: Weak<ResourceInner>, inbound: TaskQueue<TaskMessage>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if inbound.is_empty() {
            continue;
        }
        let Some(inner) = weak.upgrade() else { return };
        let resource = RunnableResource { inner };
        let mut lifecycle = resource.inner.lifecycle.lock().await;
        // Detach our own handle so spawning the workers does not abort us.
        lifecycle.lazy_watcher.take();
        if resource.state() == ResourceState::LazyWaiting {
            info!(resource = %resource.name(), "Message waiting, starting workers");
            resource.spawn_workers(&mut lifecycle);
        }
        return;
    }
}

async fn idle_watch(weak: Weak<ResourceInner>, check: Duration, max_inactivity: Duration) {
    loop {
        tokio::time::sleep(check).await;
        let Some(inner) = weak.upgrade() else { return };
        let idle = inner.clock.idle();
        if idle < max_inactivity {
            continue;
        }
        let resource = RunnableResource { inner };
        let mut lifecycle = resource.inner.lifecycle.lock().await;
        lifecycle.idle_watcher.take();
        if lifecycle.pool.is_some() {
            info!(
                resource = %resource.name(),
                idle_secs = idle.as_secs(),
                "Inactivity threshold reached, pausing"
            );
            resource.pause_locked(&mut lifecycle).await;
        }
        return;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::launcher::ThreadLauncher;
    use flowpool_core::config::ResourceOverride;
    use serde_json::json;

    fn fast(name: &str) -> ResourceSettings {
        let mut settings = ResourceSettings::new(name, "echo");
        settings.poll_interval = Duration::from_millis(10);
        settings.new_msg_check_interval = Duration::from_millis(10);
        settings.usage_check_interval = Duration::from_millis(20);
        settings
    }

    fn resource(settings: ResourceSettings) -> RunnableResource {
        RunnableResource::new(
            settings,
            Arc::new(ThreadLauncher::new(HandlerRegistry::builtin())),
        )
        .unwrap()
    }

    async fn wait_for(rx: &mut watch::Receiver<ResourceState>, state: ResourceState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state change timed out")
            .unwrap();
    }

    // ===== Settings =====

    #[test]
    fn settings_from_config_apply_overrides() {
        let mut config = Config::default();
        config.resources.async_task_limit = 7;
        config.overrides.insert(
            "caps".into(),
            ResourceOverride {
                replicas: Some(3),
                lazy: Some(true),
                async_task_limit: None,
            },
        );

        let caps = ResourceSettings::from_config("caps", "caps", &config);
        assert_eq!(caps.replicas, 3);
        assert!(caps.lazy);
        assert_eq!(caps.async_task_limit, 7);

        let other = ResourceSettings::from_config("other", "echo", &config);
        assert_eq!(other.replicas, 1);
        assert!(!other.lazy);
    }

    #[test]
    fn zero_replicas_rejected() {
        let err = RunnableResource::new(
            ResourceSettings::new("r", "echo").with_replicas(0),
            Arc::new(ThreadLauncher::new(HandlerRegistry::builtin())),
        )
        .unwrap_err();
        assert!(err.to_string().contains("replicas"));
    }

    #[test]
    fn worker_context_is_a_plain_snapshot() {
        let settings = ResourceSettings::new("r", "caps").with_handler_settings(json!({"min": 2}));
        let ctx = settings.worker_context(4);
        assert_eq!(ctx.resource, "r");
        assert_eq!(ctx.handler, "caps");
        assert_eq!(ctx.worker_index, 4);
        assert_eq!(ctx.settings, json!({"min": 2}));
    }

    // ===== Lifecycle =====

    #[tokio::test]
    async fn start_is_idempotent() {
        let res = resource(fast("idem").with_replicas(2));
        let first = res.start().await;
        let second = res.start().await;
        assert!(first.same_as(&second));
        assert!(res.started());

        let report = res.stop().await;
        assert_eq!(
            report,
            StopReport {
                stop_messages: 2,
                joined_workers: 2
            }
        );
        assert_eq!(res.state(), ResourceState::Stopped);
        assert!(res.queues().inbound.is_empty());
    }

    #[tokio::test]
    async fn stop_on_stopped_resource_is_a_noop() {
        let res = resource(fast("noop"));
        assert_eq!(res.stop().await, StopReport::default());
        assert!(res.queues().inbound.is_empty());
    }

    #[tokio::test]
    async fn queues_survive_restart() {
        let res = resource(fast("restart"));
        let before = res.start().await;
        res.stop().await;
        let after = res.start().await;
        assert!(before.same_as(&after));
        res.stop().await;
    }

    #[tokio::test]
    async fn lazy_only_applies_to_first_start() {
        let res = resource(fast("lazy-once").lazy(true));
        res.start().await;
        assert_eq!(res.state(), ResourceState::LazyWaiting);
        res.stop().await;

        res.start().await;
        assert!(res.started());
        assert_eq!(res.stop().await.joined_workers, 1);
    }

    #[tokio::test]
    async fn lazy_resource_starts_on_first_message() {
        let res = resource(fast("lazy").with_replicas(2).lazy(true));
        let mut states = res.subscribe_state();

        res.start().await;
        assert_eq!(res.state(), ResourceState::LazyWaiting);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!res.started());

        let proxy = res.proxy();
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            proxy.request_value(json!({"text": "wake"})),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply, json!({"text": "wake"}));
        wait_for(&mut states, ResourceState::Started).await;

        let report = res.stop().await;
        assert_eq!(report.joined_workers, 2);
    }

    #[tokio::test]
    async fn stop_while_lazy_waiting_enqueues_nothing() {
        let res = resource(fast("lazy-stop").lazy(true));
        res.start().await;
        assert_eq!(res.state(), ResourceState::LazyWaiting);

        assert_eq!(res.stop().await, StopReport::default());
        assert_eq!(res.state(), ResourceState::Stopped);
        assert!(res.queues().inbound.is_empty());
    }

    #[tokio::test]
    async fn idle_resource_pauses_and_wakes_again() {
        let mut settings = fast("idle");
        settings.max_inactivity = Duration::from_millis(60);
        let res = resource(settings);
        let mut states = res.subscribe_state();

        res.start().await;
        assert!(res.started());
        wait_for(&mut states, ResourceState::LazyWaiting).await;

        let proxy = res.proxy();
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            proxy.request_value(json!({"text": "again"})),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply["text"], "again");
        res.stop().await;
    }

    #[tokio::test]
    async fn last_unlink_pauses() {
        let res = resource(fast("links"));
        res.start().await;
        let _a = res.proxy();
        let _b = res.proxy();
        assert_eq!(res.link_count(), 2);

        assert!(res.unlink().await.is_none());
        assert!(res.started());

        let report = res.unlink().await.unwrap();
        assert_eq!(report.joined_workers, 1);
        assert_eq!(res.state(), ResourceState::LazyWaiting);

        // Extra unlinks never underflow.
        assert!(res.unlink().await.is_none());
        assert_eq!(res.link_count(), 0);
        res.stop().await;
    }

    #[tokio::test]
    async fn unlink_after_stop_keeps_resource_stopped() {
        let res = resource(fast("unlink-stopped"));
        res.start().await;
        res.stop().await;

        let proxy = res.proxy();
        assert_eq!(res.unlink().await, Some(StopReport::default()));
        assert_eq!(res.state(), ResourceState::Stopped);

        let pending = tokio::time::timeout(
            Duration::from_millis(100),
            proxy.request_value(json!({"text": "nobody home"})),
        )
        .await;
        assert!(pending.is_err());
        assert_eq!(res.state(), ResourceState::Stopped);
        assert_eq!(res.pause().await, StopReport::default());
        assert_eq!(res.state(), ResourceState::Stopped);
    }
}
