//! Agent manager - registry, dependency injection and health checks.
//!
//! The manager owns every registered [`AgentRuntime`], injects the shared
//! [`AgentServices`] into each, and re-publishes all agent events on one
//! aggregate stream. A health monitor periodically restarts agents stuck in
//! the error state and reports loops that outlive a stop.
//!
//! Lookups against unknown agent names are logged and otherwise ignored.

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfigUpdate, AgentsConfig};
use crate::models::{AgentStatus, AgentTask};
use crate::persist::StateStore;
use crate::runtime::{
    Agent, AgentEvent, AgentEventKind, AgentRuntime, AgentServices, EventBus,
};

const THREAD_DIED_MESSAGE: &str = "Agent thread died unexpectedly";
const LOOP_EXITED_MESSAGE: &str = "Agent loop exited unexpectedly";

struct HealthMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct AgentManager {
    agents: RwLock<HashMap<String, Arc<AgentRuntime>>>,
    services: RwLock<AgentServices>,
    config: RwLock<AgentsConfig>,
    store: Option<Arc<dyn StateStore>>,
    events: EventBus,
    forwarders: Mutex<HashMap<String, CancellationToken>>,
    health_monitor: Mutex<Option<HealthMonitor>>,
    shutdown: CancellationToken,
}

impl AgentManager {
    pub fn new(
        config: AgentsConfig,
        services: AgentServices,
        store: Option<Arc<dyn StateStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(HashMap::new()),
            services: RwLock::new(services),
            config: RwLock::new(config),
            store,
            events: EventBus::new(),
            forwarders: Mutex::new(HashMap::new()),
            health_monitor: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Aggregate event stream of every registered agent.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> AgentsConfig {
        self.config.read().clone()
    }

    /// Build a runtime for `agent` from the configured options and register it.
    pub async fn register(&self, agent: Arc<dyn Agent>, auto_start: bool) -> Arc<AgentRuntime> {
        let options = self.config.read().runtime_options(agent.name());
        let runtime = AgentRuntime::new(agent, options, self.store.clone());
        self.register_runtime(Arc::clone(&runtime), auto_start).await;
        runtime
    }

    /// Register a prepared runtime. A runtime already registered under the
    /// same name is stopped and replaced.
    pub async fn register_runtime(&self, runtime: Arc<AgentRuntime>, auto_start: bool) {
        let name = runtime.name().to_string();
        let settings = self.config.read().settings(&name);

        runtime.set_services(self.services.read().clone());
        if let Some(interval) = settings.check_interval() {
            runtime.set_check_interval(interval);
        }

        let previous = self
            .agents
            .write()
            .insert(name.clone(), Arc::clone(&runtime));
        if let Some(previous) = previous {
            warn!(agent = %name, "Agent registered twice, replacing previous instance");
            self.detach_forwarder(&name);
            if previous.is_running() {
                let _ = previous.stop().await;
            }
        }

        self.attach_forwarder(&runtime);
        info!(agent = %name, enabled = settings.enabled, "Registered agent");

        if auto_start && settings.enabled {
            Self::start_runtime(&runtime);
        }
    }

    pub fn agent(&self, name: &str) -> Option<Arc<AgentRuntime>> {
        self.agents.read().get(name).cloned()
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn start(&self, name: &str) {
        let Some(runtime) = self.agent(name) else {
            error!(agent = %name, "Cannot start unknown agent");
            return;
        };
        if runtime.is_worker_alive() {
            warn!(agent = %name, "Agent is already running");
            return;
        }
        Self::start_runtime(&runtime);
    }

    pub async fn stop(&self, name: &str) {
        let Some(runtime) = self.agent(name) else {
            error!(agent = %name, "Cannot stop unknown agent");
            return;
        };
        if !runtime.is_running() {
            warn!(agent = %name, "Agent is already stopped");
            return;
        }
        if let Err(err) = runtime.stop().await {
            warn!(agent = %name, "{}", err);
        }
    }

    /// Start every enabled agent that is not running.
    pub fn start_all(&self) {
        for runtime in self.runtimes() {
            if self.is_enabled(runtime.name()) && !runtime.is_worker_alive() {
                Self::start_runtime(&runtime);
            }
        }
    }

    /// Stop every running agent, waiting for each loop to exit.
    pub async fn stop_all(&self) {
        for runtime in self.runtimes() {
            if runtime.is_running()
                && let Err(err) = runtime.stop().await
            {
                warn!(agent = %runtime.name(), "{}", err);
            }
        }
    }

    pub fn get_status(&self, name: &str) -> Option<AgentStatus> {
        self.agent(name).map(|runtime| runtime.status())
    }

    pub fn get_all_statuses(&self) -> BTreeMap<String, AgentStatus> {
        self.agents
            .read()
            .iter()
            .map(|(name, runtime)| (name.clone(), runtime.status()))
            .collect()
    }

    /// Queue `task` on the named agent. Returns false for unknown agents.
    pub fn add_task(&self, name: &str, task: AgentTask) -> bool {
        let Some(runtime) = self.agent(name) else {
            error!(agent = %name, task_id = %task.id, "Cannot add task to unknown agent");
            return false;
        };
        runtime.enqueue(task);
        true
    }

    /// Queue a fresh task on every agent that handles `task_type`.
    /// Returns the number of agents that received it.
    pub fn broadcast(&self, task_type: &str, data: Map<String, Value>) -> usize {
        let mut delivered = 0;
        for runtime in self.runtimes() {
            if runtime.can_handle_task(task_type) {
                runtime.enqueue(AgentTask::new(task_type, data.clone()));
                delivered += 1;
            }
        }
        debug!(task_type, delivered, "Broadcast task");
        delivered
    }

    /// Replace the shared collaborators and re-inject them into every agent.
    pub fn set_services(&self, services: AgentServices) {
        *self.services.write() = services.clone();
        for runtime in self.runtimes() {
            runtime.set_services(services.clone());
        }
    }

    /// Merge `update` into the agent's settings and apply it to a registered
    /// runtime: the interval takes effect live, `enabled` starts or stops it.
    pub async fn update_config(&self, name: &str, update: AgentConfigUpdate) {
        let settings = {
            let mut config = self.config.write();
            let settings = config.agents.entry(name.to_string()).or_default();
            settings.apply(&update);
            settings.clone()
        };
        if let Some(requested) = update.check_interval_secs
            && settings.check_interval_secs != Some(requested)
        {
            warn!(
                agent = %name,
                requested,
                applied = ?settings.check_interval_secs,
                "Check interval below minimum, clamped"
            );
        }

        let Some(runtime) = self.agent(name) else {
            debug!(agent = %name, "Updated config for unregistered agent");
            return;
        };

        if let Some(interval) = settings.check_interval() {
            runtime.set_check_interval(interval);
        }

        match update.enabled {
            Some(false) if runtime.is_running() => {
                info!(agent = %name, "Agent disabled, stopping");
                let _ = runtime.stop().await;
            }
            Some(true) if !runtime.is_worker_alive() => {
                info!(agent = %name, "Agent enabled, starting");
                Self::start_runtime(&runtime);
            }
            _ => {}
        }
    }

    /// Start the periodic health check. Holds only a weak reference, so the
    /// monitor ends when the manager is dropped.
    pub fn spawn_health_monitor(self: &Arc<Self>) {
        let mut slot = self.health_monitor.lock();
        if slot.is_some() {
            warn!("Health monitor already running");
            return;
        }

        let interval = self.config.read().health_check_interval();
        let manager = Arc::downgrade(self);
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.run_health_check().await;
                    }
                }
            }
            debug!("Health monitor stopped");
        });

        info!(interval_secs = interval.as_secs(), "Health monitor started");
        *slot = Some(HealthMonitor { cancel, handle });
    }

    /// One health-check pass over every enabled agent.
    pub async fn run_health_check(&self) {
        for runtime in self.runtimes() {
            let name = runtime.name().to_string();
            if !self.is_enabled(&name) {
                continue;
            }

            match runtime.status() {
                AgentStatus::Error => {
                    warn!(agent = %name, "Agent in error state, restarting");
                    if runtime.stop().await.is_ok() {
                        Self::start_runtime(&runtime);
                    }
                }
                AgentStatus::Stopped if runtime.is_worker_alive() => {
                    error!(agent = %name, "{}", THREAD_DIED_MESSAGE);
                    self.events
                        .publish(AgentEvent::error(&name, THREAD_DIED_MESSAGE));
                }
                status
                    if status.is_active()
                        && runtime.is_running()
                        && !runtime.is_worker_alive() =>
                {
                    error!(agent = %name, status = %status, "{}, restarting", LOOP_EXITED_MESSAGE);
                    self.events
                        .publish(AgentEvent::error(&name, LOOP_EXITED_MESSAGE));
                    if runtime.stop().await.is_ok() {
                        Self::start_runtime(&runtime);
                    }
                }
                _ => {}
            }
        }
    }

    /// Stop the health monitor and every agent, then close event forwarding.
    pub async fn cleanup(&self) {
        let monitor = self.health_monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            let _ = monitor.handle.await;
        }

        self.stop_all().await;
        self.shutdown.cancel();
        self.forwarders.lock().clear();
        info!("Agent manager cleaned up");
    }

    fn runtimes(&self) -> Vec<Arc<AgentRuntime>> {
        self.agents.read().values().cloned().collect()
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.config.read().settings(name).enabled
    }

    fn start_runtime(runtime: &Arc<AgentRuntime>) {
        if let Err(err) = runtime.start() {
            warn!(agent = %runtime.name(), "{}", err);
        }
    }

    fn attach_forwarder(&self, runtime: &Arc<AgentRuntime>) {
        let name = runtime.name().to_string();
        let mut receiver = runtime.subscribe();
        let bus = self.events.clone();
        let cancel = self.shutdown.child_token();
        let token = cancel.clone();
        let agent = name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            log_event(&event);
                            bus.publish(event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(agent = %agent, skipped, "Event forwarder lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
        });

        self.forwarders.lock().insert(name, cancel);
    }

    fn detach_forwarder(&self, name: &str) {
        if let Some(cancel) = self.forwarders.lock().remove(name) {
            cancel.cancel();
        }
    }
}

fn log_event(event: &AgentEvent) {
    match &event.kind {
        AgentEventKind::Error { message } => {
            error!(agent = %event.agent, "Agent error: {}", message);
        }
        AgentEventKind::Notification { level, message } => {
            info!(agent = %event.agent, level = level.as_str(), "{}", message);
        }
        AgentEventKind::StatusChanged { status } => {
            debug!(agent = %event.agent, status = %status, "Status changed");
        }
        AgentEventKind::TaskCompleted { task_id, task_type, .. } => {
            debug!(agent = %event.agent, task_id = %task_id, task_type = %task_type, "Task completed");
        }
        AgentEventKind::Progress { percent, message } => {
            debug!(agent = %event.agent, percent, "{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentSettings;
    use crate::runtime::RuntimeOptions;
    use crate::testkit::{ScriptedAgent, collect_until};
    use std::time::Duration;

    fn test_config() -> AgentsConfig {
        AgentsConfig {
            agents: BTreeMap::new(),
            ..Default::default()
        }
    }

    fn options(interval_ms: u64, cooldown_ms: u64) -> RuntimeOptions {
        RuntimeOptions::default()
            .with_check_interval(Duration::from_millis(interval_ms))
            .with_error_cooldown(Duration::from_millis(cooldown_ms))
    }

    fn is_status(status: AgentStatus) -> impl Fn(&AgentEvent) -> bool {
        move |event| event.kind == AgentEventKind::StatusChanged { status }
    }

    #[tokio::test]
    async fn test_unknown_agent_operations_are_noops() {
        let manager = AgentManager::new(test_config(), AgentServices::new(), None);

        manager.start("Ghost");
        manager.stop("Ghost").await;
        assert!(!manager.add_task("Ghost", AgentTask::new("x", Map::new())));
        assert_eq!(manager.get_status("Ghost"), None);
        assert!(manager.get_all_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let manager = AgentManager::new(test_config(), AgentServices::new(), None);
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Alpha")), options(50, 50), None);
        manager.register_runtime(runtime.clone(), false).await;
        assert_eq!(manager.get_status("Alpha"), Some(AgentStatus::Idle));

        manager.stop("Alpha").await;
        assert_eq!(manager.get_status("Alpha"), Some(AgentStatus::Idle));

        manager.start("Alpha");
        manager.start("Alpha");
        assert!(runtime.is_worker_alive());

        manager.stop("Alpha").await;
        manager.stop("Alpha").await;
        assert_eq!(manager.get_status("Alpha"), Some(AgentStatus::Stopped));
    }

    #[tokio::test]
    async fn test_disabled_agent_is_not_auto_started() {
        let mut config = test_config();
        config.agents.insert(
            "Dormant".to_string(),
            AgentSettings {
                enabled: false,
                check_interval_secs: None,
            },
        );
        let manager = AgentManager::new(config, AgentServices::new(), None);
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Dormant")), options(50, 50), None);

        manager.register_runtime(runtime.clone(), true).await;
        assert!(!runtime.is_running());

        manager.start_all();
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn test_configured_interval_overrides_runtime_default() {
        let mut config = test_config();
        config.agents.insert(
            "Tuned".to_string(),
            AgentSettings {
                enabled: true,
                check_interval_secs: Some(42),
            },
        );
        let manager = AgentManager::new(config, AgentServices::new(), None);
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Tuned")), options(50, 50), None);

        manager.register_runtime(runtime.clone(), false).await;
        assert_eq!(runtime.check_interval(), Duration::from_secs(42));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_health_check_restarts_agent_in_error_state() {
        let manager = AgentManager::new(test_config(), AgentServices::new(), None);
        let agent = Arc::new(ScriptedAgent::new("Fragile"));
        agent.set_fail_scheduled_check(true);
        let runtime = AgentRuntime::new(agent.clone(), options(60_000, 60_000), None);
        let mut runtime_events = runtime.subscribe();

        manager.register_runtime(runtime.clone(), true).await;
        collect_until(&mut runtime_events, Duration::from_secs(2), is_status(AgentStatus::Error)).await;
        assert_eq!(manager.get_status("Fragile"), Some(AgentStatus::Error));

        agent.set_fail_scheduled_check(false);
        manager.run_health_check().await;

        assert_eq!(manager.get_status("Fragile"), Some(AgentStatus::Running));
        let mut transitions = Vec::new();
        while let Ok(event) = runtime_events.try_recv() {
            if let AgentEventKind::StatusChanged { status } = event.kind {
                transitions.push(status);
            }
        }
        assert_eq!(transitions, vec![AgentStatus::Stopped, AgentStatus::Running]);

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_health_check_reports_zombie_without_restart() {
        let manager = AgentManager::new(test_config(), AgentServices::new(), None);
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Zombie")), options(60_000, 50), None);
        let mut runtime_events = runtime.subscribe();
        let mut events = manager.subscribe();

        manager.register_runtime(runtime.clone(), true).await;
        collect_until(&mut runtime_events, Duration::from_secs(2), is_status(AgentStatus::Sleeping)).await;

        runtime.force_status(AgentStatus::Stopped);
        manager.run_health_check().await;

        let seen = collect_until(&mut events, Duration::from_secs(2), |event| {
            event.kind
                == AgentEventKind::Error {
                    message: "Agent thread died unexpectedly".to_string(),
                }
        })
        .await;
        assert_eq!(seen.last().unwrap().agent, "Zombie");
        assert_eq!(runtime.status(), AgentStatus::Stopped);
        assert!(runtime.is_worker_alive());

        manager.cleanup().await;
        assert!(!runtime.is_worker_alive());
    }

    #[tokio::test]
    async fn test_health_check_restarts_dead_loop() {
        let manager = AgentManager::new(test_config(), AgentServices::new(), None);
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Crashed")), options(60_000, 50), None);
        let mut events = manager.subscribe();

        manager.register_runtime(runtime.clone(), true).await;
        runtime.abort_worker();
        for _ in 0..100 {
            if !runtime.is_worker_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!runtime.is_worker_alive());

        manager.run_health_check().await;

        assert!(runtime.is_worker_alive());
        collect_until(&mut events, Duration::from_secs(2), |event| {
            event.kind
                == AgentEventKind::Error {
                    message: "Agent loop exited unexpectedly".to_string(),
                }
        })
        .await;

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_reregistering_replaces_and_stops_previous() {
        let manager = AgentManager::new(test_config(), AgentServices::new(), None);
        let first = AgentRuntime::new(Arc::new(ScriptedAgent::new("Dup")), options(50, 50), None);
        let second = AgentRuntime::new(Arc::new(ScriptedAgent::new("Dup")), options(50, 50), None);

        manager.register_runtime(first.clone(), true).await;
        manager.register_runtime(second.clone(), false).await;

        assert_eq!(first.status(), AgentStatus::Stopped);
        assert!(Arc::ptr_eq(&manager.agent("Dup").unwrap(), &second));
        assert_eq!(manager.agent_names(), vec!["Dup"]);
    }

    #[tokio::test]
    async fn test_update_config_applies_interval_and_enabled() {
        let manager = AgentManager::new(test_config(), AgentServices::new(), None);
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Live")), options(50, 50), None);
        manager.register_runtime(runtime.clone(), true).await;

        manager
            .update_config(
                "Live",
                AgentConfigUpdate {
                    enabled: Some(false),
                    check_interval_secs: Some(900),
                },
            )
            .await;
        assert_eq!(runtime.check_interval(), Duration::from_secs(900));
        assert_eq!(runtime.status(), AgentStatus::Stopped);
        assert!(!manager.config().agents["Live"].enabled);

        manager
            .update_config(
                "Live",
                AgentConfigUpdate {
                    enabled: Some(true),
                    check_interval_secs: None,
                },
            )
            .await;
        assert!(runtime.is_worker_alive());

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_update_config_clamps_zero_interval() {
        let manager = AgentManager::new(test_config(), AgentServices::new(), None);
        let agent = Arc::new(ScriptedAgent::new("Eager"));
        let runtime = AgentRuntime::new(agent.clone(), options(60_000, 50), None);
        manager.register_runtime(runtime.clone(), false).await;

        manager
            .update_config(
                "Eager",
                AgentConfigUpdate {
                    enabled: None,
                    check_interval_secs: Some(0),
                },
            )
            .await;

        assert_eq!(runtime.check_interval(), Duration::from_secs(1));
        assert_eq!(manager.config().agents["Eager"].check_interval_secs, Some(1));

        manager.start("Eager");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.scheduled_checks(), 1);

        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_services_are_injected_on_register() {
        let ai = Arc::new(crate::testkit::MockAi::new("ok"));
        let services = AgentServices::new().with_ai(ai);
        let manager = AgentManager::new(test_config(), services, None);
        let runtime = AgentRuntime::new(Arc::new(ScriptedAgent::new("Injected")), options(50, 50), None);

        assert!(runtime.services().ai.is_none());
        manager.register_runtime(runtime.clone(), false).await;
        assert!(runtime.services().ai.is_some());

        manager.set_services(AgentServices::new());
        assert!(runtime.services().ai.is_none());
    }
}
