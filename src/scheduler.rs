//! Scheduler / Proxy Manager: the top-level coordinator. Resolves a
//! requested model name to a Group, enforces the cross-group exclusive
//! interlock, and delegates admission to the owning Group.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tracing::{info, warn};

use crate::config::{Config, diff_models};
use crate::error::SchedulerError;
use crate::events::{Event, EventBus, ReloadPhase};
use crate::group::Group;
use crate::ports::PortRegistry;
use crate::process::{Acquisition, Process};

/// A held reference to a Ready Process for the lifetime of one proxied
/// request: the refcount acquisition and the concurrency-limit permit are
/// released together when this is dropped.
pub struct RequestHandle {
    pub process: Arc<Process>,
    _acquisition: Acquisition,
    _permit: OwnedSemaphorePermit,
}

pub struct Scheduler {
    config: ArcSwap<Config>,
    groups: DashMap<String, Arc<Group>>,
    port_registry: Arc<PortRegistry>,
    http: reqwest::Client,
    events: EventBus,
    draining: AtomicBool,
    /// Guards cross-group decisions (the exclusive interlock) and group
    /// table mutation (hot reload). Acquired before any Group's own lock,
    /// never the reverse, and dropped before a Group's admission wait.
    scheduler_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(config: Config, http: reqwest::Client, events: EventBus) -> Arc<Self> {
        let port_registry = Arc::new(PortRegistry::new());
        let groups = build_groups(&config, &port_registry, &http, &events);
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            groups,
            port_registry,
            http,
            events,
            draining: AtomicBool::new(false),
            scheduler_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Resolves a requested model name, admits it (performing the
    /// cross-group exclusive interlock first if needed), and returns a
    /// handle that keeps the Process alive until dropped.
    pub async fn route(self: &Arc<Self>, requested_name: &str) -> Result<RequestHandle, SchedulerError> {
        if self.is_draining() {
            return Err(SchedulerError::Unavailable);
        }

        let config = self.config();
        let model_id = config.resolve(requested_name)?;
        let model = config
            .models
            .get(&model_id)
            .ok_or_else(|| SchedulerError::ModelUnknown { requested: requested_name.to_string() })?;
        let group = self
            .groups
            .get(&model.group)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SchedulerError::ModelUnknown { requested: requested_name.to_string() })?;

        if group.exclusive {
            self.drain_conflicting_exclusive_groups(&group.id).await;
        }

        let process = group.admit(&config, &model_id).await?;

        let semaphore = group.semaphore_for(&model_id, model.concurrency_limit);
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Cancelled)?;

        let acquisition = process.acquire()?;

        Ok(RequestHandle { process, _acquisition: acquisition, _permit: permit })
    }

    /// Stops every Ready member of every other exclusive group, in
    /// parallel, before admitting into `group_id`. Holds `scheduler_lock`
    /// only across this decide-and-drain step, never across a Group's own
    /// admission wait.
    async fn drain_conflicting_exclusive_groups(&self, group_id: &str) {
        let _scheduler_guard = self.scheduler_lock.lock().await;
        let conflicting: Vec<Arc<Group>> = self
            .groups
            .iter()
            .filter(|e| e.value().exclusive && e.key() != group_id && e.value().has_ready_member())
            .map(|e| Arc::clone(e.value()))
            .collect();
        if conflicting.is_empty() {
            return;
        }
        info!(group = %group_id, draining = conflicting.len(), "exclusive interlock draining conflicting groups");
        futures::future::join_all(conflicting.iter().map(|g| g.stop_all(true))).await;
    }

    pub fn proxy_url(&self, process: &Process) -> String {
        process.proxy_url().to_string()
    }

    /// Lists configured (non-unlisted) models with their live state, for the
    /// `/v1/models` surface.
    pub fn list_models(&self) -> Vec<ModelListing> {
        let config = self.config();
        config
            .models
            .values()
            .filter(|m| !m.unlisted)
            .map(|m| {
                let state = self
                    .groups
                    .get(&m.group)
                    .and_then(|g| g.process(&m.id))
                    .map(|p| p.state());
                ModelListing {
                    id: m.id.clone(),
                    display_name: m.display_name.clone(),
                    state,
                    size_hint_bytes: m.size_hint_bytes,
                }
            })
            .collect()
    }

    pub async fn unload_all(&self, graceful: bool) {
        let groups: Vec<Arc<Group>> = self.groups.iter().map(|e| Arc::clone(e.value())).collect();
        futures::future::join_all(groups.iter().map(|g| g.stop_all(graceful))).await;
    }

    pub async fn unload_model(&self, requested_name: &str, graceful: bool) -> Result<bool, SchedulerError> {
        let config = self.config();
        let model_id = config.resolve(requested_name)?;
        let model = config
            .models
            .get(&model_id)
            .ok_or_else(|| SchedulerError::ModelUnknown { requested: requested_name.to_string() })?;
        let Some(group) = self.groups.get(&model.group).map(|e| Arc::clone(e.value())) else {
            return Ok(false);
        };
        Ok(group.stop_member(&model_id, graceful).await)
    }

    /// Every currently-live (model, group, process) triple, for the Memory
    /// Guard's eviction sweep.
    pub fn live_processes(&self) -> Vec<(Arc<Group>, Arc<Process>)> {
        self.groups
            .iter()
            .flat_map(|e| {
                let group = Arc::clone(e.value());
                group
                    .snapshot_processes()
                    .into_iter()
                    .map(move |p| (Arc::clone(&group), p))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Sweeps every group for idle Processes past their model's ttl.
    pub async fn sweep_idle(&self) {
        let config = self.config();
        for entry in self.groups.iter() {
            let group = Arc::clone(entry.value());
            let config = Arc::clone(&config);
            group
                .sweep_idle(move |model_id| config.models.get(model_id).map(|m| m.ttl).unwrap_or_default())
                .await;
        }
    }

    /// Atomically swaps in a new config snapshot. Processes whose model id
    /// and command argv are byte-identical between old and new are kept;
    /// everything else is drained gracefully. Rebuilds the group table to
    /// match the new snapshot's groups.
    pub async fn reload(self: &Arc<Self>, new_config: Config) {
        let _scheduler_guard = self.scheduler_lock.lock().await;
        self.events.publish(Event::ConfigChanged { phase: ReloadPhase::Start });

        let old_config = self.config();
        let diff = diff_models(&old_config, &new_config);

        for removed in &diff.removed {
            if let Some(group) = old_config.models.get(removed).and_then(|m| self.groups.get(&m.group)) {
                group.stop_member(removed, true).await;
            }
        }
        for changed in &diff.changed {
            if let Some(group) = old_config.models.get(changed).and_then(|m| self.groups.get(&m.group)) {
                group.stop_member(changed, true).await;
            }
        }

        let new_groups = build_groups(&new_config, &self.port_registry, &self.http, &self.events);
        // Carry over any still-running Process for an unchanged model into
        // its new Group object, so in-flight requests keep their handle.
        for unchanged in &diff.unchanged {
            let Some(old_group) = old_config.models.get(unchanged).and_then(|m| self.groups.get(&m.group)) else {
                continue;
            };
            let Some(process) = old_group.process(unchanged) else { continue };
            if let Some(new_model) = new_config.models.get(unchanged)
                && let Some(new_group) = new_groups.get(&new_model.group)
            {
                new_group.adopt(process);
            }
        }

        self.groups.clear();
        for (id, group) in new_groups {
            self.groups.insert(id, group);
        }
        self.config.store(Arc::new(new_config));

        self.events.publish(Event::ConfigChanged { phase: ReloadPhase::End });
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            unchanged = diff.unchanged.len(),
            "config reload applied"
        );
    }

    /// Enters Draining and stops every live Process, force-killing any that
    /// don't exit gracefully within `healthCheckTimeout`.
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let groups: Vec<Arc<Group>> = self.groups.iter().map(|e| Arc::clone(e.value())).collect();
        futures::future::join_all(groups.iter().map(|g| g.stop_all(true))).await;
        info!("scheduler shutdown complete");
    }

    pub async fn port_in_use_count(&self) -> usize {
        self.port_registry.in_use_count().await
    }
}

pub struct ModelListing {
    pub id: String,
    pub display_name: String,
    pub state: Option<crate::process::ProcessState>,
    pub size_hint_bytes: Option<u64>,
}

fn build_groups(
    config: &Config,
    port_registry: &Arc<PortRegistry>,
    http: &reqwest::Client,
    events: &EventBus,
) -> DashMap<String, Arc<Group>> {
    let groups = DashMap::new();
    for (id, def) in &config.groups {
        let start_port = def.start_port.unwrap_or(config.start_port);
        groups.insert(
            id.clone(),
            Group::new(
                id.clone(),
                def.swap,
                def.exclusive,
                def.persistent,
                start_port,
                Arc::clone(port_registry),
                http.clone(),
                events.clone(),
            ),
        );
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(extra: &str) -> Config {
        Config::parse(&format!(
            r#"
healthCheckTimeout: 15
startPort: 9600
models:
  a:
    cmd: "/bin/sleep ${{PORT}}"
  b:
    cmd: "/bin/sleep ${{PORT}}"
groups:
  g:
    members: ["a", "b"]
    swap: true
{extra}
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn route_to_unknown_model_returns_model_unknown() {
        let scheduler = Scheduler::new(test_config(""), reqwest::Client::new(), EventBus::new());
        let result = scheduler.route("nonexistent").await;
        assert!(matches!(result, Err(SchedulerError::ModelUnknown { .. })));
    }

    #[tokio::test]
    async fn draining_scheduler_rejects_new_routes() {
        let scheduler = Scheduler::new(test_config(""), reqwest::Client::new(), EventBus::new());
        scheduler.shutdown().await;
        let result = scheduler.route("a").await;
        assert!(matches!(result, Err(SchedulerError::Unavailable)));
    }

    #[tokio::test]
    async fn list_models_excludes_unlisted() {
        let config = Config::parse(
            r#"
models:
  visible:
    cmd: "/bin/sleep ${PORT}"
  hidden:
    cmd: "/bin/sleep ${PORT}"
    unlisted: true
"#,
        )
        .unwrap();
        let scheduler = Scheduler::new(config, reqwest::Client::new(), EventBus::new());
        let listings = scheduler.list_models();
        assert!(listings.iter().any(|m| m.id == "visible"));
        assert!(!listings.iter().any(|m| m.id == "hidden"));
    }

    #[tokio::test]
    async fn unload_model_with_no_running_process_returns_false() {
        let scheduler = Scheduler::new(test_config(""), reqwest::Client::new(), EventBus::new());
        let result = scheduler.unload_model("a", true).await.unwrap();
        assert!(!result);
    }
}
