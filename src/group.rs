//! Process Group: admission control for the set of models sharing a swap /
//! exclusive / persistent policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tracing::info;

use crate::config::Config;
use crate::error::SchedulerError;
use crate::events::EventBus;
use crate::ports::PortRegistry;
use crate::process::{Process, ProcessState};

pub struct Group {
    pub id: String,
    pub swap: bool,
    pub exclusive: bool,
    pub persistent: bool,
    start_port: u16,
    port_cursor: AtomicU16,

    processes: DashMap<String, Arc<Process>>,
    semaphores: DashMap<String, Arc<Semaphore>>,
    /// Serializes admission decisions. Never held across the upstream HTTP
    /// call itself, only across the decide-and-spawn sequence.
    admission_lock: Mutex<()>,

    port_registry: Arc<PortRegistry>,
    http: reqwest::Client,
    events: EventBus,
}

impl Group {
    pub fn new(
        id: String,
        swap: bool,
        exclusive: bool,
        persistent: bool,
        start_port: u16,
        port_registry: Arc<PortRegistry>,
        http: reqwest::Client,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            swap,
            exclusive,
            persistent,
            start_port,
            port_cursor: AtomicU16::new(start_port),
            processes: DashMap::new(),
            semaphores: DashMap::new(),
            admission_lock: Mutex::new(()),
            port_registry,
            http,
            events,
        })
    }

    pub fn has_ready_member(&self) -> bool {
        self.processes.iter().any(|e| e.value().state() == ProcessState::Ready)
    }

    pub fn process(&self, model_id: &str) -> Option<Arc<Process>> {
        self.processes.get(model_id).map(|e| Arc::clone(e.value()))
    }

    pub fn snapshot_processes(&self) -> Vec<Arc<Process>> {
        self.processes.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Carries a Process surviving a hot reload into this (rebuilt) Group
    /// object, so in-flight requests retain their handle.
    pub fn adopt(&self, process: Arc<Process>) {
        self.processes.insert(process.model_id.clone(), process);
    }

    /// Bounds simultaneous in-flight requests against one model's Process to
    /// `concurrencyLimit`, lazily creating the semaphore on first use.
    pub fn semaphore_for(&self, model_id: &str, limit: u32) -> Arc<Semaphore> {
        Arc::clone(
            self.semaphores
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit as usize)))
                .value(),
        )
    }

    /// Admits `model_id`: reuses a Ready Process, evicts a swapped-out
    /// sibling first if `swap`, or starts a new Process. FIFO within the
    /// group because admission is entirely inside `admission_lock`.
    pub async fn admit(self: &Arc<Self>, config: &Config, model_id: &str) -> Result<Arc<Process>, SchedulerError> {
        let _admission = self.admission_lock.lock().await;

        if let Some(existing) = self.process(model_id)
            && existing.state() == ProcessState::Ready
        {
            return Ok(existing);
        }

        if self.swap {
            let siblings: Vec<Arc<Process>> = self
                .processes
                .iter()
                .filter(|e| e.key() != model_id && e.value().state() == ProcessState::Ready)
                .map(|e| Arc::clone(e.value()))
                .collect();
            for sibling in siblings {
                info!(group = %self.id, evicting = %sibling.model_id, admitting = %model_id, "swap eviction");
                sibling.stop(true).await;
                self.port_registry.release(sibling.port).await;
                self.processes.remove(&sibling.model_id);
            }
        }

        let process = match self.process(model_id) {
            Some(p) => p,
            None => {
                let model = config
                    .models
                    .get(model_id)
                    .ok_or_else(|| SchedulerError::ModelUnknown { requested: model_id.to_string() })?;
                let port = self.allocate_port().await?;
                let (argv, env) = match config.command_for(model_id, port) {
                    Ok(v) => v,
                    Err(e) => {
                        self.port_registry.release(port).await;
                        return Err(e);
                    }
                };
                let proxy_url = config.proxy_url_for(model_id, port);
                let process = Process::new(
                    model_id.to_string(),
                    self.id.clone(),
                    port,
                    proxy_url,
                    model.check_endpoint.clone(),
                    argv,
                    env,
                    config.health_check_timeout,
                    self.http.clone(),
                    self.events.clone(),
                );
                self.processes.insert(model_id.to_string(), Arc::clone(&process));
                process
            }
        };

        if let Err(e) = process.ensure().await {
            self.processes.remove(model_id);
            self.port_registry.release(process.port).await;
            return Err(e);
        }

        Ok(process)
    }

    async fn allocate_port(&self) -> Result<u16, SchedulerError> {
        let candidate = self.port_cursor.fetch_add(1, Ordering::SeqCst);
        let candidate = if candidate == 0 { self.start_port } else { candidate };
        self.port_registry.allocate_from(candidate).await
    }

    /// Stops any Process idle for longer than its model's `ttl` (0 = never),
    /// skipping persistent groups entirely.
    pub async fn sweep_idle(self: &Arc<Self>, ttl_for: impl Fn(&str) -> Duration) {
        if self.persistent {
            return;
        }
        let candidates: Vec<Arc<Process>> = self
            .processes
            .iter()
            .filter(|e| e.value().state() == ProcessState::Ready)
            .map(|e| Arc::clone(e.value()))
            .collect();

        for process in candidates {
            let ttl = ttl_for(&process.model_id);
            if ttl.is_zero() {
                continue;
            }
            if let Some(idle_since) = process.idle_since()
                && idle_since.elapsed() >= ttl
            {
                info!(group = %self.id, model_id = %process.model_id, "idle timeout, stopping");
                process.stop(true).await;
                self.port_registry.release(process.port).await;
                self.processes.remove(&process.model_id);
            }
        }
    }

    /// Graceful-stops every member, used by Scheduler shutdown/unload-all.
    pub async fn stop_all(self: &Arc<Self>, graceful: bool) {
        let members = self.snapshot_processes();
        let futures = members.iter().map(|p| p.stop(graceful));
        futures::future::join_all(futures).await;
        for member in &members {
            self.port_registry.release(member.port).await;
        }
        self.processes.clear();
    }

    pub async fn stop_member(self: &Arc<Self>, model_id: &str, graceful: bool) -> bool {
        let Some(process) = self.process(model_id) else { return false };
        process.stop(graceful).await;
        self.port_registry.release(process.port).await;
        self.processes.remove(model_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config::parse(
            r#"
healthCheckTimeout: 15
startPort: 9500
models:
  a:
    cmd: "/bin/sleep ${PORT}"
  b:
    cmd: "/bin/sleep ${PORT}"
groups:
  g:
    members: ["a", "b"]
    swap: true
"#,
        )
        .unwrap()
    }

    fn test_group(swap: bool, exclusive: bool, persistent: bool) -> Arc<Group> {
        Group::new(
            "g".to_string(),
            swap,
            exclusive,
            persistent,
            9500,
            Arc::new(PortRegistry::new()),
            reqwest::Client::new(),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn admit_for_nonexistent_model_fails_fast() {
        let config = test_config();
        let group = test_group(true, false, false);
        let result = group.admit(&config, "missing").await;
        assert!(matches!(result, Err(SchedulerError::ModelUnknown { .. })));
    }

    #[tokio::test]
    async fn swap_group_has_no_ready_member_initially() {
        let group = test_group(true, false, false);
        assert!(!group.has_ready_member());
    }

    #[tokio::test]
    async fn semaphore_for_model_is_cached_across_calls() {
        let group = test_group(false, false, false);
        let first = group.semaphore_for("a", 3);
        let second = group.semaphore_for("a", 3);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn stop_member_on_absent_model_returns_false() {
        let group = test_group(true, false, false);
        assert!(!group.stop_member("nope", true).await);
    }
}
