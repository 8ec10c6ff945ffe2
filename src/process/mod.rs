//! Process: one backend child, its command, health probe, lifecycle state
//! machine, reference count, and captured logs.

pub mod health;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::events::{Event, EventBus, LogSource};

const STATE_STOPPED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_STOPPING: u8 = 3;
const STATE_FAILED: u8 = 4;
const STATE_SHUTDOWN: u8 = 5;

/// How long to wait after a graceful process-group SIGTERM before force
/// killing, mirroring the supervised-child pattern from the process-guard
/// reference: a short polite wait, then no mercy.
const POLITE_WAIT: Duration = Duration::from_millis(200);

const LOG_RING_CAPACITY: usize = 64 * 1024;

/// Polling interval for the post-startup exit supervisor; matches the
/// health-probe loop's cadence.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
    Shutdown,
}

fn state_from_atomic(v: u8) -> ProcessState {
    match v {
        STATE_STOPPED => ProcessState::Stopped,
        STATE_STARTING => ProcessState::Starting,
        STATE_READY => ProcessState::Ready,
        STATE_STOPPING => ProcessState::Stopping,
        STATE_FAILED => ProcessState::Failed,
        STATE_SHUTDOWN => ProcessState::Shutdown,
        _ => ProcessState::Failed,
    }
}

fn atomic_from_state(state: ProcessState) -> u8 {
    match state {
        ProcessState::Stopped => STATE_STOPPED,
        ProcessState::Starting => STATE_STARTING,
        ProcessState::Ready => STATE_READY,
        ProcessState::Stopping => STATE_STOPPING,
        ProcessState::Failed => STATE_FAILED,
        ProcessState::Shutdown => STATE_SHUTDOWN,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub model_id: String,
    pub state: ProcessState,
    pub port: u16,
    pub proxy_url: String,
    pub refcount: usize,
    pub uptime_secs: u64,
    pub last_error: Option<String>,
}

/// A short, non-async critical section; safe to lock from `Drop`. Matches
/// the teacher's preference for plain `std::sync::Mutex` over an async
/// mutex when the critical section never crosses an await point.
fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// RAII reference-count guard. Dropping it always releases, even if the
/// holder panics or returns early on an error path.
pub struct Acquisition {
    process: Arc<Process>,
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        let remaining = self.process.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            *lock(&self.process.idle_since) = Some(Instant::now());
        }
    }
}

pub struct Process {
    pub model_id: String,
    pub group_id: String,
    pub port: u16,
    proxy_url: String,
    check_endpoint: String,
    argv: Vec<String>,
    env: HashMap<String, String>,
    health_check_timeout: Duration,
    events: EventBus,

    state: AtomicU8,
    refcount: AtomicUsize,
    idle_since: std::sync::Mutex<Option<Instant>>,
    started_at: std::sync::Mutex<Option<Instant>>,
    last_error: std::sync::Mutex<Option<String>>,
    logs: std::sync::Mutex<VecDeque<u8>>,

    child: Mutex<Option<tokio::process::Child>>,
    http: reqwest::Client,

    /// Guards startup so concurrent `ensure` callers coalesce onto one
    /// attempt instead of racing to spawn duplicate children.
    startup_lock: Mutex<()>,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_id: String,
        group_id: String,
        port: u16,
        proxy_url: String,
        check_endpoint: String,
        argv: Vec<String>,
        env: HashMap<String, String>,
        health_check_timeout: Duration,
        http: reqwest::Client,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            model_id,
            group_id,
            port,
            proxy_url,
            check_endpoint,
            argv,
            env,
            health_check_timeout,
            events,
            state: AtomicU8::new(STATE_STOPPED),
            refcount: AtomicUsize::new(0),
            idle_since: std::sync::Mutex::new(Some(Instant::now())),
            started_at: std::sync::Mutex::new(None),
            last_error: std::sync::Mutex::new(None),
            logs: std::sync::Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            child: Mutex::new(None),
            http,
            startup_lock: Mutex::new(()),
        })
    }

    pub fn state(&self) -> ProcessState {
        state_from_atomic(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProcessState) {
        let prior = self.state();
        self.state.store(atomic_from_state(state), Ordering::Release);
        info!(model_id = %self.model_id, port = self.port, ?prior, new = ?state, "process state transition");
        self.events.publish(Event::ModelStatus { models: vec![self.snapshot()] });
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn idle_since(&self) -> Option<Instant> {
        *lock(&self.idle_since)
    }

    pub fn proxy_url(&self) -> &str {
        &self.proxy_url
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let uptime_secs = lock(&self.started_at).map(|t| t.elapsed().as_secs()).unwrap_or(0);
        ProcessSnapshot {
            model_id: self.model_id.clone(),
            state: self.state(),
            port: self.port,
            proxy_url: self.proxy_url.clone(),
            refcount: self.refcount(),
            uptime_secs,
            last_error: lock(&self.last_error).clone(),
        }
    }

    pub fn logs(&self, max_bytes: usize) -> String {
        let buf = lock(&self.logs);
        let skip = buf.len().saturating_sub(max_bytes);
        let bytes: Vec<u8> = buf.iter().skip(skip).copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Blocks until Ready or returns a typed failure. Concurrent callers
    /// share the same startup attempt via `startup_lock`.
    pub async fn ensure(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if self.state() == ProcessState::Ready {
            return Ok(());
        }

        let _guard = self.startup_lock.lock().await;
        if self.state() == ProcessState::Ready {
            return Ok(());
        }

        self.set_state(ProcessState::Starting);

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        // Each child gets its own OS process group so a later group-signal
        // terminates it and anything it forked.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.set_state(ProcessState::Failed);
                let reason = e.to_string();
                *lock(&self.last_error) = Some(reason.clone());
                return Err(SchedulerError::StartupFailed {
                    model: self.model_id.clone(),
                    reason,
                    logs: self.logs(4096),
                });
            }
        };
        let pid = child.id();
        debug!(model_id = %self.model_id, pid = ?pid, port = self.port, "spawned child process");

        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_pump(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_pump(stderr);
        }

        *self.child.lock().await = Some(child);
        *lock(&self.started_at) = Some(Instant::now());

        let outcome =
            health::probe_until_healthy(&self.http, self.port, &self.check_endpoint, self.health_check_timeout).await;

        match outcome {
            health::ProbeOutcome::Healthy => {
                self.set_state(ProcessState::Ready);
                *lock(&self.idle_since) = Some(Instant::now());
                self.spawn_exit_supervisor();
                Ok(())
            }
            health::ProbeOutcome::TimedOut => {
                warn!(model_id = %self.model_id, "startup health probe timed out");
                self.hard_kill().await;
                self.set_state(ProcessState::Failed);
                Err(SchedulerError::StartupTimeout {
                    model: self.model_id.clone(),
                    timeout_secs: self.health_check_timeout.as_secs(),
                })
            }
        }
    }

    /// Captures a child output stream line-by-line into the ring buffer and
    /// mirrors each line onto the `logData` event topic.
    fn spawn_log_pump<R>(self: &Arc<Self>, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut buf = lock(&process.logs);
                    for byte in line.bytes().chain(std::iter::once(b'\n')) {
                        if buf.len() >= LOG_RING_CAPACITY {
                            buf.pop_front();
                        }
                        buf.push_back(byte);
                    }
                }
                process.events.publish(Event::LogData {
                    source: LogSource::Upstream,
                    bytes: line,
                });
            }
        });
    }

    /// Watches a Ready child for an unexpected exit. `stop`/`shutdown` move
    /// the state off `Ready` before they reap the child themselves, so this
    /// task stands down the moment it observes that; it only acts when the
    /// exit was not part of a planned Stop (invariant: Ready ⇒ child alive).
    fn spawn_exit_supervisor(self: &Arc<Self>) {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if process.state() != ProcessState::Ready {
                    return;
                }
                let exited = {
                    let mut guard = process.child.lock().await;
                    match guard.as_mut() {
                        Some(child) => child.try_wait().ok().flatten(),
                        None => return,
                    }
                };
                if let Some(status) = exited {
                    // A graceful Stop may have flipped the state between the
                    // check above and reaping the exit; only the unplanned
                    // case is this supervisor's responsibility.
                    if process.state() == ProcessState::Ready {
                        warn!(model_id = %process.model_id, %status, "backend exited unexpectedly while ready");
                        *lock(&process.last_error) = Some(format!("backend exited unexpectedly: {status}"));
                        process.set_state(ProcessState::Failed);
                    }
                    return;
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        });
    }

    /// Reference an acquired Process for the duration of a proxied request.
    /// Fails fast if the Process is not Ready.
    pub fn acquire(self: &Arc<Self>) -> Result<Acquisition, SchedulerError> {
        if self.state() != ProcessState::Ready {
            return Err(SchedulerError::GroupBusy {
                group: self.group_id.clone(),
                model: self.model_id.clone(),
            });
        }
        self.refcount.fetch_add(1, Ordering::SeqCst);
        *lock(&self.idle_since) = None;
        // Re-check after incrementing: a racing Stop may have flipped state
        // out from under us between the check above and the increment.
        if self.state() != ProcessState::Ready {
            self.refcount.fetch_sub(1, Ordering::SeqCst);
            return Err(SchedulerError::GroupBusy {
                group: self.group_id.clone(),
                model: self.model_id.clone(),
            });
        }
        Ok(Acquisition { process: Arc::clone(self) })
    }

    /// Graceful or hard Stop. Graceful waits up to `health_check_timeout`
    /// for the refcount to drain and the child to exit before escalating to
    /// a hard kill of the whole process group.
    pub async fn stop(self: &Arc<Self>, graceful: bool) {
        if matches!(self.state(), ProcessState::Stopped | ProcessState::Shutdown) {
            return;
        }
        self.set_state(ProcessState::Stopping);

        if graceful {
            self.signal_group_terminate().await;

            let deadline = Instant::now() + self.health_check_timeout;
            loop {
                let drained = self.refcount() == 0;
                let exited = {
                    let mut guard = self.child.lock().await;
                    match guard.as_mut() {
                        Some(child) => matches!(child.try_wait(), Ok(Some(_))),
                        None => true,
                    }
                };
                if drained && exited {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(model_id = %self.model_id, "graceful stop deadline exceeded, forcing kill");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        self.hard_kill().await;
        self.set_state(ProcessState::Stopped);
    }

    /// Marks Shutdown (distinct from an ordinary Stop) and force-kills
    /// unconditionally, used by the Scheduler's whole-process shutdown path.
    pub async fn shutdown(self: &Arc<Self>) {
        self.hard_kill().await;
        self.set_state(ProcessState::Shutdown);
    }

    #[cfg(unix)]
    async fn signal_group_terminate(&self) {
        let pid = {
            let guard = self.child.lock().await;
            guard.as_ref().and_then(|c| c.id())
        };
        if let Some(pid) = pid {
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                debug!(model_id = %self.model_id, pid, "sent SIGTERM to process group");
                tokio::time::sleep(POLITE_WAIT).await;
            } else {
                warn!(model_id = %self.model_id, pid, "failed to signal process group");
            }
        }
    }

    #[cfg(not(unix))]
    async fn signal_group_terminate(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
        }
        tokio::time::sleep(POLITE_WAIT).await;
    }

    #[cfg(unix)]
    async fn hard_kill(&self) {
        let pid = {
            let guard = self.child.lock().await;
            guard.as_ref().and_then(|c| c.id())
        };
        if let Some(pid) = pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        *guard = None;
    }

    #[cfg(not(unix))]
    async fn hard_kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_atomic_encoding() {
        for state in [
            ProcessState::Stopped,
            ProcessState::Starting,
            ProcessState::Ready,
            ProcessState::Stopping,
            ProcessState::Failed,
            ProcessState::Shutdown,
        ] {
            assert_eq!(state_from_atomic(atomic_from_state(state)), state);
        }
    }

    fn test_process() -> Arc<Process> {
        Process::new(
            "m".to_string(),
            "g".to_string(),
            9999,
            "http://127.0.0.1:9999".to_string(),
            "/health".to_string(),
            vec!["/bin/sleep".to_string(), "30".to_string()],
            HashMap::new(),
            Duration::from_secs(20),
            reqwest::Client::new(),
            EventBus::new(),
        )
    }

    #[test]
    fn acquire_fails_when_not_ready() {
        let process = test_process();
        let result = process.acquire();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn acquisition_drop_resets_idle_timer() {
        let process = test_process();
        process.set_state(ProcessState::Ready);
        {
            let _acq = process.acquire().expect("should acquire while ready");
            assert_eq!(process.refcount(), 1);
            assert!(process.idle_since().is_none());
        }
        assert_eq!(process.refcount(), 0);
        assert!(process.idle_since().is_some());
    }

    #[test]
    fn logs_returns_at_most_max_bytes() {
        let process = test_process();
        {
            let mut buf = lock(&process.logs);
            for b in 0..100u8 {
                buf.push_back(b);
            }
        }
        let logs = process.logs(10);
        assert_eq!(logs.len(), 10);
    }

    #[tokio::test]
    async fn startup_failure_for_unspawnable_command_returns_typed_error() {
        let process = Process::new(
            "m".to_string(),
            "g".to_string(),
            9998,
            "http://127.0.0.1:9998".to_string(),
            "/health".to_string(),
            vec!["/nonexistent/binary/path".to_string()],
            HashMap::new(),
            Duration::from_secs(15),
            reqwest::Client::new(),
            EventBus::new(),
        );
        let result = process.ensure().await;
        assert!(matches!(result, Err(SchedulerError::StartupFailed { .. })));
        assert_eq!(process.state(), ProcessState::Failed);
    }

    #[tokio::test]
    async fn exit_supervisor_fails_process_on_unexpected_crash() {
        let process = test_process();
        let child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exit 1"])
            .spawn()
            .expect("spawning a short-lived child should succeed");
        *process.child.lock().await = Some(child);
        process.set_state(ProcessState::Ready);
        process.spawn_exit_supervisor();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if process.state() == ProcessState::Failed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("supervisor should detect the crash and fail the process");

        assert!(lock(&process.last_error).is_some());
    }

    #[tokio::test]
    async fn exit_supervisor_stands_down_once_a_planned_stop_changes_state() {
        let process = test_process();
        let child = tokio::process::Command::new("/bin/sleep")
            .arg("30")
            .spawn()
            .expect("spawning a long-lived child should succeed");
        *process.child.lock().await = Some(child);
        process.set_state(ProcessState::Ready);
        process.spawn_exit_supervisor();

        // A planned transition off Ready (as `stop`/`shutdown` perform)
        // should make the supervisor stand down without touching state.
        process.set_state(ProcessState::Stopping);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(process.state(), ProcessState::Stopping);

        process.hard_kill().await;
    }
}
