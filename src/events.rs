//! Event Bus: in-process typed pub/sub, one channel per topic. Publishers
//! never block; slow subscribers drop the oldest event instead of stalling a
//! publisher. `modelStatus` gets its own `watch` channel so it coalesces to
//! the latest snapshot instead of queuing, matching §4.5's "only latest
//! matters" back-pressure rule; every other topic is a bounded `broadcast`
//! channel that drops the oldest entry on overflow.

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::process::ProcessSnapshot;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Event {
    #[serde(rename = "modelStatus")]
    ModelStatus { models: Vec<ProcessSnapshot> },
    #[serde(rename = "logData")]
    LogData { source: LogSource, bytes: String },
    #[serde(rename = "metrics")]
    Metrics { records: Vec<MetricRecord> },
    #[serde(rename = "configChanged")]
    ConfigChanged { phase: ReloadPhase },
    #[serde(rename = "downloadProgress")]
    DownloadProgress { id: String, info: String },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Proxy,
    Upstream,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadPhase {
    Start,
    End,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub model: String,
    pub group: String,
    pub outcome: &'static str,
    pub latency_ms: u64,
}

/// One `watch` channel for `modelStatus` (coalescing, latest-wins) plus one
/// bounded `broadcast` channel per remaining topic (drop-oldest). Per-topic
/// isolation means a burst on one topic can never evict a pending event on
/// another.
#[derive(Clone)]
pub struct EventBus {
    model_status: watch::Sender<Vec<ProcessSnapshot>>,
    log_data: broadcast::Sender<Event>,
    metrics: broadcast::Sender<Event>,
    config_changed: broadcast::Sender<Event>,
    download_progress: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (model_status, _) = watch::channel(Vec::new());
        let (log_data, _) = broadcast::channel(TOPIC_CAPACITY);
        let (metrics, _) = broadcast::channel(TOPIC_CAPACITY);
        let (config_changed, _) = broadcast::channel(TOPIC_CAPACITY);
        let (download_progress, _) = broadcast::channel(TOPIC_CAPACITY);
        Self { model_status, log_data, metrics, config_changed, download_progress }
    }

    /// Non-blocking publish, routed to the topic's own channel.
    /// `modelStatus` overwrites the watch cell (coalesced); the rest push
    /// onto their bounded broadcast channel, which drops the oldest entry
    /// once a lagging subscriber falls behind its buffer. No subscribers is
    /// not an error; it just means nobody is listening yet.
    pub fn publish(&self, event: Event) {
        match event {
            Event::ModelStatus { models } => {
                let _ = self.model_status.send(models);
            }
            other @ (Event::LogData { .. } | Event::Metrics { .. } | Event::ConfigChanged { .. } | Event::DownloadProgress { .. }) => {
                let sender = match &other {
                    Event::LogData { .. } => &self.log_data,
                    Event::Metrics { .. } => &self.metrics,
                    Event::ConfigChanged { .. } => &self.config_changed,
                    Event::DownloadProgress { .. } => &self.download_progress,
                    Event::ModelStatus { .. } => unreachable!(),
                };
                let _ = sender.send(other);
            }
        }
    }

    /// Subscribes to every topic at once, for a consumer (the SSE surface,
    /// or a test) that wants a single combined stream of events.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            model_status: self.model_status.subscribe(),
            log_data: self.log_data.subscribe(),
            metrics: self.metrics.subscribe(),
            config_changed: self.config_changed.subscribe(),
            download_progress: self.download_progress.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription across every topic. Per-topic FIFO is preserved
/// (each topic's own channel is consumed in order); there is no ordering
/// guarantee across topics, matching §4.5.
pub struct Subscription {
    model_status: watch::Receiver<Vec<ProcessSnapshot>>,
    log_data: broadcast::Receiver<Event>,
    metrics: broadcast::Receiver<Event>,
    config_changed: broadcast::Receiver<Event>,
    download_progress: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Waits for the next event on any topic. A lagging broadcast topic
    /// (overflow already dropped its oldest entries) is swallowed and
    /// retried rather than surfaced as an error: the drop already happened,
    /// there is nothing actionable left to report.
    pub async fn recv(&mut self) -> Event {
        loop {
            tokio::select! {
                changed = self.model_status.changed() => {
                    if changed.is_err() {
                        std::future::pending::<()>().await;
                        unreachable!();
                    }
                    let models = self.model_status.borrow_and_update().clone();
                    return Event::ModelStatus { models };
                }
                res = self.log_data.recv() => {
                    if let Ok(event) = res { return event; }
                }
                res = self.metrics.recv() => {
                    if let Ok(event) = res { return event; }
                }
                res = self.config_changed.recv() => {
                    if let Ok(event) = res { return event; }
                }
                res = self.download_progress.recv() => {
                    if let Ok(event) = res { return event; }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event_on_its_own_topic() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(Event::ConfigChanged { phase: ReloadPhase::Start });
        let received = sub.recv().await;
        assert!(matches!(received, Event::ConfigChanged { phase: ReloadPhase::Start }));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::DownloadProgress {
            id: "m".into(),
            info: "50%".into(),
        });
    }

    #[tokio::test]
    async fn model_status_coalesces_to_latest_snapshot() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(Event::ModelStatus { models: vec![] });
        // A burst of intermediate snapshots before anyone observes them:
        // only the last one should ever be seen, never a backlog of all three.
        for i in 0..5u64 {
            bus.publish(Event::ModelStatus {
                models: vec![ProcessSnapshot {
                    model_id: "m".to_string(),
                    state: crate::process::ProcessState::Ready,
                    port: 9000,
                    proxy_url: "http://127.0.0.1:9000".to_string(),
                    refcount: i as usize,
                    uptime_secs: i,
                    last_error: None,
                }],
            });
        }

        let received = sub.recv().await;
        match received {
            Event::ModelStatus { models } => {
                assert_eq!(models.len(), 1);
                assert_eq!(models[0].uptime_secs, 4);
            }
            other => panic!("expected ModelStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_burst_on_one_topic_never_evicts_a_pending_event_on_another() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(Event::ConfigChanged { phase: ReloadPhase::Start });
        for _ in 0..(TOPIC_CAPACITY + 10) {
            bus.publish(Event::LogData { source: LogSource::Upstream, bytes: "noise".to_string() });
        }

        // The configChanged event lives on its own channel; the logData
        // burst overflowing its own channel cannot have dropped it.
        let mut saw_config_changed = false;
        for _ in 0..(TOPIC_CAPACITY + 10) {
            if matches!(sub.recv().await, Event::ConfigChanged { .. }) {
                saw_config_changed = true;
                break;
            }
        }
        assert!(saw_config_changed, "configChanged should survive a logData burst on a separate topic");
    }

    #[tokio::test]
    async fn lagging_log_topic_does_not_hang_the_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for _ in 0..(TOPIC_CAPACITY + 10) {
            bus.publish(Event::LogData { source: LogSource::Upstream, bytes: "x".to_string() });
        }
        let received = sub.recv().await;
        assert!(matches!(received, Event::LogData { .. }));
    }
}
