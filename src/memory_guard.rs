//! Memory Guard: periodically checks free host memory and evicts Processes
//! under pressure, tiered non-persistent-before-persistent, then by LRU
//! idle age, then by a resident-size tiebreak.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::interfaces::SystemProbe;
use crate::process::ProcessState;
use crate::scheduler::Scheduler;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(scheduler: Arc<Scheduler>, probe: Arc<dyn SystemProbe>, shutdown: tokio_util::sync::CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = shutdown.cancelled() => {
                info!("memory guard stopping");
                return;
            }
        }

        let threshold = scheduler.config().min_free_memory_percent;
        if threshold <= 0.0 {
            continue;
        }

        loop {
            let totals = probe.memory_totals();
            if totals.free_percent() >= threshold {
                break;
            }

            let Some((group, victim)) = pick_victim(&scheduler) else {
                warn!(free_percent = totals.free_percent(), threshold, "memory pressure but no eligible victim");
                break;
            };

            info!(
                model_id = %victim.model_id,
                free_percent = totals.free_percent(),
                threshold,
                "memory guard evicting idle process"
            );
            group.stop_member(&victim.model_id, true).await;
        }
    }
}

/// Non-persistent groups before persistent; within a tier, largest idle
/// age first; ties broken by a larger estimated resident footprint
/// (approximated here by uptime, since this crate has no direct RSS probe
/// per process — the host-wide `SystemProbe` only reports aggregate totals).
fn pick_victim(scheduler: &Scheduler) -> Option<(Arc<crate::group::Group>, Arc<crate::process::Process>)> {
    let mut candidates: Vec<(Arc<crate::group::Group>, Arc<crate::process::Process>)> = scheduler
        .live_processes()
        .into_iter()
        .filter(|(group, process)| !group.persistent && process.state() == ProcessState::Ready)
        .collect();

    candidates.sort_by(|(_, a), (_, b)| {
        let a_idle = a.idle_since().map(|t| t.elapsed()).unwrap_or_default();
        let b_idle = b.idle_since().map(|t| t.elapsed()).unwrap_or_default();
        b_idle.cmp(&a_idle).then_with(|| b.snapshot().uptime_secs.cmp(&a.snapshot().uptime_secs))
    });

    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::interfaces::MemoryTotals;

    struct FixedProbe(MemoryTotals);
    impl SystemProbe for FixedProbe {
        fn memory_totals(&self) -> MemoryTotals {
            self.0
        }
    }

    #[tokio::test]
    async fn no_victim_when_no_processes_running() {
        let config = Config::parse(
            r#"
minFreeMemoryPercent: 50
models:
  a:
    cmd: "/bin/sleep ${PORT}"
"#,
        )
        .unwrap();
        let scheduler = Scheduler::new(config, reqwest::Client::new(), EventBus::new());
        assert!(pick_victim(&scheduler).is_none());
    }

    #[test]
    fn probe_above_threshold_short_circuits() {
        let probe = FixedProbe(MemoryTotals { total_bytes: 100, free_bytes: 80 });
        assert!(probe.memory_totals().free_percent() >= 50.0);
    }
}
