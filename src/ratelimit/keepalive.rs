//! Periodic store connectivity probe.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::store::CounterStore;

/// Background task pinging the store on a fixed interval.
///
/// Probing is best effort: a failed ping is logged and marks the store
/// unhealthy, and the next tick probes again. Admission calls never wait on
/// it. The task stops when the handle is dropped.
#[derive(Debug)]
pub struct Keepalive {
    state: Arc<ProbeState>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct ProbeState {
    healthy: AtomicBool,
    probes: AtomicU64,
}

impl Keepalive {
    /// Start probing `store` every `interval`. The first probe runs immediately.
    pub fn spawn<S>(store: Arc<S>, interval: Duration) -> Self
    where
        S: CounterStore + ?Sized + 'static,
    {
        let state = Arc::new(ProbeState {
            healthy: AtomicBool::new(true),
            probes: AtomicU64::new(0),
        });

        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let result = store.ping().await;
                task_state.probes.fetch_add(1, Ordering::Relaxed);

                match result {
                    Ok(()) => {
                        if !task_state.healthy.swap(true, Ordering::SeqCst) {
                            info!("Store keepalive recovered");
                        } else {
                            debug!("Store keepalive ok");
                        }
                    }
                    Err(e) => {
                        task_state.healthy.store(false, Ordering::SeqCst);
                        warn!(error = %e, "Store keepalive failed");
                    }
                }
            }
        });

        info!(interval_secs = interval.as_secs_f64(), "Store keepalive started");
        Self { state, handle }
    }

    /// Whether the most recent probe succeeded.
    pub fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }

    /// Number of probes completed so far.
    pub fn probe_count(&self) -> u64 {
        self.state.probes.load(Ordering::Relaxed)
    }

    /// Stop probing.
    pub fn shutdown(self) {
        self.handle.abort();
        info!(probes = self.probe_count(), "Store keepalive stopped");
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
