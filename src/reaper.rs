//! Background retirement of idle sessions.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::state::SessionRegistry;

/// Supervised sweep loop. Lives for the whole process and is cancelled
/// explicitly at shutdown; an in-flight sweep finishes before the task
/// exits.
pub struct Reaper {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Start sweeping every `period`, retiring connection-less sessions
    /// idle for at least `idle_after`.
    pub fn spawn(registry: SessionRegistry, period: Duration, idle_after: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let retired = registry.sweep_idle(Instant::now(), idle_after).await;
                        if !retired.is_empty() {
                            info!(count = retired.len(), "retired idle sessions");
                        }
                    }
                    _ = &mut stopped => {
                        debug!("reaper stopping");
                        break;
                    }
                }
            }
        });
        Self { stop, handle }
    }

    /// Signal the loop to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}
