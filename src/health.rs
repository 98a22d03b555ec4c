//! Backend reachability monitor.
//!
//! The monitor probes the store on a fixed interval and publishes only state
//! changes. The first resolved probe always publishes, since before it the
//! state is unknown.

use std::time::Duration;

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::storage::Store;

pub const TRANSITION_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Up,
    Down,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => f.write_str("UP"),
            Self::Down => f.write_str("DOWN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: Option<Connectivity>,
    pub to: Connectivity,
    /// Probe failure that caused a transition to `Down`.
    pub reason: Option<String>,
}

/// Remembers the last published state and reports edges only.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    last: Option<Connectivity>,
}

impl EdgeDetector {
    pub fn observe(&mut self, state: Connectivity) -> Option<(Option<Connectivity>, Connectivity)> {
        if self.last == Some(state) {
            return None;
        }
        let previous = self.last.replace(state);
        Some((previous, state))
    }

    pub fn current(&self) -> Option<Connectivity> {
        self.last
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl HealthSettings {
    pub fn from_config(config: &crate::config::HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            probe_timeout: config.timeout(),
        }
    }
}

#[derive(Debug)]
pub struct HealthMonitorHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl HealthMonitorHandle {
    /// Signals the loop and waits for it; no probe starts after this returns.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(());
        let _ = self.join.await;
    }
}

/// Starts the probe loop, returning its handle and the transition receiver.
pub fn spawn_monitor(
    store: Store,
    settings: HealthSettings,
) -> (HealthMonitorHandle, mpsc::Receiver<Transition>) {
    let (events_tx, events_rx) = mpsc::channel(TRANSITION_CHANNEL_CAPACITY);
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join = tokio::spawn(async move {
        let mut detector = EdgeDetector::default();
        loop {
            let probe = tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                probe = tokio::time::timeout(settings.probe_timeout, store.ping()) => probe,
            };
            let (state, reason) = match probe {
                Ok(Ok(())) => (Connectivity::Up, None),
                Ok(Err(err)) => (Connectivity::Down, Some(err.to_string())),
                Err(_) => (
                    Connectivity::Down,
                    Some(format!("probe exceeded {:?}", settings.probe_timeout)),
                ),
            };

            if let Some((from, to)) = detector.observe(state) {
                let transition = Transition { from, to, reason };
                if let Err(mpsc::error::TrySendError::Full(dropped)) =
                    events_tx.try_send(transition)
                {
                    tracing::warn!(
                        state = %dropped.to,
                        "health transition channel full; dropping event"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep(settings.interval) => {}
            }
        }
        tracing::info!("health monitor stopped");
    });

    (HealthMonitorHandle { stop_tx, join }, events_rx)
}

/// Drains transitions into the log until the monitor side closes.
pub fn spawn_transition_logger(mut events: mpsc::Receiver<Transition>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(transition) = events.recv().await {
            match transition.to {
                Connectivity::Up => tracing::info!(
                    previous = ?transition.from,
                    "backend is UP"
                ),
                Connectivity::Down => tracing::warn!(
                    previous = ?transition.from,
                    reason = transition.reason.as_deref().unwrap_or("unknown"),
                    "backend is DOWN, check connection"
                ),
            }
        }
    })
}
