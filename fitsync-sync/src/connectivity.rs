/// Connectivity observer
///
/// The host platform reports online/offline transitions here. Once an engine
/// is started with the observer, a sync pass is triggered at start when
/// online, on every offline to online transition, and on a fixed interval
/// while online.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::engine::SyncEngine;

/// Why a pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Reconnect,
    Timer,
}

/// Source of truth for connectivity
pub struct ConnectivityObserver {
    state: watch::Sender<bool>,
}

impl ConnectivityObserver {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    /// Report the current connectivity; repeated reports of the same state
    /// are ignored
    pub fn set_online(&self, online: bool) {
        self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Trigger loop run by [`SyncEngine::start`]
pub(crate) async fn observe(
    engine: SyncEngine,
    mut online_rx: watch::Receiver<bool>,
    period: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut online = *online_rx.borrow_and_update();
    engine.set_online(online);
    if online {
        fire(&engine, Trigger::Startup);
    }

    // First tick one period from now, not immediately
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut source_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Offline: wait for the reconnect instead
                if online {
                    fire(&engine, Trigger::Timer);
                }
            }
            changed = online_rx.changed(), if source_open => {
                if changed.is_err() {
                    tracing::debug!("connectivity source dropped, keeping last known state");
                    source_open = false;
                    continue;
                }
                let now = *online_rx.borrow_and_update();
                engine.set_online(now);
                if now && !online {
                    fire(&engine, Trigger::Reconnect);
                }
                online = now;
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("connectivity observer shutting down");
                break;
            }
        }
    }
}

fn fire(engine: &SyncEngine, trigger: Trigger) {
    tracing::debug!(?trigger, "sync triggered");
    let engine = engine.clone();
    tokio::spawn(async move {
        match engine.sync_now().await {
            Ok(outcome) => tracing::debug!(?trigger, ?outcome, "triggered sync finished"),
            Err(e) => tracing::warn!(?trigger, error = %e, "triggered sync failed"),
        }
    });
}
