//! Background maintenance task
//!
//! Runs every `reload_interval`: picks up configuration changes, reaps
//! exited children and drops sessions whose process is gone.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::launcher::process;
use crate::state::SharedState;

/// One maintenance pass; returns the number of sessions invalidated
pub fn run_maintenance_once(state: &SharedState) -> usize {
    if state.reconfigure() {
        info!("configuration reloaded");
    }

    let exited = state.supervisor.reap();
    if !exited.is_empty() {
        debug!("reaped children: {:?}", exited);
    }

    let mut dropped = 0;
    for client in state.clients.all() {
        for session in client.sessions() {
            let Some(pid) = session.pid() else { continue };
            if !process::is_alive(pid) {
                info!("{}: session {} lost its process {}", client.user(), session.id(), pid);
                state.invalidate_session(&session);
                dropped += 1;
            }
        }
    }

    state.scheduler.recompute(&state.clients);
    dropped
}

/// Run [`run_maintenance_once`] periodically until shutdown
pub async fn run_maintenance_loop(state: SharedState) {
    let period = state.config().reload_interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown_rx = state.subscribe_shutdown();

    // The first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_maintenance_once(&state);
            }
            _ = shutdown_rx.recv() => {
                debug!("maintenance task stopping");
                break;
            }
        }
    }
}
