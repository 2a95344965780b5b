//! Periodic maintenance timers
//!
//! Each timer is a tokio task that ticks an event into the core channel; the
//! sweeps themselves run inside the core task so they share the
//! single-owner state without locks.
//!
//! Cadences follow RFC 3261's 64*T1 = 32 s transaction horizon: branch and
//! dedup entries live 32 s, dialogs idle out after an hour, and the NAT
//! keepalive fires every 25 s to stay inside common 30 s NAT bindings.

use crate::transport::CoreEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub const REGISTRATION_SWEEP: Duration = Duration::from_secs(30);
pub const DIALOG_SWEEP: Duration = Duration::from_secs(60);
pub const BRANCH_SWEEP: Duration = Duration::from_secs(60);
pub const PENDING_SWEEP: Duration = Duration::from_secs(300);
pub const NAT_KEEPALIVE: Duration = Duration::from_secs(25);

fn tick_task(
    tx: mpsc::Sender<CoreEvent>,
    period: Duration,
    make_event: fn() -> CoreEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        loop {
            interval.tick().await;
            if tx.send(make_event()).await.is_err() {
                return;
            }
        }
    })
}

/// Spawn every maintenance timer; dropping the channel stops them all
pub fn spawn_timers(tx: mpsc::Sender<CoreEvent>) -> Vec<JoinHandle<()>> {
    info!("starting maintenance timers");
    vec![
        tick_task(tx.clone(), REGISTRATION_SWEEP, || {
            CoreEvent::SweepRegistrations
        }),
        tick_task(tx.clone(), DIALOG_SWEEP, || CoreEvent::SweepDialogs),
        tick_task(tx.clone(), BRANCH_SWEEP, || CoreEvent::SweepBranches),
        tick_task(tx.clone(), PENDING_SWEEP, || CoreEvent::SweepPending),
        tick_task(tx, NAT_KEEPALIVE, || CoreEvent::NatKeepalive),
    ]
}
