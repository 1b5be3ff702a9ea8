//! Background sweeper for abandoned upload sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::assembler::Assembler;

/// Every `interval`, reclaim sessions idle for longer than the
/// assembler's TTL. Stops once `shutdown` is set.
pub fn spawn(
    assembler: Arc<Assembler>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let reclaimed = assembler.reclaim_idle().await;
            if reclaimed > 0 {
                info!("Reclaimed {reclaimed} abandoned upload session(s)");
            } else {
                debug!("No abandoned upload sessions");
            }
        }
        debug!("Reclaim task stopped");
    })
}
