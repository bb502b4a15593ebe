//! Keeps this process's presence counters alive while it hosts rooms, and
//! drops local rooms that stayed empty past their grace period.

use tokio::time::{self, Instant};

use super::Hub;

pub(super) async fn run(hub: Hub) {
    let period = hub.settings().presence_refresh;
    if period.is_zero() {
        tracing::warn!("presence refresh disabled");
        return;
    }

    let shutdown = hub.shutdown_token();
    let mut ticker = time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let refreshed = refresh(&hub).await;
                let evicted = hub.evict_idle_rooms();
                tracing::debug!(refreshed, evicted, "presence refreshed");
            }
        }
    }
}

/// Rewrite the presence counter of every locally hosted room.
pub(crate) async fn refresh(hub: &Hub) -> usize {
    let mut refreshed = 0;
    for room in hub.rooms_snapshot() {
        let members = room.member_count();
        if members == 0 {
            continue;
        }
        hub.set_presence(room.id(), members).await;
        refreshed += 1;
    }
    refreshed
}
