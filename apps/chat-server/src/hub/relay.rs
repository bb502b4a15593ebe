//! Re-broadcasts broker traffic to the rooms hosted by this process.

use std::time::Duration;

use chat_common::RelayMessage;
use futures_util::StreamExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerMessage, Subscription, ROOM_PATTERN};
use crate::metrics::{BROKER_SUBSCRIBE_ERRORS_TOTAL, RELAY_DECODE_ERRORS_TOTAL};

use super::Hub;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

pub(super) async fn run(hub: Hub, mut subscription: Subscription) {
    let shutdown = hub.shutdown_token();
    tracing::info!(server_id = %hub.server_id(), "relay subscriber started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = subscription.next() => match msg {
                Some(msg) => {
                    deliver(&hub, &msg);
                }
                None => {
                    counter!(BROKER_SUBSCRIBE_ERRORS_TOTAL).increment(1);
                    tracing::warn!("relay subscription ended, resubscribing");
                    match resubscribe(&hub, &shutdown).await {
                        Some(fresh) => subscription = fresh,
                        None => break,
                    }
                }
            },
        }
    }

    tracing::info!(server_id = %hub.server_id(), "relay subscriber stopped");
}

async fn resubscribe(hub: &Hub, shutdown: &CancellationToken) -> Option<Subscription> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
        }

        match hub.broker_call(hub.broker().psubscribe(ROOM_PATTERN)).await {
            Ok(subscription) => {
                tracing::info!("relay resubscribed");
                return Some(subscription);
            }
            Err(err) => {
                counter!(BROKER_SUBSCRIBE_ERRORS_TOTAL).increment(1);
                tracing::warn!(%err, "relay resubscribe failed");
            }
        }
    }
}

/// Hand one broker payload to the matching local room. Returns how many
/// local members received it.
///
/// Messages published by this process are skipped: the publishing handler
/// already delivered them locally.
pub(crate) fn deliver(hub: &Hub, msg: &BrokerMessage) -> usize {
    let relay: RelayMessage = match serde_json::from_str(&msg.payload) {
        Ok(relay) => relay,
        Err(err) => {
            counter!(RELAY_DECODE_ERRORS_TOTAL).increment(1);
            tracing::warn!(channel = %msg.channel, ?err, "undecodable relay payload");
            return 0;
        }
    };

    if relay.server_id == hub.server_id() {
        return 0;
    }

    let Some(room) = hub.room(&relay.room_id) else {
        tracing::trace!(room_id = %relay.room_id, "room not hosted here, skipping");
        return 0;
    };

    let delivered = room.broadcast(&relay.event, None);
    tracing::debug!(
        room_id = %relay.room_id,
        origin = %relay.server_id,
        event_type = %relay.event.kind,
        delivered,
        "relayed event"
    );
    delivered
}
