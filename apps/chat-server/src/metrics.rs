//! Prometheus recorder and the metric names used across the server.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder.
///
/// Returns the handle that renders `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render the Prometheus text exposition format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Open WebSocket connections on this process (gauge).
pub const ACTIVE_CONNECTIONS: &str = "chat_active_connections";
/// Rooms with at least one local member (gauge).
pub const ACTIVE_ROOMS: &str = "chat_active_rooms";
/// Chat messages accepted from clients (counter).
pub const MESSAGES_SENT_TOTAL: &str = "chat_messages_sent_total";
/// Events dropped because a member's outbound queue was full (counter).
pub const OUTBOUND_DROPPED_TOTAL: &str = "chat_outbound_dropped_total";
/// Failed broker publishes (counter).
pub const BROKER_PUBLISH_ERRORS_TOTAL: &str = "chat_broker_publish_errors_total";
/// Lost or failed broker subscriptions (counter).
pub const BROKER_SUBSCRIBE_ERRORS_TOTAL: &str = "chat_broker_subscribe_errors_total";
/// Relay payloads that failed to decode (counter).
pub const RELAY_DECODE_ERRORS_TOTAL: &str = "chat_relay_decode_errors_total";
/// Time spent handling one inbound event (histogram, labels: type).
pub const MESSAGE_LATENCY_SECONDS: &str = "chat_message_latency_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            ACTIVE_CONNECTIONS,
            ACTIVE_ROOMS,
            MESSAGES_SENT_TOTAL,
            OUTBOUND_DROPPED_TOTAL,
            BROKER_PUBLISH_ERRORS_TOTAL,
            BROKER_SUBSCRIBE_ERRORS_TOTAL,
            RELAY_DECODE_ERRORS_TOTAL,
            MESSAGE_LATENCY_SECONDS,
        ];
        for name in names {
            assert!(name.starts_with("chat_"), "{name} lacks the chat_ prefix");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
