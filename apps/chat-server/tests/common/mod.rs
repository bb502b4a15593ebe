#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chat_common::{Event, EventType, Message};
use tokio::sync::mpsc;

use chat_server::broker::memory::MemoryBroker;
use chat_server::config::Config;
use chat_server::hub::{Connection, ConnectionSettings, Hub};
use chat_server::AppState;

pub fn test_config(server_name: &str) -> Config {
    Config {
        server_name: server_name.to_string(),
        port: 0,
        redis_url: None,
        allowed_origins: Vec::new(),
        pong_wait_secs: 60,
        write_wait_secs: 10,
        max_message_size: 512,
        presence_ttl_secs: 3600,
        broker_timeout_secs: 5,
        empty_room_grace_secs: 600,
    }
}

/// Build a started hub on `broker`. Hubs built on clones of the same broker
/// behave like separate server processes sharing one backplane.
pub async fn test_hub(broker: &MemoryBroker, server_name: &str) -> Hub {
    let config = test_config(server_name);
    let hub = Hub::new(Arc::new(broker.clone()), config.hub_settings());
    hub.start().await.expect("start hub");
    hub
}

/// Build a test AppState backed by the in-memory broker.
pub async fn test_state() -> AppState {
    test_state_with(test_config("srv_test")).await
}

pub async fn test_state_with(config: Config) -> AppState {
    let broker = MemoryBroker::new();
    let hub = Hub::new(Arc::new(broker), config.hub_settings());
    hub.start().await.expect("start hub");

    AppState {
        hub,
        config: Arc::new(config),
        metrics: None,
    }
}

pub async fn test_app() -> (Router, AppState) {
    let state = test_state().await;
    let app = chat_server::routes::router().with_state(state.clone());
    (app, state)
}

/// Start a real TCP server for WebSocket testing.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = chat_server::routes::router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// A connection with no socket: events are read straight off its queue.
pub fn client(username: &str) -> (Arc<Connection>, mpsc::Receiver<Event>) {
    let conn = Connection::new(username, ConnectionSettings::default());
    let rx = conn.take_outbound().expect("fresh outbound queue");
    (conn, rx)
}

pub fn event(kind: EventType, room_id: &str, content: &str) -> Event {
    Event::new(
        kind,
        Message {
            room_id: room_id.to_string(),
            content: content.to_string(),
            ..Message::default()
        },
    )
}

/// Receive the next event or fail after a second.
pub async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("outbound queue closed")
}

/// Assert nothing else arrives within a short grace period.
pub async fn assert_quiet(rx: &mut mpsc::Receiver<Event>) {
    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "unexpected event: {extra:?}");
}
