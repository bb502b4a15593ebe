//! Redial policy for connections whose write path fails transiently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::HubError;

use super::connection::Connection;

/// Opens a fresh socket to the same peer.
#[async_trait]
pub trait Dialer<S>: Send + Sync {
    async fn dial(&self) -> Result<S, HubError>;
}

/// How many times to redial, and how long to wait between attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// A [`ReconnectPolicy`] bound to the dialer that can restore one connection.
pub struct Reconnector<S> {
    policy: ReconnectPolicy,
    dialer: Arc<dyn Dialer<S>>,
}

impl<S> Reconnector<S> {
    pub fn new(policy: ReconnectPolicy, dialer: Arc<dyn Dialer<S>>) -> Self {
        Self { policy, dialer }
    }

    /// Redial until a socket is obtained or the attempts run out.
    ///
    /// Gives up early once the connection stops being active, so a close
    /// issued elsewhere is never undone by a late redial.
    pub async fn redial(&self, conn: &Connection) -> Option<S> {
        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = conn.closed() => return None,
                    _ = tokio::time::sleep(self.policy.backoff) => {}
                }
            }
            if !conn.is_active() {
                return None;
            }

            match self.dialer.dial().await {
                Ok(socket) => {
                    tracing::info!(conn_id = %conn.id(), attempt, "connection redialed");
                    return Some(socket);
                }
                Err(err) => {
                    tracing::warn!(conn_id = %conn.id(), attempt, %err, "redial attempt failed");
                }
            }
        }

        tracing::error!(
            conn_id = %conn.id(),
            attempts = self.policy.max_attempts,
            "giving up on reconnection"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::hub::connection::ConnectionSettings;

    struct FlakyDialer {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Dialer<u32> for FlakyDialer {
        async fn dial(&self) -> Result<u32, HubError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(call)
            } else {
                Err(HubError::ConnectionClosed)
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn redial_retries_until_success() {
        let dialer = Arc::new(FlakyDialer {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        });
        let reconnector = Reconnector::new(fast_policy(3), dialer.clone());
        let conn = Connection::new("alice", ConnectionSettings::default());

        assert_eq!(reconnector.redial(&conn).await, Some(3));
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn redial_gives_up_after_max_attempts() {
        let dialer = Arc::new(FlakyDialer {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
        });
        let reconnector = Reconnector::new(fast_policy(2), dialer.clone());
        let conn = Connection::new("alice", ConnectionSettings::default());

        assert_eq!(reconnector.redial(&conn).await, None);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn redial_skipped_for_closed_connection() {
        let dialer = Arc::new(FlakyDialer {
            calls: AtomicU32::new(0),
            succeed_on: 1,
        });
        let reconnector = Reconnector::new(fast_policy(3), dialer.clone());
        let conn = Connection::new("alice", ConnectionSettings::default());
        conn.close();

        assert_eq!(reconnector.redial(&conn).await, None);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }
}
