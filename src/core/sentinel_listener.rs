//! Failover notifications from a single Sentinel.
//!
//! Each listener keeps one `+switch-master` subscription open against its
//! Sentinel, reconnecting with bounded exponential backoff until shut down.
//! Whenever it learns the master's address, either from an event or from the
//! catch-up query made on every (re)connect, it hands that address to a
//! [`FailoverHandler`]. Handlers must tolerate repeats: every listener reports
//! the same failover.

use crate::core::address::{AddressError, HostAndPort};
use crate::core::connection::ConnectionError;
use crate::core::connection_pool::{ConnectionSettings, Credentials};
use crate::core::discovery::{open_sentinel_connection, query_master_address};
use crate::core::metrics::AtomicPoolMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Receives master addresses reported by Sentinel listeners
#[async_trait]
pub trait FailoverHandler: Send + Sync {
    /// `new_master` is where a Sentinel says `master_name` now lives
    async fn on_master_switch(&self, master_name: &str, new_master: HostAndPort);
}

/// Payload of a `+switch-master` message:
/// `<master-name> <old-ip> <old-port> <new-ip> <new-port>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchMasterEvent {
    pub master_name: String,
    pub old_master: HostAndPort,
    pub new_master: HostAndPort,
}

impl SwitchMasterEvent {
    pub fn parse(payload: &str) -> Result<Self, ListenerError> {
        let parts: Vec<&str> = payload.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ListenerError::MalformedEvent(payload.to_string()));
        }

        Ok(Self {
            master_name: parts[0].to_string(),
            old_master: HostAndPort::from_parts(parts[1], parts[2])?,
            new_master: HostAndPort::from_parts(parts[3], parts[4])?,
        })
    }
}

/// Reconnect delay: doubles from `initial` up to `max`, retried forever
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerBackoff {
    initial: Duration,
    max: Duration,
}

impl ListenerBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for ListenerBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(5000))
    }
}

/// Decrements the active listener gauge however the task ends
struct ActiveListener(Arc<AtomicPoolMetrics>);

impl ActiveListener {
    fn new(metrics: Arc<AtomicPoolMetrics>) -> Self {
        metrics.listener_started();
        Self(metrics)
    }
}

impl Drop for ActiveListener {
    fn drop(&mut self) {
        self.0.listener_stopped();
    }
}

pub struct SentinelListener {
    sentinel: HostAndPort,
    master_name: String,
    settings: ConnectionSettings,
    credentials: Credentials,
    backoff: ListenerBackoff,
    handler: Arc<dyn FailoverHandler>,
    metrics: Arc<AtomicPoolMetrics>,
}

impl SentinelListener {
    pub fn new(
        sentinel: HostAndPort,
        master_name: String,
        settings: ConnectionSettings,
        credentials: Credentials,
        backoff: ListenerBackoff,
        handler: Arc<dyn FailoverHandler>,
        metrics: Arc<AtomicPoolMetrics>,
    ) -> Self {
        Self {
            sentinel,
            master_name,
            settings,
            credentials,
            backoff,
            handler,
            metrics,
        }
    }

    pub fn sentinel(&self) -> &HostAndPort {
        &self.sentinel
    }

    /// Run the listener on its own task until `shutdown` flips to true or its sender drops
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let _active = ActiveListener::new(Arc::clone(&self.metrics));
        let mut attempt = 0u32;

        debug!(sentinel = %self.sentinel, master = %self.master_name, "Sentinel listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = tokio::select! {
                result = self.listen(&mut attempt) => result,
                _ = shutdown.changed() => break,
            };

            if let Err(e) = result {
                let delay = self.backoff.delay(attempt);
                warn!(
                    sentinel = %self.sentinel,
                    "Lost connection to sentinel ({}), retrying in {:?}",
                    e,
                    delay
                );
                self.metrics.record_listener_reconnect();
                attempt = attempt.saturating_add(1);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        debug!(sentinel = %self.sentinel, "Sentinel listener stopped");
    }

    /// One subscription lifetime; only returns when the connection fails
    async fn listen(&self, attempt: &mut u32) -> Result<(), ConnectionError> {
        // Catch up on any failover missed while disconnected
        match query_master_address(
            &self.sentinel,
            &self.master_name,
            &self.settings,
            &self.credentials,
        )
        .await?
        {
            Some(master) => self.handler.on_master_switch(&self.master_name, master).await,
            None => warn!(
                sentinel = %self.sentinel,
                "Sentinel no longer knows master '{}'",
                self.master_name
            ),
        }

        let mut conn =
            open_sentinel_connection(&self.sentinel, &self.settings, &self.credentials).await?;
        conn.subscribe(SWITCH_MASTER_CHANNEL).await?;
        info!(sentinel = %self.sentinel, "Subscribed to {}", SWITCH_MASTER_CHANNEL);
        *attempt = 0;

        loop {
            let (_, payload) = conn.next_message().await?;
            let payload = String::from_utf8_lossy(&payload);

            match SwitchMasterEvent::parse(&payload) {
                Ok(event) if event.master_name == self.master_name => {
                    info!(
                        sentinel = %self.sentinel,
                        master = %event.master_name,
                        from = %event.old_master,
                        to = %event.new_master,
                        "Received switch-master event"
                    );
                    self.handler
                        .on_master_switch(&event.master_name, event.new_master)
                        .await;
                }
                Ok(event) => {
                    debug!("Ignoring switch-master for unrelated master '{}'", event.master_name);
                }
                Err(e) => warn!("Ignoring {} message: {}", SWITCH_MASTER_CHANNEL, e),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Malformed switch-master payload: '{0}'")]
    MalformedEvent(String),
    #[error("Invalid address in switch-master payload: {0}")]
    InvalidAddress(#[from] AddressError),
}
