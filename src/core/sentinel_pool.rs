use crate::config::{ConfigError, PoolConfig, SentinelPoolConfig};
use crate::core::address::HostAndPort;
use crate::core::connection::{ConnectionError, RedisConnection};
use crate::core::connection_pool::{
    ConnectionPoolBuilder, ConnectionSettings, Credentials, ExhaustionPolicy,
    OwnedRedisConnection, RedisConnectionManager, RedisPool,
};
use crate::core::discovery::discover_master;
use crate::core::metrics::{AtomicPoolMetrics, MetricsSnapshot};
use crate::core::sentinel_listener::{FailoverHandler, ListenerBackoff, SentinelListener};
use async_trait::async_trait;
use bb8::RunError;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The master address plus everything needed to re-point the pool at a new one
struct MasterState {
    master_name: String,
    current_master: tokio::sync::Mutex<HostAndPort>,
    manager: RedisConnectionManager,
    metrics: Arc<AtomicPoolMetrics>,
}

#[async_trait]
impl FailoverHandler for MasterState {
    async fn on_master_switch(&self, master_name: &str, new_master: HostAndPort) {
        if master_name != self.master_name || self.manager.is_closed() {
            return;
        }

        let mut current = self.current_master.lock().await;
        if *current == new_master {
            debug!(master = %self.master_name, %new_master, "Master unchanged");
            return;
        }

        // Idle and returning connections to the old master now fail validation
        self.manager.set_target(new_master.clone());
        let previous = std::mem::replace(&mut *current, new_master);
        self.metrics.record_failover();

        info!(
            master = %self.master_name,
            from = %previous,
            to = %*current,
            "Master changed, re-pointed pool"
        );
    }
}

/// A connection pool that follows the master of a Sentinel-monitored group.
///
/// The pool asks the Sentinels for the master when it is built, keeps a
/// `+switch-master` listener on each of them, and re-points new connections
/// whenever the master moves. Connections are borrowed with
/// [`get_resource`](Self::get_resource) and go back to the pool when the
/// returned [`PooledResource`] is dropped or closed.
pub struct SentinelPool {
    shared: Arc<MasterState>,
    pool: RwLock<Option<RedisPool>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    sentinels: Vec<HostAndPort>,
    exhaustion: ExhaustionPolicy,
    max_total: u32,
}

impl SentinelPool {
    pub fn builder(master_name: impl Into<String>) -> SentinelPoolBuilder {
        SentinelPoolBuilder::new(master_name)
    }

    /// Build a pool around a caller-owned factory, e.g. to rotate credentials through it
    pub async fn with_manager(
        master_name: impl Into<String>,
        sentinels: Vec<HostAndPort>,
        pool_config: PoolConfig,
        manager: RedisConnectionManager,
    ) -> Result<Self, SentinelPoolError> {
        Self::builder(master_name)
            .sentinels(sentinels)
            .pool_config(pool_config)
            .manager(manager)
            .build()
            .await
    }

    pub async fn from_config(config: &SentinelPoolConfig) -> Result<Self, SentinelPoolError> {
        config.validate()?;

        Self::builder(config.master_name.clone())
            .sentinels(config.sentinel_addresses()?)
            .pool_config(config.pool.clone())
            .connection_settings(config.connection_settings())
            .credentials(config.credentials())
            .sentinel_credentials(config.sentinel_credentials())
            .listener_backoff(config.listener.backoff())
            .build()
            .await
    }

    /// Borrow a validated connection to the current master
    pub async fn get_resource(&self) -> Result<PooledResource, SentinelPoolError> {
        if self.is_closed() {
            return Err(SentinelPoolError::PoolClosed);
        }
        let pool = self
            .pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SentinelPoolError::PoolClosed)?;

        if self.exhaustion == ExhaustionPolicy::FailFast {
            let state = pool.state();
            if state.idle_connections == 0 && state.connections >= self.max_total {
                return Err(SentinelPoolError::PoolExhausted);
            }
        }

        // Subscribe before checking out so failures caused by this borrow are seen
        let mut failures = self.shared.manager.subscribe_failures();
        let shutdown = self.shutdown_tx.subscribe();

        let checkout = async {
            pool.get_owned().await.map_err(|e| match e {
                RunError::User(e) => SentinelPoolError::from(e),
                RunError::TimedOut if self.exhaustion == ExhaustionPolicy::FailFast => {
                    SentinelPoolError::PoolExhausted
                }
                RunError::TimedOut => SentinelPoolError::TimedOut,
            })
        };

        let conn = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => return Err(SentinelPoolError::PoolClosed),
            e = next_failure(&mut failures) => {
                debug!(master = %self.shared.master_name, "Borrow failed: {}", e);
                return Err(if self.is_closed() {
                    SentinelPoolError::PoolClosed
                } else {
                    SentinelPoolError::from(e)
                });
            }
            result = checkout => result?,
        };

        // Close may have started while we were waiting
        if self.is_closed() {
            return Err(SentinelPoolError::PoolClosed);
        }

        Ok(PooledResource { conn })
    }

    /// Stop the listeners and close every idle connection. Safe to call repeatedly.
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(master = %self.shared.master_name, "Closing sentinel pool");
        self.shared.manager.mark_closed();
        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Sentinel listener task ended abnormally: {}", e);
            }
        }

        // Dropping the last pool handle closes the idle connections
        let pool = self
            .pool
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(pool);
    }

    /// Alias of [`destroy`](Self::destroy)
    pub async fn close(&self) {
        self.destroy().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn master_name(&self) -> &str {
        &self.shared.master_name
    }

    pub async fn current_master(&self) -> HostAndPort {
        self.shared.current_master.lock().await.clone()
    }

    pub fn sentinels(&self) -> &[HostAndPort] {
        &self.sentinels
    }

    /// The connection factory; clones share its target and credentials
    pub fn manager(&self) -> &RedisConnectionManager {
        &self.shared.manager
    }

    pub fn set_password(&self, password: impl Into<String>) {
        self.shared.manager.set_password(password);
    }

    /// Stop authenticating; connections that already did are reopened on checkout
    pub fn clear_password(&self) {
        self.shared.manager.clear_password();
    }

    pub fn set_username(&self, username: Option<String>) {
        self.shared.manager.set_username(username);
    }

    pub fn set_database(&self, database: i64) {
        self.shared.manager.set_database(database);
    }

    pub fn set_client_name(&self, client_name: Option<String>) {
        self.shared.manager.set_client_name(client_name);
    }

    /// Connections held by the pool (idle and checked out), or `None` once closed
    pub fn state(&self) -> Option<bb8::State> {
        self.pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|pool| pool.state())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn active_listeners(&self) -> u64 {
        self.shared.metrics.active_listeners()
    }

    /// Feed a master address to the pool as if a Sentinel had reported it
    pub async fn handle_master_switch(&self, master_name: &str, new_master: HostAndPort) {
        self.shared.on_master_switch(master_name, new_master).await;
    }
}

/// Resolves once the pool is closed or its handle is gone
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        let closed = *shutdown.borrow();
        if closed || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Next reported connection failure; skips over lag
async fn next_failure(failures: &mut broadcast::Receiver<ConnectionError>) -> ConnectionError {
    loop {
        match failures.recv().await {
            Ok(e) => return e,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return std::future::pending::<ConnectionError>().await
            }
        }
    }
}

impl Drop for SentinelPool {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.shared.manager.mark_closed();
            let _ = self.shutdown_tx.send(true);
        }
    }
}

impl fmt::Debug for SentinelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentinelPool")
            .field("master_name", &self.shared.master_name)
            .field("sentinels", &self.sentinels)
            .field("exhaustion", &self.exhaustion)
            .field("max_total", &self.max_total)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A borrowed connection. Dropping it, or calling [`close`](Self::close),
/// returns the connection to the pool.
pub struct PooledResource {
    conn: OwnedRedisConnection,
}

impl PooledResource {
    /// Identity of the underlying connection
    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    /// Return the connection to the pool
    pub fn close(self) {}
}

impl Deref for PooledResource {
    type Target = RedisConnection;

    fn deref(&self) -> &RedisConnection {
        &self.conn
    }
}

impl DerefMut for PooledResource {
    fn deref_mut(&mut self) -> &mut RedisConnection {
        &mut self.conn
    }
}

impl fmt::Debug for PooledResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("id", &self.conn.id())
            .field("addr", self.conn.addr())
            .finish()
    }
}

/// Fluent construction of a [`SentinelPool`]
pub struct SentinelPoolBuilder {
    master_name: String,
    sentinels: Vec<HostAndPort>,
    pool_config: PoolConfig,
    settings: ConnectionSettings,
    credentials: Credentials,
    sentinel_credentials: Credentials,
    backoff: ListenerBackoff,
    manager: Option<RedisConnectionManager>,
}

impl SentinelPoolBuilder {
    pub fn new(master_name: impl Into<String>) -> Self {
        Self {
            master_name: master_name.into(),
            sentinels: Vec::new(),
            pool_config: PoolConfig::default(),
            settings: ConnectionSettings::default(),
            credentials: Credentials::default(),
            sentinel_credentials: Credentials::default(),
            backoff: ListenerBackoff::default(),
            manager: None,
        }
    }

    pub fn sentinel(mut self, sentinel: HostAndPort) -> Self {
        self.sentinels.push(sentinel);
        self
    }

    pub fn sentinels(mut self, sentinels: impl IntoIterator<Item = HostAndPort>) -> Self {
        self.sentinels.extend(sentinels);
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn max_total(mut self, max_total: u32) -> Self {
        self.pool_config.max_total = max_total;
        self
    }

    pub fn block_when_exhausted(mut self, block: bool) -> Self {
        self.pool_config.block_when_exhausted = block;
        self
    }

    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.pool_config.max_wait_ms = Some(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.settings.socket_timeout = timeout;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.credentials.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.credentials.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: i64) -> Self {
        self.credentials.database = database;
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.credentials.client_name = Some(client_name.into());
        self
    }

    pub fn sentinel_credentials(mut self, credentials: Credentials) -> Self {
        self.sentinel_credentials = credentials;
        self
    }

    pub fn sentinel_password(mut self, password: impl Into<String>) -> Self {
        self.sentinel_credentials.password = Some(password.into());
        self
    }

    pub fn sentinel_username(mut self, username: impl Into<String>) -> Self {
        self.sentinel_credentials.username = Some(username.into());
        self
    }

    pub fn listener_backoff(mut self, backoff: ListenerBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Use an existing factory; its settings and credentials win over the builder's
    pub fn manager(mut self, manager: RedisConnectionManager) -> Self {
        self.manager = Some(manager);
        self
    }

    pub async fn build(self) -> Result<SentinelPool, SentinelPoolError> {
        if self.master_name.trim().is_empty() {
            return Err(SentinelPoolError::InvalidConfiguration(
                "master name must not be empty".to_string(),
            ));
        }
        if self.pool_config.max_total == 0 {
            return Err(SentinelPoolError::InvalidConfiguration(
                "max_total must be greater than zero".to_string(),
            ));
        }

        let mut sentinels: Vec<HostAndPort> = Vec::with_capacity(self.sentinels.len());
        for sentinel in self.sentinels {
            if !sentinels.contains(&sentinel) {
                sentinels.push(sentinel);
            }
        }
        if sentinels.is_empty() {
            return Err(SentinelPoolError::InvalidConfiguration(
                "at least one sentinel is required".to_string(),
            ));
        }

        let manager = self
            .manager
            .unwrap_or_else(|| RedisConnectionManager::new(self.settings, self.credentials));
        let settings = manager.settings();

        let discovery = discover_master(
            &self.master_name,
            &sentinels,
            &settings,
            &self.sentinel_credentials,
        )
        .await?;
        manager.set_target(discovery.master.clone());

        let pool = ConnectionPoolBuilder::build_pool(manager.clone(), &self.pool_config).await?;

        let metrics = manager.metrics();
        let shared = Arc::new(MasterState {
            master_name: self.master_name.clone(),
            current_master: tokio::sync::Mutex::new(discovery.master.clone()),
            manager,
            metrics: Arc::clone(&metrics),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listeners = discovery
            .listen_on
            .iter()
            .map(|sentinel| {
                SentinelListener::new(
                    sentinel.clone(),
                    self.master_name.clone(),
                    settings,
                    self.sentinel_credentials.clone(),
                    self.backoff,
                    Arc::clone(&shared) as Arc<dyn FailoverHandler>,
                    Arc::clone(&metrics),
                )
                .spawn(shutdown_rx.clone())
            })
            .collect::<Vec<_>>();

        info!(
            master = %self.master_name,
            address = %discovery.master,
            listeners = listeners.len(),
            "Created sentinel pool"
        );

        Ok(SentinelPool {
            shared,
            pool: RwLock::new(Some(pool)),
            listeners: Mutex::new(listeners),
            shutdown_tx,
            closed: AtomicBool::new(false),
            sentinels,
            exhaustion: self.pool_config.exhaustion_policy(),
            max_total: self.pool_config.max_total,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SentinelPoolError {
    /// No Sentinel or master could be reached
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),
    /// The network worked but the request was rejected (unknown master, bad credentials)
    #[error("Client error: {0}")]
    ClientError(String),
    #[error("Pool exhausted: no idle connection and pool is at capacity")]
    PoolExhausted,
    #[error("Timed out waiting for a pooled connection")]
    TimedOut,
    #[error("Pool is closed")]
    PoolClosed,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl SentinelPoolError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailure(_))
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ClientError(_))
    }
}

impl From<ConnectionError> for SentinelPoolError {
    fn from(e: ConnectionError) -> Self {
        if e.is_rejection() {
            SentinelPoolError::ClientError(e.to_string())
        } else {
            SentinelPoolError::ConnectionFailure(e.to_string())
        }
    }
}

impl From<ConfigError> for SentinelPoolError {
    fn from(e: ConfigError) -> Self {
        SentinelPoolError::InvalidConfiguration(e.to_string())
    }
}
