use crate::config::PoolConfig;
use crate::core::address::HostAndPort;
use crate::core::connection::{ConnectionError, RedisConnection};
use crate::core::metrics::AtomicPoolMetrics;
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;

/// Effectively "wait forever" for bb8, which always needs a checkout deadline
const BLOCK_INDEFINITELY: Duration = Duration::from_secs(60 * 60 * 24 * 365);

const FAILURE_CHANNEL_CAPACITY: usize = 16;

/// Authentication and session settings applied to every new connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: i64,
    pub client_name: Option<String>,
}

impl Credentials {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            socket_timeout: Duration::from_millis(2000),
        }
    }
}

/// What a borrow does when no idle connection exists and the pool is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    Block,
    BlockWithTimeout(Duration),
    FailFast,
}

impl ExhaustionPolicy {
    /// Checkout deadline handed to bb8
    pub(crate) fn checkout_timeout(&self, settings: &ConnectionSettings) -> Duration {
        match self {
            ExhaustionPolicy::Block => BLOCK_INDEFINITELY,
            ExhaustionPolicy::BlockWithTimeout(wait) => *wait,
            // Enough to open a fresh connection when there is capacity for one
            ExhaustionPolicy::FailFast => settings.connect_timeout + settings.socket_timeout,
        }
    }
}

#[derive(Debug)]
struct VersionedCredentials {
    credentials: Credentials,
    version: u64,
}

#[derive(Debug)]
struct FactoryState {
    target: RwLock<Option<HostAndPort>>,
    credentials: RwLock<VersionedCredentials>,
    closed: AtomicBool,
    // Connect failures, and validation failures of never-used connections
    failures: broadcast::Sender<ConnectionError>,
}

/// Connection manager for bb8 that opens authenticated connections to the current master.
///
/// Clones share the same target and credentials, so a handle kept by the caller
/// can rotate credentials on a live pool.
#[derive(Debug, Clone)]
pub struct RedisConnectionManager {
    settings: ConnectionSettings,
    state: Arc<FactoryState>,
    metrics: Arc<AtomicPoolMetrics>,
}

impl RedisConnectionManager {
    /// Create a manager with no target; the sentinel pool points it at the master
    pub fn new(settings: ConnectionSettings, credentials: Credentials) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            settings,
            state: Arc::new(FactoryState {
                target: RwLock::new(None),
                credentials: RwLock::new(VersionedCredentials {
                    credentials,
                    version: 1,
                }),
                closed: AtomicBool::new(false),
                failures,
            }),
            metrics: Arc::new(AtomicPoolMetrics::new()),
        }
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    pub fn metrics(&self) -> Arc<AtomicPoolMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn target(&self) -> Option<HostAndPort> {
        self.read_target().clone()
    }

    /// Point new connections at `target`; existing ones to another address become invalid
    pub fn set_target(&self, target: HostAndPort) {
        let mut current = self
            .state
            .target
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if current.as_ref() != Some(&target) {
            tracing::info!(%target, "Connection factory retargeted");
            *current = Some(target);
        }
    }

    /// Snapshot of the current credentials
    pub fn credentials(&self) -> Credentials {
        self.read_credentials().credentials.clone()
    }

    pub fn set_password(&self, password: impl Into<String>) {
        let password = password.into();
        self.update_credentials(|c| c.password = Some(password));
    }

    pub fn clear_password(&self) {
        self.update_credentials(|c| c.password = None);
    }

    pub fn set_username(&self, username: Option<String>) {
        self.update_credentials(|c| c.username = username);
    }

    pub fn set_database(&self, database: i64) {
        self.update_credentials(|c| c.database = database);
    }

    pub fn set_client_name(&self, client_name: Option<String>) {
        self.update_credentials(|c| c.client_name = client_name);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.state.closed.store(true, Ordering::Release);
    }

    /// Errors that mean a new connection to the master could not be produced.
    ///
    /// bb8 opens connections in background tasks and only hands their errors
    /// to its error sink, so a waiting borrower listens here instead.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<ConnectionError> {
        self.state.failures.subscribe()
    }

    fn report_failure(&self, error: &ConnectionError) {
        if !self.is_closed() {
            // No receiver just means nobody is waiting
            let _ = self.state.failures.send(error.clone());
        }
    }

    fn update_credentials(&self, apply: impl FnOnce(&mut Credentials)) {
        let mut guard = self.write_credentials();
        apply(&mut guard.credentials);
        guard.version += 1;
        tracing::debug!(version = guard.version, "Credentials updated");
    }

    fn credentials_snapshot(&self) -> (Credentials, u64) {
        let guard = self.read_credentials();
        (guard.credentials.clone(), guard.version)
    }

    fn read_target(&self) -> RwLockReadGuard<'_, Option<HostAndPort>> {
        self.state.target.read().unwrap_or_else(|e| e.into_inner())
    }

    fn read_credentials(&self) -> RwLockReadGuard<'_, VersionedCredentials> {
        self.state
            .credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write_credentials(&self) -> RwLockWriteGuard<'_, VersionedCredentials> {
        self.state
            .credentials
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Why `conn` can no longer be used, if it can't
    fn stale_reason(&self, conn: &RedisConnection) -> Option<String> {
        if self.is_closed() {
            return Some("pool is closed".to_string());
        }
        if conn.is_broken() {
            return Some("transport is broken".to_string());
        }
        match self.read_target().as_ref() {
            Some(target) if target == conn.addr() => None,
            Some(target) => Some(format!(
                "connected to {} but master is now {}",
                conn.addr(),
                target
            )),
            None => Some("no master address configured".to_string()),
        }
    }

    async fn apply_credentials(
        &self,
        conn: &mut RedisConnection,
        credentials: &Credentials,
        fresh: bool,
    ) -> Result<(), ConnectionError> {
        if let Some(password) = &credentials.password {
            conn.auth(credentials.username.as_deref(), password).await?;
        }
        // A fresh connection already sits on database 0
        if !fresh || credentials.database != 0 {
            conn.select(credentials.database).await?;
        }
        if let Some(name) = &credentials.client_name {
            conn.client_setname(name).await?;
        }
        Ok(())
    }

    async fn open(&self) -> Result<RedisConnection, ConnectionError> {
        let target = self.target().ok_or_else(|| {
            ConnectionError::ConnectionFailed("no master address configured".to_string())
        })?;
        let (credentials, version) = self.credentials_snapshot();

        let mut conn = RedisConnection::connect(
            &target,
            self.settings.connect_timeout,
            self.settings.socket_timeout,
        )
        .await?;
        self.apply_credentials(&mut conn, &credentials, true).await?;
        conn.set_credentials_version(version);
        Ok(conn)
    }

    async fn revalidate(&self, conn: &mut RedisConnection) -> Result<(), ConnectionError> {
        conn.reset_state().await?;

        let (credentials, version) = self.credentials_snapshot();
        if conn.credentials_version() != version {
            if let Some(reason) = lost_identity(conn, &credentials) {
                return Err(ConnectionError::ConnectionInvalid(reason));
            }
            tracing::debug!(
                connection_id = conn.id(),
                "Re-applying changed credentials to pooled connection"
            );
            self.apply_credentials(conn, &credentials, false).await?;
            conn.set_credentials_version(version);
        }

        conn.ping().await
    }
}

/// Why `conn` cannot be moved onto `credentials` without reconnecting.
///
/// AUTH can switch users but never log a connection out, so dropping the
/// password (or the ACL user) needs a fresh connection.
fn lost_identity(conn: &RedisConnection, credentials: &Credentials) -> Option<String> {
    match conn.authenticated_as() {
        Some(_) if credentials.password.is_none() => {
            Some("password removed from an authenticated connection".to_string())
        }
        Some(Some(user)) if credentials.username.is_none() => {
            Some(format!("username '{}' removed from an authenticated connection", user))
        }
        _ => None,
    }
}

#[async_trait]
impl bb8::ManageConnection for RedisConnectionManager {
    type Connection = RedisConnection;
    type Error = ConnectionError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        if self.is_closed() {
            return Err(ConnectionError::ConnectionFailed("pool is closed".to_string()));
        }
        self.metrics.record_connection_attempt();

        match self.open().await {
            Ok(mut conn) => {
                self.metrics.record_connection_success();
                conn.attach_metrics(self.metrics());
                tracing::debug!(connection_id = conn.id(), addr = %conn.addr(), "Pooled connection created");
                Ok(conn)
            }
            Err(e) => {
                self.metrics.record_connection_failure();
                tracing::warn!("Failed to create pooled connection: {}", e);
                self.report_failure(&e);
                Err(e)
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let result = match self.stale_reason(conn) {
            Some(reason) => Err(ConnectionError::ConnectionInvalid(reason)),
            None => {
                let result = self.revalidate(conn).await;
                // A brand-new connection failing here will fail again when replaced
                if let Err(e) = &result {
                    if !conn.has_been_checked_out() {
                        self.report_failure(e);
                    }
                }
                result
            }
        };

        match &result {
            Ok(()) => conn.mark_checked_out(),
            Err(_) => self.metrics.record_validation_failure(),
        }
        result
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        match self.stale_reason(conn) {
            Some(reason) => {
                tracing::debug!(connection_id = conn.id(), "Dropping returned connection: {}", reason);
                true
            }
            None => false,
        }
    }
}

/// Routes bb8 background errors (failed validations, replenish failures) to tracing
#[derive(Debug, Clone, Copy)]
struct TracingErrorSink;

impl bb8::ErrorSink<ConnectionError> for TracingErrorSink {
    fn sink(&self, error: ConnectionError) {
        tracing::warn!("Evicted pooled connection: {}", error);
    }

    fn boxed_clone(&self) -> Box<dyn bb8::ErrorSink<ConnectionError>> {
        Box::new(*self)
    }
}

/// Type alias for our connection pool
pub type RedisPool = Pool<RedisConnectionManager>;

/// A connection checked out of the pool, independent of any borrow of the pool handle
pub type OwnedRedisConnection = PooledConnection<'static, RedisConnectionManager>;

/// Builder for creating connection pools
pub struct ConnectionPoolBuilder;

impl ConnectionPoolBuilder {
    /// Create a new connection pool with the given configuration
    pub async fn build_pool(
        manager: RedisConnectionManager,
        config: &PoolConfig,
    ) -> Result<RedisPool, ConnectionError> {
        let checkout_timeout = config
            .exhaustion_policy()
            .checkout_timeout(&manager.settings());

        Pool::builder()
            .max_size(config.max_total)
            .min_idle(Some(config.min_idle).filter(|n| *n > 0))
            .test_on_check_out(true)
            // One attempt per connection; failures reach borrowers via subscribe_failures
            .retry_connection(false)
            .connection_timeout(checkout_timeout)
            .idle_timeout(config.idle_timeout_secs.map(Duration::from_secs))
            .max_lifetime(config.max_lifetime_secs.map(Duration::from_secs))
            .error_sink(Box::new(TracingErrorSink))
            .build(manager)
            .await
    }
}
