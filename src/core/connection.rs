use crate::core::address::HostAndPort;
use crate::core::metrics::AtomicPoolMetrics;
use crate::core::resp::{encode_command, read_value, RespError, RespValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Optimize TCP socket for low latency
fn optimize_socket_for_latency(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);

    let socket_ref = socket2::SockRef::from(stream);
    let _ = socket_ref.set_keepalive(true);
    let _ = socket_ref.set_send_buffer_size(32768);
    let _ = socket_ref.set_recv_buffer_size(32768);
}

/// A single RESP connection to a Redis server or a Sentinel.
///
/// Every connection gets a process-unique id when it is opened. Two handles
/// with the same id refer to the same underlying socket.
#[derive(Debug)]
pub struct RedisConnection {
    id: u64,
    addr: HostAndPort,
    stream: BufReader<TcpStream>,
    socket_timeout: Duration,
    broken: bool,
    in_multi: bool,
    authenticated_as: Option<Option<String>>,
    checked_out: bool,
    credentials_version: u64,
    metrics: Option<Arc<AtomicPoolMetrics>>,
}

impl RedisConnection {
    /// Open a TCP connection, bounded by `connect_timeout`
    pub async fn connect(
        addr: &HostAndPort,
        connect_timeout: Duration,
        socket_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let result = timeout(connect_timeout, TcpStream::connect(addr.socket_addr())).await;

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ConnectionError::ConnectionFailed(format!("{}: {}", addr, e)));
            }
            Err(_) => {
                return Err(ConnectionError::Timeout(format!(
                    "connection to {} timed out after {:?}",
                    addr, connect_timeout
                )));
            }
        };

        optimize_socket_for_latency(&stream);

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = id, %addr, "Connected");

        Ok(Self {
            id,
            addr: addr.clone(),
            stream: BufReader::new(stream),
            socket_timeout,
            broken: false,
            in_multi: false,
            authenticated_as: None,
            checked_out: false,
            credentials_version: 0,
            metrics: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &HostAndPort {
        &self.addr
    }

    /// True once a transport or protocol error has been seen
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// True between a successful MULTI and the matching EXEC/DISCARD
    pub fn is_in_multi(&self) -> bool {
        self.in_multi
    }

    /// The user this connection last authenticated as (`Some(None)` for the default user)
    pub fn authenticated_as(&self) -> Option<Option<&str>> {
        self.authenticated_as.as_ref().map(|user| user.as_deref())
    }

    /// False until the connection has passed its first checkout validation
    pub(crate) fn has_been_checked_out(&self) -> bool {
        self.checked_out
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.checked_out = true;
    }

    pub(crate) fn credentials_version(&self) -> u64 {
        self.credentials_version
    }

    pub(crate) fn set_credentials_version(&mut self, version: u64) {
        self.credentials_version = version;
    }

    pub(crate) fn attach_metrics(&mut self, metrics: Arc<AtomicPoolMetrics>) {
        self.metrics = Some(metrics);
    }

    /// Write a command without waiting for its reply
    pub async fn send<S: AsRef<[u8]>>(&mut self, args: &[S]) -> Result<(), ConnectionError> {
        if self.broken {
            return Err(ConnectionError::Broken);
        }
        let payload = encode_command(args);
        let stream = self.stream.get_mut();
        let result = timeout(self.socket_timeout, async {
            stream.write_all(&payload).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.broken = true;
                Err(ConnectionError::IoError(e.to_string()))
            }
            Err(_) => {
                self.broken = true;
                Err(ConnectionError::Timeout(format!("write to {} timed out", self.addr)))
            }
        }
    }

    /// Read the next reply, bounded by the socket timeout
    pub async fn read_reply(&mut self) -> Result<RespValue, ConnectionError> {
        self.read_reply_within(Some(self.socket_timeout)).await
    }

    /// Read the next pushed value with no deadline (pub/sub)
    pub async fn read_push(&mut self) -> Result<RespValue, ConnectionError> {
        self.read_reply_within(None).await
    }

    async fn read_reply_within(
        &mut self,
        limit: Option<Duration>,
    ) -> Result<RespValue, ConnectionError> {
        if self.broken {
            return Err(ConnectionError::Broken);
        }
        let result = match limit {
            Some(limit) => match timeout(limit, read_value(&mut self.stream)).await {
                Ok(result) => result,
                Err(_) => {
                    self.broken = true;
                    return Err(ConnectionError::Timeout(format!(
                        "read from {} timed out",
                        self.addr
                    )));
                }
            },
            None => read_value(&mut self.stream).await,
        };

        result.map_err(|e| {
            self.broken = true;
            ConnectionError::from(e)
        })
    }

    /// Send a command and return its reply; error replies become `ServerError`
    pub async fn command<S: AsRef<[u8]>>(
        &mut self,
        args: &[S],
    ) -> Result<RespValue, ConnectionError> {
        self.send(args).await?;
        let reply = self.read_reply().await?;

        let name = args
            .first()
            .map(|a| String::from_utf8_lossy(a.as_ref()).to_ascii_uppercase())
            .unwrap_or_default();
        let failed = matches!(reply, RespValue::Error(_));
        match name.as_str() {
            "MULTI" if !failed => self.in_multi = true,
            // Either reply ends the transaction, including EXECABORT
            "EXEC" | "DISCARD" => self.in_multi = false,
            _ => {}
        }

        if let RespValue::Error(msg) = reply {
            return Err(ConnectionError::ServerError(msg));
        }
        Ok(reply)
    }

    /// AUTH with an optional ACL username
    pub async fn auth(
        &mut self,
        username: Option<&str>,
        password: &str,
    ) -> Result<(), ConnectionError> {
        let result = match username {
            Some(user) => self.command(&["AUTH", user, password]).await,
            None => self.command(&["AUTH", password]).await,
        };
        match result {
            Ok(_) => {
                self.authenticated_as = Some(username.map(str::to_string));
                Ok(())
            }
            Err(ConnectionError::ServerError(msg)) => Err(ConnectionError::AuthFailed(msg)),
            Err(e) => Err(e),
        }
    }

    pub async fn select(&mut self, database: i64) -> Result<(), ConnectionError> {
        self.command(&["SELECT", &database.to_string()]).await?;
        Ok(())
    }

    pub async fn client_setname(&mut self, name: &str) -> Result<(), ConnectionError> {
        self.command(&["CLIENT", "SETNAME", name]).await?;
        Ok(())
    }

    pub async fn client_getname(&mut self) -> Result<Option<String>, ConnectionError> {
        Ok(self.command(&["CLIENT", "GETNAME"]).await?.into_string())
    }

    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        let reply = self.command(&["PING"]).await?;
        // PONG normally, QUEUED inside MULTI
        match reply.as_str() {
            Some(_) => Ok(()),
            None => Err(ConnectionError::Protocol(format!(
                "unexpected PING reply: {:?}",
                reply
            ))),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<String>, ConnectionError> {
        Ok(self.command(&["GET", key]).await?.into_string())
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<(), ConnectionError> {
        self.command(&["SET", key, value]).await?;
        Ok(())
    }

    pub async fn multi(&mut self) -> Result<(), ConnectionError> {
        self.command(&["MULTI"]).await?;
        Ok(())
    }

    pub async fn discard(&mut self) -> Result<(), ConnectionError> {
        self.command(&["DISCARD"]).await?;
        Ok(())
    }

    /// Drop transaction state left behind by a previous borrower
    pub async fn reset_state(&mut self) -> Result<(), ConnectionError> {
        if self.in_multi {
            tracing::debug!(connection_id = self.id, "Discarding dangling MULTI");
            self.discard().await?;
        }
        Ok(())
    }

    /// Subscribe to a channel and wait for the confirmation
    pub async fn subscribe(&mut self, channel: &str) -> Result<(), ConnectionError> {
        self.send(&["SUBSCRIBE", channel]).await?;
        match self.read_reply().await? {
            RespValue::Array(items)
                if items
                    .first()
                    .and_then(|v| v.as_str())
                    .map(|kind| kind.eq_ignore_ascii_case("subscribe"))
                    .unwrap_or(false) =>
            {
                Ok(())
            }
            RespValue::Error(msg) => Err(ConnectionError::ServerError(msg)),
            other => Err(ConnectionError::Protocol(format!(
                "unexpected SUBSCRIBE reply: {:?}",
                other
            ))),
        }
    }

    /// Wait for the next pub/sub message, returning (channel, payload)
    pub async fn next_message(&mut self) -> Result<(String, Vec<u8>), ConnectionError> {
        loop {
            if let RespValue::Array(mut items) = self.read_push().await? {
                let is_message = items
                    .first()
                    .and_then(|v| v.as_str())
                    .map(|kind| kind.eq_ignore_ascii_case("message"))
                    .unwrap_or(false);
                if is_message && items.len() == 3 {
                    let payload = match items.pop() {
                        Some(RespValue::BulkString(data)) => data,
                        _ => continue,
                    };
                    let channel = items.pop().and_then(|v| v.into_string()).unwrap_or_default();
                    return Ok((channel, payload));
                }
            }
        }
    }

    /// Close the connection, sending QUIT first. Errors are swallowed.
    pub async fn close(mut self) {
        if !self.broken {
            if let Err(e) = self.command(&["QUIT"]).await {
                tracing::debug!(connection_id = self.id, "QUIT failed during close: {}", e);
            }
        }
        let _ = self.stream.get_mut().shutdown().await;
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        tracing::debug!(connection_id = self.id, addr = %self.addr, "Connection closed");
        if let Some(metrics) = &self.metrics {
            metrics.record_connection_closed();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("Server error: {0}")]
    ServerError(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Connection is broken")]
    Broken,
    #[error("Connection is invalid: {0}")]
    ConnectionInvalid(String),
}

impl ConnectionError {
    /// The network path worked but the server rejected the request
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::AuthFailed(_) | Self::ServerError(_))
    }
}

impl From<RespError> for ConnectionError {
    fn from(e: RespError) -> Self {
        match e {
            RespError::Io(e) => ConnectionError::IoError(e.to_string()),
            RespError::ConnectionClosed => {
                ConnectionError::IoError("connection closed by peer".to_string())
            }
            RespError::Protocol(msg) => ConnectionError::Protocol(msg),
        }
    }
}
