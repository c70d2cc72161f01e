use crate::core::address::HostAndPort;
use crate::core::connection::{ConnectionError, RedisConnection};
use crate::core::connection_pool::{ConnectionSettings, Credentials};
use crate::core::resp::RespValue;
use crate::core::sentinel_pool::SentinelPoolError;

/// Result of asking the Sentinels where the master lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub master: HostAndPort,
    /// Sentinels that were not found unreachable during discovery
    pub listen_on: Vec<HostAndPort>,
}

/// Open a connection to a Sentinel and authenticate if credentials are configured
pub async fn open_sentinel_connection(
    sentinel: &HostAndPort,
    settings: &ConnectionSettings,
    credentials: &Credentials,
) -> Result<RedisConnection, ConnectionError> {
    let mut conn =
        RedisConnection::connect(sentinel, settings.connect_timeout, settings.socket_timeout)
            .await?;
    if let Some(password) = &credentials.password {
        conn.auth(credentials.username.as_deref(), password).await?;
    }
    if let Some(name) = &credentials.client_name {
        conn.client_setname(name).await?;
    }
    Ok(conn)
}

/// `SENTINEL get-master-addr-by-name`; `Ok(None)` when the name is not monitored
pub async fn query_master_address(
    sentinel: &HostAndPort,
    master_name: &str,
    settings: &ConnectionSettings,
    credentials: &Credentials,
) -> Result<Option<HostAndPort>, ConnectionError> {
    let mut conn = open_sentinel_connection(sentinel, settings, credentials).await?;
    let reply = conn
        .command(&["SENTINEL", "get-master-addr-by-name", master_name])
        .await?;
    conn.close().await;
    parse_master_reply(reply)
}

fn parse_master_reply(reply: RespValue) -> Result<Option<HostAndPort>, ConnectionError> {
    match reply {
        RespValue::Null => Ok(None),
        RespValue::Array(items) if items.is_empty() => Ok(None),
        RespValue::Array(items) if items.len() == 2 => {
            let host = items[0].as_str().unwrap_or_default();
            let port = items[1].as_str().unwrap_or_default();
            HostAndPort::from_parts(host, port)
                .map(Some)
                .map_err(|e| ConnectionError::Protocol(format!("bad master address: {}", e)))
        }
        other => Err(ConnectionError::Protocol(format!(
            "unexpected get-master-addr-by-name reply: {:?}",
            other
        ))),
    }
}

/// Ask each Sentinel in turn; the first one that knows `master_name` wins.
///
/// Every Sentinel unreachable yields `ConnectionFailure`. At least one answering
/// but none knowing the name yields `ClientError`.
pub async fn discover_master(
    master_name: &str,
    sentinels: &[HostAndPort],
    settings: &ConnectionSettings,
    credentials: &Credentials,
) -> Result<Discovery, SentinelPoolError> {
    let mut unreachable: Vec<&HostAndPort> = Vec::new();
    let mut sentinel_available = false;
    let mut last_error = None;

    tracing::info!(master = master_name, "Trying to find master from available sentinels");

    for sentinel in sentinels {
        tracing::debug!(%sentinel, "Connecting to sentinel");

        match query_master_address(sentinel, master_name, settings, credentials).await {
            Ok(Some(master)) => {
                tracing::info!(master = master_name, %master, %sentinel, "Found master");
                let listen_on = sentinels
                    .iter()
                    .filter(|s| !unreachable.contains(s))
                    .cloned()
                    .collect();
                return Ok(Discovery { master, listen_on });
            }
            Ok(None) => {
                sentinel_available = true;
                tracing::warn!(%sentinel, "Master '{}' is unknown to sentinel", master_name);
            }
            Err(e) if e.is_rejection() => {
                sentinel_available = true;
                tracing::warn!(%sentinel, "Sentinel rejected the request: {}", e);
                last_error = Some(e);
            }
            Err(e) => {
                tracing::warn!(%sentinel, "Cannot get master address from sentinel: {}", e);
                unreachable.push(sentinel);
                last_error = Some(e);
            }
        }
    }

    if sentinel_available {
        Err(SentinelPoolError::ClientError(format!(
            "Can connect to sentinel, but '{}' seems to be not monitored{}",
            master_name,
            last_error.map(|e| format!(" ({})", e)).unwrap_or_default()
        )))
    } else {
        Err(SentinelPoolError::ConnectionFailure(format!(
            "All sentinels down, cannot determine where '{}' master is running{}",
            master_name,
            last_error.map(|e| format!(": {}", e)).unwrap_or_default()
        )))
    }
}
