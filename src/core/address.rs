use std::fmt;
use std::str::FromStr;

/// A (host, port) pair identifying a Sentinel node or a Redis master
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse the host and port halves reported by a Sentinel reply or event
    pub fn from_parts(host: &str, port: &str) -> Result<Self, AddressError> {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(port.to_string()))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(AddressError::MissingHost(format!("{}:{}", host, port)));
        }
        Ok(Self::new(host, port))
    }

    /// Address string suitable for `TcpStream::connect`
    pub fn socket_addr(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostAndPort {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Bracketed IPv6: [::1]:26379
        if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
            return Self::from_parts(host, port);
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        Self::from_parts(host, port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Address '{0}' has no port")]
    MissingPort(String),
    #[error("Address '{0}' has no host")]
    MissingHost(String),
    #[error("Invalid port: {0}")]
    InvalidPort(String),
}
