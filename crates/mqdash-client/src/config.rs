//! Client configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// TLS settings for the broker connection.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM file with CA certificates. Public web roots are used when unset.
    pub ca_cert: Option<PathBuf>,
    /// Name to verify the server certificate against (defaults to the host).
    pub server_name: Option<String>,
    /// Accept any server certificate. Only for self-signed test brokers.
    pub accept_invalid_certs: bool,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote broker address (host:port).
    pub address: String,
    /// Client identifier.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Largest inbound packet accepted (0 = no limit).
    pub max_packet_size: usize,
    /// TLS settings; plain TCP when `None`.
    pub tls: Option<TlsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            max_packet_size: 0,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: Option<impl Into<Vec<u8>>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = password.map(Into::into);
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable TLS.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Host part of `address`, used as the default TLS server name.
    pub(crate) fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.address,
        }
    }
}
