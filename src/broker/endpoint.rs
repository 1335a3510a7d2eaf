//! Broker endpoint parsing.
//!
//! Endpoints have the form `scheme://[auth@]host:port`. The scheme selects the
//! driver; a bare scheme such as `redis` means that driver's default local
//! broker.

use std::fmt;

use url::Url;

use crate::interfaces::broker::{BrokerError, Result};

/// Default broker endpoint.
pub const DEFAULT_ENDPOINT: &str = "redis://127.0.0.1:6379";

const DEFAULT_HOST: &str = "127.0.0.1";

/// Parsed broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    auth: Option<String>,
    host: String,
    port: Option<u16>,
}

impl Endpoint {
    /// Parse an endpoint string.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(invalid(endpoint, "empty endpoint"));
        }

        if !endpoint.contains(':') {
            return Ok(Self {
                scheme: endpoint.to_ascii_lowercase(),
                auth: None,
                host: DEFAULT_HOST.to_string(),
                port: None,
            });
        }

        let url = Url::parse(endpoint).map_err(|e| invalid(endpoint, &e.to_string()))?;

        // `user:secret@` authenticates with the secret; a lone `secret@` with itself.
        let auth = match (url.username(), url.password()) {
            (_, Some(password)) => Some(password.to_string()),
            ("", None) => None,
            (user, None) => Some(user.to_string()),
        };

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => DEFAULT_HOST.to_string(),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            auth,
            host,
            port: url.port(),
        })
    }

    /// Driver scheme, lowercase.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Credential passed to the broker's authentication call, if any.
    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port, falling back to `default` when the endpoint has none.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            scheme: "redis".to_string(),
            auth: None,
            host: DEFAULT_HOST.to_string(),
            port: Some(6379),
        }
    }
}

/// Renders without the credential.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, self.host, port),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

fn invalid(endpoint: &str, reason: &str) -> BrokerError {
    BrokerError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    }
}
